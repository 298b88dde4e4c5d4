use thiserror::Error;

/// Exit code reported when a step's command could not be started at all,
/// as opposed to running and failing.
pub const EXIT_COULD_NOT_START: i32 = 127;

/// Terminal failure of a build. Every variant aborts the build; none are
/// retried here. Retrying is the caller's business.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Context preparation failed before any step ran: inaccessible files,
    /// illegal ignore patterns, or similar.
    #[error("Error checking context: '{0}'")]
    Context(String),

    /// The recipe text could not be parsed.
    #[error("Dockerfile parse error line {line}: {message}")]
    Parse { line: usize, message: String },

    /// A variable reference inside an instruction was malformed.
    #[error("failed to process \"{word}\": {message}")]
    Expansion { word: String, message: String },

    /// A glob pattern was malformed.
    #[error("bad pattern: {0}")]
    Pattern(String),

    /// A step ran (or could not be started) and failed. `exit_code` is the
    /// command's own code when it ran, `EXIT_COULD_NOT_START` otherwise.
    #[error("{message}")]
    Execution { message: String, exit_code: i32 },

    /// Finalizing the image failed.
    #[error("{0}")]
    Commit(String),
}

impl BuildError {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        BuildError::Parse {
            line,
            message: message.into(),
        }
    }

    /// A generic fatal execution error reported with exit code 1. Failures
    /// carrying the command's own code construct the variant directly.
    pub fn execution(message: impl Into<String>) -> Self {
        BuildError::Execution {
            message: message.into(),
            exit_code: 1,
        }
    }

    /// Exit code the CLI should report for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Execution { exit_code, .. } => *exit_code,
            _ => 1,
        }
    }
}

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

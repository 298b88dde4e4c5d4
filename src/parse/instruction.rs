use std::fmt;

/// Argument form of RUN/CMD/ENTRYPOINT: one shell string handed to the
/// configured shell at run time, or a JSON argv executed directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandExpr {
    Shell(String),
    Exec(Vec<String>),
}

/// One `key=value` assignment, value still carrying its quoting; quotes are
/// stripped during expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// The closed instruction set. Dispatch is an exhaustive match, never a
/// string comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    From {
        image: String,
        alias: Option<String>,
    },
    Run {
        expr: CommandExpr,
    },
    Cmd {
        expr: CommandExpr,
    },
    Entrypoint {
        expr: CommandExpr,
    },
    Copy {
        sources: Vec<String>,
        destination: String,
    },
    Add {
        sources: Vec<String>,
        destination: String,
    },
    Env {
        vars: Vec<KeyValue>,
    },
    Arg {
        name: String,
        default: Option<String>,
    },
    Label {
        labels: Vec<KeyValue>,
    },
    Workdir {
        path: String,
    },
    User {
        spec: String,
    },
    Volume {
        args: String,
    },
    Expose {
        args: String,
    },
    Onbuild {
        trigger: String,
    },
    Shell {
        shell: Vec<String>,
    },
    StopSignal {
        signal: String,
    },
    Maintainer {
        name: String,
    },
}

impl Instruction {
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Run { .. } => "RUN",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Copy { .. } => "COPY",
            Instruction::Add { .. } => "ADD",
            Instruction::Env { .. } => "ENV",
            Instruction::Arg { .. } => "ARG",
            Instruction::Label { .. } => "LABEL",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::User { .. } => "USER",
            Instruction::Volume { .. } => "VOLUME",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Onbuild { .. } => "ONBUILD",
            Instruction::Shell { .. } => "SHELL",
            Instruction::StopSignal { .. } => "STOPSIGNAL",
            Instruction::Maintainer { .. } => "MAINTAINER",
        }
    }
}

/// A parsed instruction with the line it started on and the original
/// (joined) text, kept for progress output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionLine {
    pub instruction: Instruction,
    pub line: usize,
    pub raw: String,
}

impl fmt::Display for InstructionLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Tries the JSON-array argument form. Anything that is not a JSON array of
/// strings, including single-quoted pseudo-arrays and arrays holding
/// non-strings, falls through to the shell form.
pub fn parse_json_argv(rest: &str) -> Option<Vec<String>> {
    let trimmed = rest.trim();
    if !trimmed.starts_with('[') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    let items = value.as_array()?;
    let mut argv = Vec::with_capacity(items.len());
    for item in items {
        argv.push(item.as_str()?.to_string());
    }
    Some(argv)
}

/// RUN/CMD/ENTRYPOINT arguments: JSON argv when it parses as one, otherwise
/// the whole rest of the line as a shell string.
pub fn parse_command_expr(rest: &str) -> CommandExpr {
    match parse_json_argv(rest) {
        Some(argv) => CommandExpr::Exec(argv),
        None => CommandExpr::Shell(rest.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_argv() {
        assert_eq!(
            parse_json_argv(r#"["echo", "hi"]"#),
            Some(vec!["echo".to_string(), "hi".to_string()])
        );
        assert_eq!(parse_json_argv(r#"[]"#), Some(vec![]));
    }

    #[test]
    fn test_single_quoted_pseudo_array_falls_through() {
        assert_eq!(parse_json_argv("['echo', 'hi']"), None);
        match parse_command_expr("['echo', 'hi']") {
            CommandExpr::Shell(s) => assert_eq!(s, "['echo', 'hi']"),
            other => panic!("expected shell form, got {other:?}"),
        }
    }

    #[test]
    fn test_non_string_array_falls_through() {
        assert_eq!(parse_json_argv("[1, 2]"), None);
    }

    #[test]
    fn test_shell_form() {
        match parse_command_expr("echo hi there") {
            CommandExpr::Shell(s) => assert_eq!(s, "echo hi there"),
            other => panic!("expected shell form, got {other:?}"),
        }
    }
}

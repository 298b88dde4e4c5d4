use std::path::PathBuf;

use anyhow::{Result, bail};

use crate::build::user::UserSpec;

pub mod local;

pub use local::LocalRuntime;

/// What to do with a step's working rootfs afterwards. Successful steps
/// normally clean up; --keep preserves everything for debugging and
/// --force-rm removes even failed steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovalPolicy {
    #[default]
    OnSuccess,
    Always,
    Never,
}

impl RemovalPolicy {
    pub fn from_flags(force_rm: bool, keep: bool) -> Self {
        match (force_rm, keep) {
            (_, true) => Self::Never,
            (true, _) => Self::Always,
            _ => Self::OnSuccess,
        }
    }

    pub fn should_remove(&self, succeeded: bool) -> bool {
        match self {
            Self::OnSuccess => succeeded,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// One RUN command against a composed rootfs. `rootfs_layers` are extracted
/// layer directories, bottom-up.
#[derive(Debug)]
pub struct RunRequest {
    pub rootfs_layers: Vec<PathBuf>,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub workdir: String,
    pub user: Option<UserSpec>,
    pub removal: RemovalPolicy,
}

/// The result of a run: the process exit code and, when the command changed
/// the filesystem, a directory holding exactly those changes.
#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub diff_dir: Option<PathBuf>,
}

/// One COPY/ADD source landing at a destination inside the image.
#[derive(Debug, Clone)]
pub struct CopyItem {
    /// Absolute path of the source on the host, already vetted against the
    /// build context.
    pub src: PathBuf,
    /// Destination path inside the image, absolute.
    pub dest: String,
    /// Unpack recognized archives instead of copying the file (ADD).
    pub extract: bool,
}

#[derive(Debug)]
pub struct MaterializeRequest {
    pub items: Vec<CopyItem>,
    pub chown: Option<(u32, u32)>,
}

/// Executes commands and file placement for build steps. The executor never
/// touches rootfs mechanics itself; chroot, user namespaces, or a full
/// container runtime all fit behind this seam.
pub trait RuntimeExecutor {
    fn run(&self, request: RunRequest) -> Result<RunOutcome>;

    /// Lays files into a fresh diff directory and returns it.
    fn materialize(&self, request: MaterializeRequest) -> Result<PathBuf>;
}

/// Fetches remote ADD sources. Builds run network-free by default.
pub trait RemoteFetcher {
    fn fetch(&self, url: &str) -> Result<PathBuf>;
}

/// Default fetcher: refuses, keeping builds hermetic unless the caller
/// wires in a real one.
#[derive(Debug, Default)]
pub struct DisabledFetcher;

impl RemoteFetcher for DisabledFetcher {
    fn fetch(&self, url: &str) -> Result<PathBuf> {
        bail!("remote sources are not enabled, cannot fetch {url}")
    }
}

use std::collections::HashMap;
use std::path::PathBuf;

use crate::runtime::RemovalPolicy;

pub mod args;
pub mod cache;
pub mod executor;
pub mod image_config;
pub mod stage_executor;
pub mod user;

pub use executor::{BuildReport, Executor};

/// Per-invocation build settings, assembled by the CLI.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub tags: Vec<String>,
    pub build_args: HashMap<String, String>,
    pub labels: Vec<(String, String)>,
    pub no_cache: bool,
    pub cache_from: Vec<String>,
    pub removal: RemovalPolicy,
    /// Where the step cache index lives, normally inside the layer store.
    pub cache_index: PathBuf,
}

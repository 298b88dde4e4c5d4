use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use std::{fs, path::PathBuf};

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::new().expect("Failed to initialize configuration"));

static STORE_PATH: &str = "/var/lib/imgbuild/store";

#[derive(Debug)]
pub struct Config {
    pub store_root: PathBuf,
    pub is_root: bool,
}

impl Config {
    pub fn new() -> Result<Self> {
        let is_root = nix::unistd::getuid().is_root();

        let store_root = if is_root {
            PathBuf::from(STORE_PATH)
        } else {
            dirs::data_dir()
                .context("Failed to get user data directory")?
                .join("imgbuild")
                .join("store")
        };

        fs::create_dir_all(&store_root)
            .with_context(|| format!("Failed to create layer store root at {store_root:?}"))?;

        Ok(Self {
            store_root,
            is_root,
        })
    }
}

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::{Rng, distr::Alphanumeric};
use tracing::debug;

use crate::build::{BuildOptions, Executor};
use crate::config::CONFIG;
use crate::context::{BuildContext, ignore};
use crate::parse::Recipe;
use crate::runtime::{DisabledFetcher, LocalRuntime, RemovalPolicy};
use crate::store::LocalLayerStore;

#[derive(Parser, Debug)]
#[command(about = "Build an image from a Dockerfile and a context directory")]
pub struct BuildCli {
    /// Dockerfile or Containerfile
    #[arg(short, long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Name (and optionally tag) of the resulting image, repeatable
    #[arg(short, long, value_name = "IMAGE NAME")]
    tag: Vec<String>,

    /// Build-time variable as name=value, repeatable
    #[arg(long = "build-arg", value_name = "NAME=VALUE")]
    build_arg: Vec<String>,

    /// Label for the resulting image as name=value, repeatable
    #[arg(long, value_name = "NAME=VALUE")]
    label: Vec<String>,

    /// Execute every step even when a cached result exists
    #[arg(long)]
    no_cache: bool,

    /// Image whose recorded steps seed the cache, repeatable
    #[arg(long = "cache-from", value_name = "IMAGE")]
    cache_from: Vec<String>,

    /// Remove intermediate rootfs directories even on failure
    #[arg(long)]
    force_rm: bool,

    /// Keep intermediate rootfs directories for inspection
    #[arg(long)]
    keep: bool,

    /// Layer store root, defaults to the per-user store
    #[arg(long, value_name = "DIR")]
    store: Option<PathBuf>,

    /// Export the built image as an OCI layout into this directory
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Turn debugging information on
    #[arg(short, long)]
    pub debug: bool,

    /// Build context directory
    #[arg(value_name = "PATH", default_value = ".")]
    path: PathBuf,
}

impl BuildCli {
    pub fn execute(&self) -> Result<()> {
        let context_dir = self
            .path
            .canonicalize()
            .with_context(|| format!("unable to resolve context path {}", self.path.display()))?;

        let recipe_path = self.locate_recipe(&context_dir)?;
        let recipe_text = fs::read_to_string(&recipe_path)
            .with_context(|| format!("Failed to read {}", recipe_path.display()))?;
        let recipe = Recipe::parse(&recipe_text)
            .with_context(|| format!("Failed to parse {}", recipe_path.display()))?;

        let ignore_text = match fs::read_to_string(context_dir.join(ignore::IGNORE_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", ignore::IGNORE_FILE));
            }
        };
        let rules = ignore::parse(&ignore_text)?;

        let recipe_rel = recipe_path
            .strip_prefix(&context_dir)
            .ok()
            .and_then(|p| p.to_str().map(str::to_string));
        let context = BuildContext::prepare(&context_dir, &rules, recipe_rel.as_deref())?;
        debug!(files = context.entries().len(), "prepared build context");

        let store_root = self
            .store
            .clone()
            .unwrap_or_else(|| CONFIG.store_root.clone());
        let mut store = LocalLayerStore::open(&store_root)?;
        let runtime = LocalRuntime::new(store.work_dir());
        let fetcher = DisabledFetcher;

        let tags = if self.tag.is_empty() {
            vec![format!("{}:latest", random_name())]
        } else {
            self.tag.clone()
        };

        let options = BuildOptions {
            build_args: self
                .build_arg
                .iter()
                .map(|raw| split_pair(raw, "--build-arg"))
                .collect::<Result<_>>()?,
            labels: self
                .label
                .iter()
                .map(|raw| split_pair(raw, "--label"))
                .collect::<Result<_>>()?,
            tags: tags.clone(),
            no_cache: self.no_cache,
            cache_from: self.cache_from.clone(),
            removal: RemovalPolicy::from_flags(self.force_rm, self.keep),
            cache_index: store.cache_index_path(),
        };

        let report =
            Executor::new(&mut store, &runtime, &fetcher, &context, options).build(&recipe)?;

        if let Some(output_dir) = &self.output_dir {
            let layout_dir = output_dir.join(tags[0].replace([':', '/'], "_"));
            if fs::metadata(&layout_dir).is_ok() {
                fs::remove_dir_all(&layout_dir).with_context(|| {
                    format!("Failed to remove existing directory: {}", layout_dir.display())
                })?;
            }
            fs::create_dir_all(&layout_dir).with_context(|| {
                format!("Failed to create output directory: {}", layout_dir.display())
            })?;
            store.export_oci(&report.image_id, &layout_dir)?;
            println!("Exported {} to {}", &tags[0], layout_dir.display());
        }

        Ok(())
    }

    fn locate_recipe(&self, context_dir: &Path) -> Result<PathBuf> {
        if let Some(file) = &self.file {
            return file
                .canonicalize()
                .with_context(|| format!("Failed to read Dockerfile: {}", file.display()));
        }
        for name in ["Dockerfile", "Containerfile"] {
            let candidate = context_dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        bail!(
            "cannot locate Dockerfile or Containerfile in {}",
            context_dir.display()
        )
    }
}

fn random_name() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

fn split_pair(raw: &str, flag: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => bail!("{flag} requires a name=value pair, got \"{raw}\""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = BuildCli::parse_from(vec![
            "imgbuild",
            "-f",
            "custom.Dockerfile",
            "-t",
            "app:1.0",
            "-t",
            "app:latest",
            "--build-arg",
            "VERSION=1.0",
            "--no-cache",
            "ctx",
        ]);
        assert_eq!(cli.file, Some(PathBuf::from("custom.Dockerfile")));
        assert_eq!(cli.tag, vec!["app:1.0", "app:latest"]);
        assert_eq!(cli.build_arg, vec!["VERSION=1.0"]);
        assert!(cli.no_cache);
        assert_eq!(cli.path, PathBuf::from("ctx"));
    }

    #[test]
    fn test_split_pair() {
        assert_eq!(
            split_pair("a=b=c", "--label").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
        assert_eq!(
            split_pair("empty=", "--label").unwrap(),
            ("empty".to_string(), String::new())
        );
        assert!(split_pair("noequals", "--build-arg").is_err());
        assert!(split_pair("=value", "--build-arg").is_err());
    }

    #[test]
    fn test_random_name_is_taggable() {
        let name = random_name();
        assert_eq!(name.len(), 10);
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(name, name.to_lowercase());
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::build::cache::CachedStep;
use crate::build::image_config::ImageConfig;

pub mod local;
pub mod oci;

pub use local::LocalLayerStore;

/// One content-addressed filesystem layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// sha256 of the compressed blob.
    pub digest: String,
    /// sha256 of the uncompressed tar, the diff id recorded in the config.
    pub diff_id: String,
    pub size: u64,
}

/// A resolved base image: its identity, layer stack bottom-up, and the
/// runtime configuration builds inherit from it.
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub image_id: String,
    pub layers: Vec<Layer>,
    pub config: ImageConfig,
}

/// Where layers and committed images live. The build executor only talks to
/// this trait; the local directory store is one implementation, a registry-
/// backed store would be another.
pub trait LayerStore {
    /// Looks up an image by tag or id. `Ok(None)` means unknown, which the
    /// caller may treat as fatal or fall back on.
    fn resolve_base(&self, reference: &str) -> Result<Option<BaseImage>>;

    /// Archives a populated diff directory into a layer blob, deduplicating
    /// by digest.
    fn put_layer(&mut self, diff_dir: &Path) -> Result<Layer>;

    /// The extracted directory for a stored layer, for rootfs composition.
    fn layer_dir(&mut self, layer: &Layer) -> Result<PathBuf>;

    /// Commits a finished image: config, layer stack, tags, and the step
    /// fingerprints that produced it (consumed later by --cache-from).
    /// Returns the image id.
    fn commit_image(
        &mut self,
        config: &ImageConfig,
        layers: &[Layer],
        tags: &[String],
        steps: &HashMap<String, CachedStep>,
    ) -> Result<String>;

    /// The step fingerprints recorded when `reference` was committed.
    fn image_steps(&self, reference: &str) -> Result<HashMap<String, CachedStep>>;
}

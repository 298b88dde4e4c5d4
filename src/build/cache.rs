use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha256::digest;
use tracing::debug;

use crate::build::image_config::ImageConfig;
use crate::store::Layer;

/// Content fingerprint of one build step: the parent image, the normalized
/// instruction text, and the digests of any context files it consumes. Two
/// steps with the same fingerprint produce the same image by construction.
pub fn step_fingerprint(parent_id: &str, instruction: &str, file_digests: &[String]) -> String {
    let mut material = format!("{parent_id}\n{instruction}\n");
    for d in file_digests {
        material.push_str(d);
        material.push('\n');
    }
    digest(material)
}

/// A committed step reusable from cache: the image id it produced, the layer
/// it added (None for metadata-only steps), and the config after the step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedStep {
    pub image_id: String,
    pub layer: Option<Layer>,
    pub config: ImageConfig,
}

/// Persistent map from step fingerprint to committed step. Fingerprints
/// embed the parent image id, so a hit is always an exact
/// (parent, instruction, inputs) match, never a prefix heuristic.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LayerGraph {
    steps: HashMap<String, CachedStep>,
    #[serde(skip)]
    path: PathBuf,
}

impl LayerGraph {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                ..Self::default()
            });
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache index {}", path.display()))?;
        let mut graph: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse cache index {}", path.display()))?;
        graph.path = path.to_path_buf();
        Ok(graph)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        let text = serde_json::to_string_pretty(self).context("Failed to serialize cache index")?;
        fs::write(&tmp, text).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to commit {}", self.path.display()))?;
        Ok(())
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<&CachedStep> {
        self.steps.get(fingerprint)
    }

    pub fn record(&mut self, fingerprint: String, step: CachedStep) {
        self.steps.insert(fingerprint, step);
    }

    /// Seeds the graph with steps recorded on another image, for --cache-from.
    /// Existing local entries win.
    pub fn merge(&mut self, steps: HashMap<String, CachedStep>) {
        for (fingerprint, step) in steps {
            if !self.steps.contains_key(&fingerprint) {
                debug!(image = %step.image_id, "adopting cached step");
                self.steps.insert(fingerprint, step);
            }
        }
    }

    /// A copy of every recorded step, attached to committed images so other
    /// builds can --cache-from them.
    pub fn snapshot(&self) -> HashMap<String, CachedStep> {
        self.steps.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use flate2::{Compression, write::GzEncoder};
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};
use sha256::{digest, try_digest};
use tar::{Builder, Header, HeaderMode};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::build::cache::CachedStep;
use crate::build::image_config::ImageConfig;
use crate::runtime::local::{copy_tree, extract_archive};
use crate::store::{BaseImage, Layer, LayerStore};

/// One committed image in the local store index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub created: String,
    pub config: ImageConfig,
    pub layers: Vec<Layer>,
    pub tags: Vec<String>,
    pub steps: HashMap<String, CachedStep>,
}

/// Directory-backed layer store:
///
/// ```text
/// <root>/blobs/sha256/<digest>   compressed layer blobs
/// <root>/layers/<diff_id>/       extracted layers for rootfs composition
/// <root>/images.json             image index
/// <root>/cache.json              step cache, managed by LayerGraph
/// ```
#[derive(Debug)]
pub struct LocalLayerStore {
    root: PathBuf,
    images: Vec<ImageRecord>,
}

impl LocalLayerStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("blobs/sha256"))
            .with_context(|| format!("Failed to create store at {}", root.display()))?;
        fs::create_dir_all(root.join("layers"))?;
        fs::create_dir_all(root.join("tmp"))?;

        let index = root.join("images.json");
        let images = if index.exists() {
            let text = fs::read_to_string(&index)
                .with_context(|| format!("Failed to read {}", index.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse {}", index.display()))?
        } else {
            Vec::new()
        };
        Ok(Self {
            root: root.to_path_buf(),
            images,
        })
    }

    pub fn cache_index_path(&self) -> PathBuf {
        self.root.join("cache.json")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join("blobs/sha256").join(digest)
    }

    /// A uniquely named scratch path; concurrent builds sharing the store
    /// must not collide on in-flight files.
    fn tmp_path(&self, name: &str) -> PathBuf {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        self.root.join("tmp").join(format!("{name}.{suffix}"))
    }

    /// Folds in image records another build committed since this store
    /// loaded its index, so rewriting the index cannot drop them.
    fn absorb_index(&mut self) -> Result<()> {
        let index = self.root.join("images.json");
        if !index.exists() {
            return Ok(());
        }
        let text = fs::read_to_string(&index)
            .with_context(|| format!("Failed to read {}", index.display()))?;
        let on_disk: Vec<ImageRecord> = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", index.display()))?;
        for record in on_disk {
            if !self.images.iter().any(|r| r.id == record.id) {
                self.images.push(record);
            }
        }
        Ok(())
    }

    fn find(&self, reference: &str) -> Option<&ImageRecord> {
        self.images
            .iter()
            .find(|r| r.id == reference || r.tags.iter().any(|t| t == reference))
    }

    fn save_index(&self) -> Result<()> {
        let index = self.root.join("images.json");
        let tmp = self.tmp_path("images.json");
        let text =
            serde_json::to_string_pretty(&self.images).context("Failed to serialize image index")?;
        fs::write(&tmp, text).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &index)
            .with_context(|| format!("Failed to commit {}", index.display()))?;
        Ok(())
    }

    /// Exports a committed image as an OCI layout directory.
    pub fn export_oci(&self, reference: &str, dest: &Path) -> Result<()> {
        let Some(record) = self.find(reference) else {
            bail!("no such image: {reference}");
        };
        info!(image = %record.id, dest = %dest.display(), "exporting OCI layout");
        super::oci::write_layout(dest, &record.config, &record.layers, |layer| {
            self.blob_path(&layer.digest)
        })
    }

    /// Archives a diff directory into a ustar tar with deterministic headers,
    /// so identical content always yields identical digests.
    fn create_tar(&self, source: &Path, tar_path: &Path) -> Result<()> {
        let file = File::create(tar_path)
            .with_context(|| format!("Failed to create {}", tar_path.display()))?;
        let mut builder = Builder::new(file);
        builder.mode(HeaderMode::Deterministic);

        for entry in WalkDir::new(source)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
            let rel = entry
                .path()
                .strip_prefix(source)
                .expect("walkdir yields paths under root");
            if rel.as_os_str().is_empty() {
                continue;
            }
            let meta = entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
            if meta.is_dir() {
                builder
                    .append_dir(rel, entry.path())
                    .with_context(|| format!("Failed to append directory {}", rel.display()))?;
            } else if meta.file_type().is_symlink() {
                let target = fs::read_link(entry.path())?;
                let mut header = Header::new_gnu();
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                builder
                    .append_link(&mut header, rel, &target)
                    .with_context(|| format!("Failed to append symlink {}", rel.display()))?;
            } else {
                let mut file = BufReader::new(
                    File::open(entry.path())
                        .with_context(|| format!("Cannot open file: {}", entry.path().display()))?,
                );
                builder
                    .append_file(rel, file.get_mut())
                    .with_context(|| format!("Failed to append file {}", rel.display()))?;
            }
        }
        builder.finish().context("Failed to finish tar archive")?;
        Ok(())
    }
}

impl LayerStore for LocalLayerStore {
    fn resolve_base(&self, reference: &str) -> Result<Option<BaseImage>> {
        Ok(self.find(reference).map(|record| BaseImage {
            image_id: record.id.clone(),
            layers: record.layers.clone(),
            config: record.config.clone(),
        }))
    }

    fn put_layer(&mut self, diff_dir: &Path) -> Result<Layer> {
        let tar_path = self.tmp_path("layer.tar");
        self.create_tar(diff_dir, &tar_path)?;
        let diff_id = try_digest(&tar_path)
            .with_context(|| format!("Failed to calculate sha256sum of {}", tar_path.display()))?;

        let gz_path = self.tmp_path("layer.tar.gz");
        let mut tar_file = BufReader::new(File::open(&tar_path)?);
        let mut encoder = GzEncoder::new(
            BufWriter::new(File::create(&gz_path)?),
            Compression::best(),
        );
        io::copy(&mut tar_file, &mut encoder)
            .with_context(|| format!("Failed to compress {}", tar_path.display()))?;
        encoder.finish()?.into_inner().ok();
        fs::remove_file(&tar_path)?;

        let gz_digest = try_digest(&gz_path)
            .with_context(|| format!("Failed to calculate sha256sum of {}", gz_path.display()))?;
        let size = fs::metadata(&gz_path)?.len();

        let blob = self.blob_path(&gz_digest);
        if blob.exists() {
            debug!(digest = %gz_digest, "layer blob already stored");
            fs::remove_file(&gz_path)?;
        } else {
            fs::rename(&gz_path, &blob).with_context(|| {
                format!("Failed to rename {} to {}", gz_path.display(), blob.display())
            })?;
        }

        let extracted = self.root.join("layers").join(&diff_id);
        if !extracted.exists() {
            copy_tree(diff_dir, &extracted)?;
        }

        Ok(Layer {
            digest: gz_digest,
            diff_id,
            size,
        })
    }

    fn layer_dir(&mut self, layer: &Layer) -> Result<PathBuf> {
        let extracted = self.root.join("layers").join(&layer.diff_id);
        if !extracted.exists() {
            let blob = self.blob_path(&layer.digest);
            if !blob.exists() {
                bail!("missing layer blob {}", layer.digest);
            }
            extract_archive(&blob, &extracted)?;
        }
        Ok(extracted)
    }

    fn commit_image(
        &mut self,
        config: &ImageConfig,
        layers: &[Layer],
        tags: &[String],
        steps: &HashMap<String, CachedStep>,
    ) -> Result<String> {
        let diff_ids: Vec<String> = layers.iter().map(|l| l.diff_id.clone()).collect();
        let identity = serde_json::json!({ "config": config, "rootfs": diff_ids });
        let id = digest(serde_json::to_string(&identity).context("Failed to serialize config")?);

        self.absorb_index()?;
        // A tag names at most one image.
        for record in self.images.iter_mut() {
            record.tags.retain(|t| !tags.contains(t));
        }
        if let Some(existing) = self.images.iter_mut().find(|r| r.id == id) {
            existing.tags.extend(tags.iter().cloned());
            existing.steps = steps.clone();
        } else {
            self.images.push(ImageRecord {
                id: id.clone(),
                created: chrono::Utc::now().to_rfc3339(),
                config: config.clone(),
                layers: layers.to_vec(),
                tags: tags.to_vec(),
                steps: steps.clone(),
            });
        }
        self.save_index()?;
        Ok(id)
    }

    fn image_steps(&self, reference: &str) -> Result<HashMap<String, CachedStep>> {
        Ok(self
            .find(reference)
            .map(|r| r.steps.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populated_diff() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/app.conf"), "listen = 80\n").unwrap();
        fs::write(dir.path().join("hello"), "hello\n").unwrap();
        dir
    }

    #[test]
    fn test_put_layer_is_deterministic_and_dedups() {
        let store_dir = tempdir().unwrap();
        let mut store = LocalLayerStore::open(store_dir.path()).unwrap();

        let a = store.put_layer(populated_diff().path()).unwrap();
        let b = store.put_layer(populated_diff().path()).unwrap();
        assert_eq!(a, b);
        assert!(store.blob_path(&a.digest).exists());
    }

    #[test]
    fn test_layer_round_trip_through_blob() {
        let store_dir = tempdir().unwrap();
        let mut store = LocalLayerStore::open(store_dir.path()).unwrap();
        let layer = store.put_layer(populated_diff().path()).unwrap();

        // Drop the extracted copy to force re-extraction from the blob.
        fs::remove_dir_all(store_dir.path().join("layers").join(&layer.diff_id)).unwrap();
        let dir = store.layer_dir(&layer).unwrap();
        assert_eq!(
            fs::read_to_string(dir.join("etc/app.conf")).unwrap(),
            "listen = 80\n"
        );
    }

    #[test]
    fn test_commit_and_resolve() {
        let store_dir = tempdir().unwrap();
        let mut store = LocalLayerStore::open(store_dir.path()).unwrap();
        let layer = store.put_layer(populated_diff().path()).unwrap();

        let config = ImageConfig::scratch().with_env("APP", "demo");
        let id = store
            .commit_image(&config, &[layer.clone()], &["demo:latest".to_string()], &HashMap::new())
            .unwrap();

        let store = LocalLayerStore::open(store_dir.path()).unwrap();
        let by_tag = store.resolve_base("demo:latest").unwrap().unwrap();
        assert_eq!(by_tag.image_id, id);
        assert_eq!(by_tag.layers, vec![layer]);
        assert_eq!(by_tag.config.get_env("APP"), Some("demo"));
        assert!(store.resolve_base("missing:latest").unwrap().is_none());
    }

    #[test]
    fn test_image_id_tracks_content() {
        let store_dir = tempdir().unwrap();
        let mut store = LocalLayerStore::open(store_dir.path()).unwrap();
        let layer = store.put_layer(populated_diff().path()).unwrap();

        let config = ImageConfig::scratch();
        let a = store
            .commit_image(&config, &[layer.clone()], &[], &HashMap::new())
            .unwrap();
        let b = store
            .commit_image(&config, &[layer.clone()], &[], &HashMap::new())
            .unwrap();
        assert_eq!(a, b);

        let c = store
            .commit_image(&config.clone().with_env("X", "1"), &[layer], &[], &HashMap::new())
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_concurrent_commits_keep_both_records() {
        let store_dir = tempdir().unwrap();
        let mut one = LocalLayerStore::open(store_dir.path()).unwrap();
        let mut two = LocalLayerStore::open(store_dir.path()).unwrap();
        let layer = one.put_layer(populated_diff().path()).unwrap();

        let tag = vec!["app:latest".to_string()];
        let first = one
            .commit_image(&ImageConfig::scratch(), &[layer.clone()], &tag, &HashMap::new())
            .unwrap();
        // `two` loaded its index before `first` existed; its commit must not
        // drop that record when it rewrites the index.
        let second = two
            .commit_image(
                &ImageConfig::scratch().with_env("V", "2"),
                &[layer],
                &tag,
                &HashMap::new(),
            )
            .unwrap();
        assert_ne!(first, second);

        let reopened = LocalLayerStore::open(store_dir.path()).unwrap();
        assert!(reopened.resolve_base(&first).unwrap().is_some());
        assert_eq!(
            reopened.resolve_base("app:latest").unwrap().unwrap().image_id,
            second
        );
    }

    #[test]
    fn test_retag_moves_tag() {
        let store_dir = tempdir().unwrap();
        let mut store = LocalLayerStore::open(store_dir.path()).unwrap();
        let layer = store.put_layer(populated_diff().path()).unwrap();

        let tag = vec!["app:latest".to_string()];
        let first = store
            .commit_image(&ImageConfig::scratch(), &[layer.clone()], &tag, &HashMap::new())
            .unwrap();
        let second = store
            .commit_image(
                &ImageConfig::scratch().with_env("V", "2"),
                &[layer],
                &tag,
                &HashMap::new(),
            )
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(
            store.resolve_base("app:latest").unwrap().unwrap().image_id,
            second
        );
    }
}

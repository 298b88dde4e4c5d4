use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use oci_spec::image::{
    Arch, DescriptorBuilder, ImageConfigurationBuilder, ImageIndexBuilder, ImageManifestBuilder,
    MediaType, OciLayoutBuilder, Os, RootFsBuilder, SCHEMA_VERSION, Sha256Digest,
};
use sha256::try_digest;

use crate::build::image_config::ImageConfig;
use crate::store::Layer;

/// Writes a single-manifest OCI image layout under `image_dir`:
/// `blobs/sha256/` holding layers, config, and manifest, plus `index.json`
/// and `oci-layout`. Layer blobs are copied from `blob_source`.
pub fn write_layout(
    image_dir: &Path,
    config: &ImageConfig,
    layers: &[Layer],
    blob_source: impl Fn(&Layer) -> std::path::PathBuf,
) -> Result<()> {
    let blob_dir = image_dir.join("blobs/sha256");
    fs::create_dir_all(&blob_dir)
        .with_context(|| format!("Failed to create {}", blob_dir.display()))?;

    for layer in layers {
        let src = blob_source(layer);
        let dst = blob_dir.join(&layer.digest);
        if !dst.exists() {
            fs::copy(&src, &dst).with_context(|| {
                format!("Failed to copy layer blob {} to {}", src.display(), dst.display())
            })?;
        }
    }

    let rootfs = RootFsBuilder::default()
        .typ("layers".to_string())
        .diff_ids(
            layers
                .iter()
                .map(|l| format!("sha256:{}", l.diff_id))
                .collect::<Vec<String>>(),
        )
        .build()
        .context("Failed to build rootfs")?;
    let image_configuration = ImageConfigurationBuilder::default()
        .architecture(Arch::Amd64)
        .os(Os::Linux)
        .created(chrono::Utc::now().to_rfc3339())
        .config(config.to_oci()?)
        .rootfs(rootfs)
        .build()
        .context("Failed to build image configuration")?;

    let config_path = blob_dir.join("config.json");
    image_configuration
        .to_file_pretty(&config_path)
        .with_context(|| format!("Failed to write image config to {}", config_path.display()))?;
    let (config_digest, config_size) = seal_blob(&blob_dir, "config.json")?;

    let config_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .size(config_size)
        .digest(parse_digest(&config_digest)?)
        .build()
        .context("Failed to build config descriptor")?;
    let mut layer_descriptors = Vec::with_capacity(layers.len());
    for layer in layers {
        layer_descriptors.push(
            DescriptorBuilder::default()
                .media_type(MediaType::ImageLayerGzip)
                .size(layer.size)
                .digest(parse_digest(&layer.digest)?)
                .build()
                .with_context(|| format!("Failed to build layer descriptor {}", layer.digest))?,
        );
    }
    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(layer_descriptors)
        .build()
        .context("Failed to build image manifest")?;
    let manifest_path = blob_dir.join("manifest.json");
    manifest
        .to_file_pretty(&manifest_path)
        .with_context(|| format!("Failed to write manifest to {}", manifest_path.display()))?;
    let (manifest_digest, manifest_size) = seal_blob(&blob_dir, "manifest.json")?;

    let manifest_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .size(manifest_size)
        .digest(parse_digest(&manifest_digest)?)
        .build()
        .context("Failed to build manifest descriptor")?;
    let index = ImageIndexBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .manifests(vec![manifest_descriptor])
        .build()
        .context("Failed to build image index")?;
    let index_path = image_dir.join("index.json");
    index
        .to_file_pretty(&index_path)
        .with_context(|| format!("Failed to write index to {}", index_path.display()))?;

    let oci_layout = OciLayoutBuilder::default()
        .image_layout_version("1.0.0".to_string())
        .build()
        .context("Failed to build OCI layout")?;
    let layout_path = image_dir.join("oci-layout");
    oci_layout
        .to_file_pretty(&layout_path)
        .with_context(|| format!("Failed to write OCI layout to {}", layout_path.display()))?;

    Ok(())
}

/// Renames a freshly written blob to its own digest, the content-addressed
/// name the layout requires.
fn seal_blob(blob_dir: &Path, name: &str) -> Result<(String, u64)> {
    let path = blob_dir.join(name);
    let sha256sum = try_digest(&path)
        .with_context(|| format!("Failed to calculate sha256sum of {}", path.display()))?;
    let sealed = blob_dir.join(&sha256sum);
    fs::rename(&path, &sealed).with_context(|| {
        format!("Failed to rename {} to {}", path.display(), sealed.display())
    })?;
    let size = fs::metadata(&sealed)
        .with_context(|| format!("Failed to read size of {}", sealed.display()))?
        .len();
    Ok((sha256sum, size))
}

fn parse_digest(sha256sum: &str) -> Result<Sha256Digest> {
    Sha256Digest::from_str(sha256sum)
        .with_context(|| format!("Invalid digest format: {sha256sum}"))
}

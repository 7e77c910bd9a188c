//! Local OCI image layouts (`oci:///path[:tag]`).

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};
use sha2::{Digest, Sha256};

use crate::errors::{StrataError, StrataResult};
use crate::image::source::ImageSource;
use crate::image::{
    BASE_DIRECTORY_ANNOTATION, BaseImageInfo, ImageConfig, LayerInfo, chain_ids, digest_hex,
};

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

pub struct OciLayoutSource {
    path: PathBuf,
    tag: Option<String>,
    /// Skip blob digest verification. Only offered for local layouts, where
    /// the bytes never crossed a network.
    skip_validation: bool,
}

impl OciLayoutSource {
    pub fn new(path: PathBuf, tag: Option<String>, skip_validation: bool) -> Self {
        Self {
            path,
            tag,
            skip_validation,
        }
    }

    fn load_index(&self) -> StrataResult<ImageIndex> {
        let index_path = self.path.join("index.json");
        let index_json = fs::read_to_string(&index_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StrataError::NotFound(format!(
                    "image layout must contain index.json, not found at: {}",
                    index_path.display()
                ))
            } else {
                StrataError::Backend(format!("reading {}: {}", index_path.display(), e))
            }
        })?;

        serde_json::from_str(&index_json).map_err(|e| {
            StrataError::Invalid(format!("parsing {}: {}", index_path.display(), e))
        })
    }

    fn select_manifest_digest(&self, index: &ImageIndex) -> StrataResult<String> {
        let manifests = index.manifests();

        let entry = match &self.tag {
            Some(tag) => manifests
                .iter()
                .find(|m| {
                    m.annotations()
                        .as_ref()
                        .and_then(|a| a.get(REF_NAME_ANNOTATION))
                        .is_some_and(|name| name == tag)
                })
                .ok_or_else(|| {
                    StrataError::NotFound(format!(
                        "tag `{}` not found in {}",
                        tag,
                        self.path.display()
                    ))
                })?,
            None => manifests.first().ok_or_else(|| {
                StrataError::Invalid(format!("no manifests in {}", self.path.display()))
            })?,
        };

        Ok(entry.digest().digest().to_string())
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.path.join("blobs/sha256").join(digest_hex(digest))
    }

    fn read_blob(&self, digest: &str) -> StrataResult<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StrataError::NotFound(format!("blob not found: {}", path.display()))
            } else {
                StrataError::Backend(format!("reading blob {}: {}", path.display(), e))
            }
        })
    }
}

impl ImageSource for OciLayoutSource {
    fn base_image_info(&self) -> StrataResult<BaseImageInfo> {
        let index = self.load_index()?;
        let manifest_digest = self.select_manifest_digest(&index)?;
        tracing::debug!(manifest = %manifest_digest, "loading-manifest");

        let manifest: ImageManifest = serde_json::from_slice(&self.read_blob(&manifest_digest)?)
            .map_err(|e| StrataError::Invalid(format!("parsing manifest: {}", e)))?;

        let config_digest = manifest.config().digest().to_string();
        let config: ImageConfiguration = serde_json::from_slice(&self.read_blob(&config_digest)?)
            .map_err(|e| StrataError::Invalid(format!("parsing image config: {}", e)))?;

        let diff_ids = config.rootfs().diff_ids();
        if diff_ids.len() != manifest.layers().len() {
            return Err(StrataError::Invalid(format!(
                "manifest has {} layers but config has {} diff ids",
                manifest.layers().len(),
                diff_ids.len()
            )));
        }

        let ids = chain_ids(diff_ids);
        let mut layer_infos = Vec::with_capacity(ids.len());
        for (idx, layer_desc) in manifest.layers().iter().enumerate() {
            layer_infos.push(LayerInfo {
                blob_id: layer_desc.digest().to_string(),
                diff_id: diff_ids[idx].clone(),
                chain_id: ids[idx].clone(),
                parent_chain_id: if idx == 0 {
                    String::new()
                } else {
                    ids[idx - 1].clone()
                },
                size: layer_desc.size() as i64,
                media_type: layer_desc.media_type().to_string(),
                base_directory: annotation(
                    layer_desc.annotations(),
                    BASE_DIRECTORY_ANNOTATION,
                ),
            });
        }

        Ok(BaseImageInfo {
            layer_infos,
            config: ImageConfig::from_oci_config(&config),
        })
    }

    fn stream_blob(&self, layer: &LayerInfo) -> StrataResult<(Box<dyn Read + Send>, i64)> {
        let path = self.blob_path(&layer.blob_id);

        if !self.skip_validation {
            verify_blob_digest(&path, &layer.blob_id)?;
        }

        let file = fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StrataError::NotFound(format!("blob not found: {}", path.display()))
            } else {
                StrataError::Backend(format!("opening blob {}: {}", path.display(), e))
            }
        })?;
        let size = file
            .metadata()
            .map(|m| m.len() as i64)
            .unwrap_or(0);

        Ok((Box::new(file), size))
    }
}

fn annotation(
    annotations: &Option<HashMap<String, String>>,
    key: &str,
) -> String {
    annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .cloned()
        .unwrap_or_default()
}

fn verify_blob_digest(path: &Path, expected: &str) -> StrataResult<()> {
    let mut file = fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StrataError::NotFound(format!("blob not found: {}", path.display()))
        } else {
            StrataError::Backend(format!("opening blob {}: {}", path.display(), e))
        }
    })?;

    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| StrataError::Backend(format!("hashing blob {}: {}", path.display(), e)))?;
    let actual = hex::encode(hasher.finalize());

    if actual != digest_hex(expected) {
        return Err(StrataError::Checksum(format!(
            "layer blob `{}` digest is {}",
            expected, actual
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write a minimal single-layer OCI layout and return its directory.
    fn write_layout(dir: &Path, tag: &str) -> (String, Vec<u8>) {
        fs::create_dir_all(dir.join("blobs/sha256")).unwrap();

        let layer_bytes = b"not really a tar but good enough".to_vec();
        let layer_digest = hex::encode(Sha256::digest(&layer_bytes));
        fs::write(dir.join("blobs/sha256").join(&layer_digest), &layer_bytes).unwrap();

        let diff_digest = "1111111111111111111111111111111111111111111111111111111111111111";
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "author": "strata-tests",
            "config": {
                "Env": ["PATH=/usr/bin"],
                "Volumes": {"/data": {}}
            },
            "rootfs": {
                "type": "layers",
                "diff_ids": [format!("sha256:{}", diff_digest)]
            }
        });
        let config_bytes = serde_json::to_vec(&config).unwrap();
        let config_digest = hex::encode(Sha256::digest(&config_bytes));
        fs::write(dir.join("blobs/sha256").join(&config_digest), &config_bytes).unwrap();

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": format!("sha256:{}", config_digest),
                "size": config_bytes.len()
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": format!("sha256:{}", layer_digest),
                "size": layer_bytes.len()
            }]
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = hex::encode(Sha256::digest(&manifest_bytes));
        fs::write(
            dir.join("blobs/sha256").join(&manifest_digest),
            &manifest_bytes,
        )
        .unwrap();

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": format!("sha256:{}", manifest_digest),
                "size": manifest_bytes.len(),
                "annotations": {REF_NAME_ANNOTATION: tag}
            }]
        });
        fs::write(dir.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();

        (layer_digest, layer_bytes)
    }

    #[test]
    fn test_base_image_info_resolves_layers_and_config() {
        let dir = TempDir::new().unwrap();
        let (layer_digest, _) = write_layout(dir.path(), "latest");

        let source = OciLayoutSource::new(dir.path().to_path_buf(), None, false);
        let info = source.base_image_info().unwrap();

        assert_eq!(info.layer_infos.len(), 1);
        let layer = &info.layer_infos[0];
        assert_eq!(layer.blob_id, format!("sha256:{}", layer_digest));
        assert_eq!(
            layer.chain_id,
            "1111111111111111111111111111111111111111111111111111111111111111"
        );
        assert_eq!(layer.parent_chain_id, "");
        assert!(layer.size > 0);

        assert_eq!(info.config.env, vec!["PATH=/usr/bin".to_string()]);
        assert_eq!(info.config.volumes, vec!["/data".to_string()]);
        assert_eq!(info.config.author, "strata-tests");
    }

    #[test]
    fn test_tag_selection() {
        let dir = TempDir::new().unwrap();
        write_layout(dir.path(), "v0.1.0");

        let hit = OciLayoutSource::new(dir.path().to_path_buf(), Some("v0.1.0".to_string()), false);
        assert!(hit.base_image_info().is_ok());

        let miss = OciLayoutSource::new(dir.path().to_path_buf(), Some("v9.9.9".to_string()), false);
        match miss.base_image_info() {
            Err(StrataError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_index_is_not_found() {
        let dir = TempDir::new().unwrap();
        let source = OciLayoutSource::new(dir.path().to_path_buf(), None, false);
        match source.base_image_info() {
            Err(StrataError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_blob_verifies_digest() {
        let dir = TempDir::new().unwrap();
        let (layer_digest, _) = write_layout(dir.path(), "latest");

        // Corrupt the blob on disk.
        fs::write(
            dir.path().join("blobs/sha256").join(&layer_digest),
            b"tampered",
        )
        .unwrap();

        let source = OciLayoutSource::new(dir.path().to_path_buf(), None, false);
        let info = source.base_image_info().unwrap();
        match source.stream_blob(&info.layer_infos[0]) {
            Err(StrataError::Checksum(_)) => {}
            other => panic!("expected Checksum, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_stream_blob_skips_verification_when_asked() {
        let dir = TempDir::new().unwrap();
        let (layer_digest, _) = write_layout(dir.path(), "latest");
        fs::write(
            dir.path().join("blobs/sha256").join(&layer_digest),
            b"tampered",
        )
        .unwrap();

        let source = OciLayoutSource::new(dir.path().to_path_buf(), None, true);
        let info = source.base_image_info().unwrap();
        let (mut stream, _) = source.stream_blob(&info.layer_infos[0]).unwrap();

        let mut contents = Vec::new();
        stream.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"tampered");
    }
}

//! Remote registry image source (`docker://`).
//!
//! Wraps the registry client behind the synchronous `ImageSource` trait; a
//! dedicated runtime owned by the source drives the network I/O. Blobs are
//! staged into the store's tmp directory and digest-checked before they are
//! handed to the unpacker.

use std::io::Read;
use std::path::PathBuf;

use oci_client::Reference;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_client::secrets::RegistryAuth;
use sha2::{Digest, Sha256};

use crate::errors::{StrataError, StrataResult};
use crate::image::source::ImageSource;
use crate::image::{
    BASE_DIRECTORY_ANNOTATION, BaseImageInfo, ImageConfig, LayerInfo, chain_ids, digest_hex,
};

const MAX_RETRIES: u32 = 3;

#[derive(Clone, Debug, Default)]
pub struct RegistryCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RegistryCredentials {
    fn to_auth(&self) -> RegistryAuth {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
            _ => RegistryAuth::Anonymous,
        }
    }
}

pub struct RegistrySource {
    runtime: tokio::runtime::Runtime,
    client: oci_client::Client,
    reference: Reference,
    auth: RegistryAuth,
    tmp_dir: PathBuf,
}

impl RegistrySource {
    pub fn new(
        reference: &str,
        credentials: &RegistryCredentials,
        insecure_registries: &[String],
        tmp_dir: PathBuf,
    ) -> StrataResult<Self> {
        let reference: Reference = reference
            .parse()
            .map_err(|e| StrataError::Invalid(format!("invalid image reference: {}", e)))?;

        let insecure = insecure_registries
            .iter()
            .any(|registry| registry == reference.registry());
        let config = ClientConfig {
            protocol: if insecure {
                ClientProtocol::HttpsExcept(insecure_registries.to_vec())
            } else {
                ClientProtocol::Https
            },
            accept_invalid_certificates: insecure,
            ..Default::default()
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| StrataError::Backend(format!("starting registry runtime: {}", e)))?;

        Ok(Self {
            runtime,
            client: oci_client::Client::new(config),
            reference,
            auth: credentials.to_auth(),
            tmp_dir,
        })
    }

    fn pull_image_manifest(&self) -> StrataResult<OciImageManifest> {
        let (manifest, digest) = self.with_retries("pulling manifest", || {
            self.runtime
                .block_on(self.client.pull_manifest(&self.reference, &self.auth))
                .map_err(|e| classify_registry_error("fetching manifest", &e.to_string()))
        })?;

        match manifest {
            OciManifest::Image(image) => Ok(image),
            OciManifest::ImageIndex(index) => {
                let (os, arch) = current_platform();
                let entry = index
                    .manifests
                    .iter()
                    .find(|m| {
                        m.platform
                            .as_ref()
                            .is_some_and(|p| p.os == os && p.architecture == arch)
                    })
                    .ok_or_else(|| {
                        StrataError::NotFound(format!(
                            "no image found for platform {}/{} in `{}`",
                            os,
                            arch,
                            self.reference.whole()
                        ))
                    })?;

                tracing::debug!(digest = %entry.digest, os, arch, "pulling-platform-manifest");
                let platform_ref: Reference =
                    format!("{}@{}", self.reference.whole(), entry.digest)
                        .parse()
                        .map_err(|e| {
                            StrataError::Invalid(format!("invalid platform reference: {}", e))
                        })?;

                let (platform_manifest, _) = self.with_retries("pulling platform manifest", || {
                    self.runtime
                        .block_on(self.client.pull_manifest(&platform_ref, &self.auth))
                        .map_err(|e| {
                            classify_registry_error("fetching platform manifest", &e.to_string())
                        })
                })?;

                match platform_manifest {
                    OciManifest::Image(image) => Ok(image),
                    OciManifest::ImageIndex(_) => Err(StrataError::Invalid(format!(
                        "platform manifest `{}` is not an image",
                        digest
                    ))),
                }
            }
        }
    }

    /// Download a blob into the store's tmp directory and verify its digest.
    /// The returned handle reads from an already-unlinked file.
    fn fetch_blob(&self, descriptor: &OciDescriptor) -> StrataResult<(std::fs::File, i64)> {
        std::fs::create_dir_all(&self.tmp_dir).map_err(|e| {
            StrataError::Backend(format!("creating {}: {}", self.tmp_dir.display(), e))
        })?;

        self.with_retries("pulling blob", || {
            let staged = tempfile::NamedTempFile::new_in(&self.tmp_dir).map_err(|e| {
                StrataError::Backend(format!("staging blob download: {}", e))
            })?;

            self.runtime
                .block_on(async {
                    use tokio::io::AsyncWriteExt;
                    let mut file = tokio::fs::File::create(staged.path()).await?;
                    self.client
                        .pull_blob(&self.reference, descriptor, &mut file)
                        .await
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                    file.flush().await
                })
                .map_err(|e| classify_registry_error("fetching blob", &e.to_string()))?;

            verify_staged_digest(staged.path(), &descriptor.digest)?;

            let file = staged.reopen().map_err(|e| {
                StrataError::Backend(format!("reopening staged blob: {}", e))
            })?;
            let size = file.metadata().map(|m| m.len() as i64).unwrap_or(0);
            Ok((file, size))
        })
    }

    fn with_retries<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> StrataResult<T>,
    ) -> StrataResult<T> {
        let mut last_error = None;
        for attempt in 1..=MAX_RETRIES {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    tracing::warn!(what, attempt, error = %e, "transient-registry-error");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| StrataError::Network(format!("{} failed after retries", what))))
    }
}

impl ImageSource for RegistrySource {
    fn base_image_info(&self) -> StrataResult<BaseImageInfo> {
        let manifest = self.pull_image_manifest()?;

        let config_descriptor = OciDescriptor {
            digest: manifest.config.digest.clone(),
            media_type: manifest.config.media_type.clone(),
            size: manifest.config.size,
            urls: None,
            annotations: None,
        };
        let (mut config_file, _) = self.fetch_blob(&config_descriptor)?;
        let mut config_json = String::new();
        config_file
            .read_to_string(&mut config_json)
            .map_err(|e| StrataError::Backend(format!("reading image config: {}", e)))?;
        let config: oci_spec::image::ImageConfiguration = serde_json::from_str(&config_json)
            .map_err(|e| StrataError::Invalid(format!("parsing image config: {}", e)))?;

        let diff_ids = config.rootfs().diff_ids();
        if diff_ids.len() != manifest.layers.len() {
            return Err(StrataError::Invalid(format!(
                "manifest has {} layers but config has {} diff ids",
                manifest.layers.len(),
                diff_ids.len()
            )));
        }

        let ids = chain_ids(diff_ids);
        let mut layer_infos = Vec::with_capacity(ids.len());
        for (idx, layer) in manifest.layers.iter().enumerate() {
            layer_infos.push(LayerInfo {
                blob_id: layer.digest.clone(),
                diff_id: diff_ids[idx].clone(),
                chain_id: ids[idx].clone(),
                parent_chain_id: if idx == 0 {
                    String::new()
                } else {
                    ids[idx - 1].clone()
                },
                size: layer.size,
                media_type: layer.media_type.clone(),
                base_directory: layer
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(BASE_DIRECTORY_ANNOTATION))
                    .cloned()
                    .unwrap_or_default(),
            });
        }

        Ok(BaseImageInfo {
            layer_infos,
            config: ImageConfig::from_oci_config(&config),
        })
    }

    fn stream_blob(&self, layer: &LayerInfo) -> StrataResult<(Box<dyn Read + Send>, i64)> {
        let descriptor = OciDescriptor {
            digest: layer.blob_id.clone(),
            media_type: layer.media_type.clone(),
            size: layer.size,
            urls: None,
            annotations: None,
        };

        let (file, size) = self.fetch_blob(&descriptor)?;
        Ok((Box::new(file), size))
    }
}

fn current_platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86_64" => "amd64",
        "x86" => "386",
        other => other,
    };
    ("linux", arch)
}

fn verify_staged_digest(path: &std::path::Path, expected: &str) -> StrataResult<()> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| StrataError::Backend(format!("opening staged blob: {}", e)))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| StrataError::Backend(format!("hashing staged blob: {}", e)))?;
    let actual = hex::encode(hasher.finalize());

    if actual != digest_hex(expected) {
        return Err(StrataError::Checksum(format!(
            "blob `{}` downloaded with digest {}",
            expected, actual
        )));
    }
    Ok(())
}

/// Sort a registry client failure into the error taxonomy. String matching
/// is the only portable signal the client exposes.
fn classify_registry_error(context: &str, message: &str) -> StrataError {
    let lower = message.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("authentication") {
        StrataError::Unauthorized(format!("{}: {}", context, message))
    } else if lower.contains("404")
        || lower.contains("manifest unknown")
        || lower.contains("not found")
    {
        StrataError::NotFound(format!("{}: {}", context, message))
    } else {
        StrataError::Network(format!("{}: {}", context, message))
    }
}

//! Image references, layer descriptors and blob sources.

pub mod oci_layout;
pub mod reference;
pub mod registry;
pub mod source;
pub mod tar_source;

use serde::{Deserialize, Serialize};

pub use reference::ImageRef;
pub use source::ImageSource;

/// Descriptor annotation carrying an optional unpack prefix for a layer.
pub const BASE_DIRECTORY_ANNOTATION: &str = "io.strata.image.base-directory";

/// Immutable description of one image layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    /// Content digest of the compressed blob as delivered by the source.
    pub blob_id: String,
    /// Content digest of the uncompressed tar stream.
    pub diff_id: String,
    /// Hash-chain identifier of the layer's cumulative state.
    pub chain_id: String,
    /// Chain id of the layer below, empty for the root layer.
    pub parent_chain_id: String,
    /// Compressed byte count; 0 means unknown.
    pub size: i64,
    pub media_type: String,
    /// Optional non-root prefix the layer's entries unpack under.
    pub base_directory: String,
}

/// Runtime-facing subset of an image configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub env: Vec<String>,
    pub volumes: Vec<String>,
    pub author: String,
}

impl ImageConfig {
    pub fn from_oci_config(image_config: &oci_spec::image::ImageConfiguration) -> Self {
        let (env, volumes) = match image_config.config().as_ref() {
            Some(config) => (
                config.env().clone().unwrap_or_default(),
                config.volumes().clone().unwrap_or_default(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        Self {
            env,
            volumes,
            author: image_config.author().clone().unwrap_or_default(),
        }
    }
}

/// An ordered list of layer descriptors (root first) plus the image
/// configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BaseImageInfo {
    pub layer_infos: Vec<LayerInfo>,
    pub config: ImageConfig,
}

impl BaseImageInfo {
    pub fn chain_ids(&self) -> Vec<String> {
        self.layer_infos
            .iter()
            .map(|l| l.chain_id.clone())
            .collect()
    }
}

/// Strip a `sha256:`-style algorithm prefix, leaving the hex digest.
pub fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

/// Compute the hash-chain identifiers for an ordered list of diff ids.
///
/// The root layer's chain id is its diff id; every other layer hashes its
/// parent's chain id and its own diff id together. Ids are lower-case hex
/// with no algorithm prefix so they are usable as directory names.
pub fn chain_ids(diff_ids: &[String]) -> Vec<String> {
    use sha2::{Digest, Sha256};

    let mut out = Vec::with_capacity(diff_ids.len());
    let mut parent: Option<String> = None;

    for diff_id in diff_ids {
        let diff_hex = digest_hex(diff_id);
        let chain_id = match &parent {
            None => diff_hex.to_string(),
            Some(parent_id) => {
                let digest = Sha256::digest(format!("{} {}", parent_id, diff_hex).as_bytes());
                hex::encode(digest)
            }
        };
        parent = Some(chain_id.clone());
        out.push(chain_id);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex_strips_algorithm() {
        assert_eq!(digest_hex("sha256:abc123"), "abc123");
        assert_eq!(digest_hex("abc123"), "abc123");
    }

    #[test]
    fn test_root_chain_id_is_diff_id() {
        let ids = chain_ids(&["sha256:aaaa".to_string()]);
        assert_eq!(ids, vec!["aaaa".to_string()]);
    }

    #[test]
    fn test_chain_ids_chain_through_parents() {
        use sha2::{Digest, Sha256};

        let ids = chain_ids(&["sha256:aaaa".to_string(), "sha256:bbbb".to_string()]);
        assert_eq!(ids[0], "aaaa");

        let expected = hex::encode(Sha256::digest(b"aaaa bbbb"));
        assert_eq!(ids[1], expected);
    }

    #[test]
    fn test_chain_ids_are_order_sensitive() {
        let forward = chain_ids(&["sha256:aaaa".to_string(), "sha256:bbbb".to_string()]);
        let reverse = chain_ids(&["sha256:bbbb".to_string(), "sha256:aaaa".to_string()]);
        assert_ne!(forward[1], reverse[1]);
    }
}

//! Local tar files as single-layer images.

use std::fs;
use std::io::Read;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::errors::{StrataError, StrataResult};
use crate::image::source::ImageSource;
use crate::image::{BaseImageInfo, ImageConfig, LayerInfo};

pub struct TarSource {
    path: PathBuf,
}

impl TarSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Chain id of a local tar: hash of its path plus its mtime, so editing
    /// the tar invalidates the cached volume.
    fn chain_id(&self, mtime_nanos: i128) -> String {
        let path_digest = Sha256::digest(self.path.as_os_str().as_encoded_bytes());
        format!("{}-{}", hex::encode(path_digest), mtime_nanos)
    }

    fn validate(&self) -> StrataResult<fs::Metadata> {
        let metadata = fs::metadata(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StrataError::NotFound(format!(
                    "local image not found in `{}`",
                    self.path.display()
                ))
            } else {
                StrataError::Backend(format!(
                    "fetching image metadata for `{}`: {}",
                    self.path.display(),
                    e
                ))
            }
        })?;

        if metadata.is_dir() {
            return Err(StrataError::Invalid(
                "invalid base image: directory provided instead of a tar file".to_string(),
            ));
        }

        Ok(metadata)
    }
}

impl ImageSource for TarSource {
    fn base_image_info(&self) -> StrataResult<BaseImageInfo> {
        let metadata = self.validate()?;
        let mtime_nanos = mtime_nanos(&metadata);

        Ok(BaseImageInfo {
            layer_infos: vec![LayerInfo {
                blob_id: self.path.display().to_string(),
                diff_id: String::new(),
                chain_id: self.chain_id(mtime_nanos),
                parent_chain_id: String::new(),
                size: 0,
                media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
                base_directory: String::new(),
            }],
            config: ImageConfig::default(),
        })
    }

    fn stream_blob(&self, _layer: &LayerInfo) -> StrataResult<(Box<dyn Read + Send>, i64)> {
        self.validate()?;

        tracing::debug!(path = %self.path.display(), "opening-tar");
        let stream = fs::File::open(&self.path).map_err(|e| {
            StrataError::Backend(format!("reading local image `{}`: {}", self.path.display(), e))
        })?;

        Ok((Box::new(stream), 0))
    }
}

fn mtime_nanos(metadata: &fs::Metadata) -> i128 {
    use std::os::unix::fs::MetadataExt;
    metadata.mtime() as i128 * 1_000_000_000 + metadata.mtime_nsec() as i128
}

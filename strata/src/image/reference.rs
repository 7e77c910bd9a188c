//! Image reference parsing.
//!
//! Three schemes are understood:
//! - `docker://[host/]name[:tag]` for a registry image
//! - `oci:///abs/path[:tag]` for a local OCI image layout
//! - `/abs/path` for a local tar file

use std::path::PathBuf;

use crate::errors::{StrataError, StrataResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageRef {
    Registry { reference: String },
    OciLayout { path: PathBuf, tag: Option<String> },
    LocalTar { path: PathBuf },
}

impl ImageRef {
    pub fn parse(raw: &str) -> StrataResult<Self> {
        if let Some(rest) = raw.strip_prefix("docker://") {
            // docker:///name means "no host": let the registry client apply
            // its default registry.
            let reference = rest.trim_start_matches('/').to_string();
            if reference.is_empty() {
                return Err(StrataError::Invalid(format!(
                    "missing image name in `{}`",
                    raw
                )));
            }
            return Ok(ImageRef::Registry { reference });
        }

        if let Some(rest) = raw.strip_prefix("oci://") {
            if !rest.starts_with('/') {
                return Err(StrataError::Invalid(format!(
                    "oci image path must be absolute in `{}`",
                    raw
                )));
            }
            let (path, tag) = split_tag(rest);
            return Ok(ImageRef::OciLayout {
                path: PathBuf::from(path),
                tag,
            });
        }

        if raw.starts_with('/') {
            return Ok(ImageRef::LocalTar {
                path: PathBuf::from(raw),
            });
        }

        Err(StrataError::Invalid(format!(
            "unsupported image reference `{}`",
            raw
        )))
    }
}

/// Split a trailing `:tag` off a path, leaving paths with no tag intact.
/// A colon inside a path component (before the last slash) is not a tag.
fn split_tag(raw: &str) -> (&str, Option<String>) {
    match raw.rsplit_once(':') {
        Some((path, tag)) if !tag.contains('/') && !tag.is_empty() => {
            (path, Some(tag.to_string()))
        }
        _ => (raw, None),
    }
}

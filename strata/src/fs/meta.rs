//! Per-volume metadata records.

use serde::{Deserialize, Serialize};

use crate::errors::{StrataError, StrataResult};
use crate::store::layout::StoreLayout;

/// What the store remembers about a finalized volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMeta {
    /// Uncompressed bytes written while unpacking the layer.
    pub size: i64,
}

pub fn write_volume_meta(layout: &StoreLayout, id: &str, meta: &VolumeMeta) -> StrataResult<()> {
    let path = layout.volume_meta_path(id);
    let data = serde_json::to_vec(meta)?;
    std::fs::write(&path, data).map_err(|e| {
        StrataError::Backend(format!("writing volume metadata {}: {}", path.display(), e))
    })
}

pub fn read_volume_meta(layout: &StoreLayout, id: &str) -> StrataResult<VolumeMeta> {
    let path = layout.volume_meta_path(id);
    let contents = std::fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StrataError::NotFound(format!("no metadata for volume `{}`", id))
        } else {
            StrataError::Backend(format!("reading volume metadata {}: {}", path.display(), e))
        }
    })?;

    serde_json::from_slice(&contents).map_err(|e| {
        StrataError::Backend(format!("parsing volume metadata {}: {}", path.display(), e))
    })
}

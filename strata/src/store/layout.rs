//! On-disk layout of a strata store.
//!
//! ```text
//! <store>/
//!   volumes/<chain-id>/...                     finalized layers
//!   volumes/<chain-id>-incomplete-<t>-<r>/...  in-flight builds
//!   volumes/gc.<chain-id>/...                  tombstoned, awaiting sweep
//!   images/<id>/rootfs/...                     working images
//!   meta/dependencies/<image__id>.json         image -> chain-id records
//!   meta/volume-<chain-id>.json                per-volume metadata
//!   meta/namespace.json                        store id mappings
//!   locks/<key>.lock                           lock files
//!   tmp/                                       transient staging
//!   whiteout_dev                               reserved device placeholder
//! ```

use std::path::{Path, PathBuf};

use crate::errors::{StrataError, StrataResult};

pub const VOLUMES_DIR: &str = "volumes";
pub const IMAGES_DIR: &str = "images";
pub const META_DIR: &str = "meta";
pub const LOCKS_DIR: &str = "locks";
pub const TMP_DIR: &str = "tmp";
pub const DEPENDENCIES_DIR: &str = "dependencies";

/// Name of the device-node placeholder used when unpacking cannot mknod.
pub const WHITEOUT_DEVICE: &str = "whiteout_dev";

/// Marker prefix for volumes claimed by the garbage collector.
pub const GC_PREFIX: &str = "gc.";

/// Reference key format for dependency records of an image.
pub fn image_ref_key(id: &str) -> String {
    format!("image:{}", id)
}

#[derive(Clone, Debug)]
pub struct StoreLayout {
    store_path: PathBuf,
}

impl StoreLayout {
    pub fn new(store_path: PathBuf) -> Self {
        Self { store_path }
    }

    pub fn root(&self) -> &Path {
        &self.store_path
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.store_path.join(VOLUMES_DIR)
    }

    pub fn volume_path(&self, id: &str) -> PathBuf {
        self.volumes_dir().join(id)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.store_path.join(IMAGES_DIR)
    }

    pub fn image_path(&self, id: &str) -> PathBuf {
        self.images_dir().join(id)
    }

    pub fn image_rootfs_path(&self, id: &str) -> PathBuf {
        self.image_path(id).join("rootfs")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.store_path.join(META_DIR)
    }

    pub fn dependencies_dir(&self) -> PathBuf {
        self.meta_dir().join(DEPENDENCIES_DIR)
    }

    pub fn volume_meta_path(&self, id: &str) -> PathBuf {
        self.meta_dir().join(format!("volume-{}.json", id))
    }

    pub fn namespace_file_path(&self) -> PathBuf {
        self.meta_dir().join("namespace.json")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.store_path.join(LOCKS_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.store_path.join(TMP_DIR)
    }

    pub fn whiteout_device_path(&self) -> PathBuf {
        self.store_path.join(WHITEOUT_DEVICE)
    }

    /// Create the store directory skeleton.
    pub fn prepare(&self) -> StrataResult<()> {
        for dir in [
            self.store_path.clone(),
            self.volumes_dir(),
            self.images_dir(),
            self.meta_dir(),
            self.dependencies_dir(),
            self.locks_dir(),
            self.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                StrataError::Backend(format!("creating {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Resolve an `<id|image path>` CLI argument to an image id. A path is
    /// accepted only when it points inside this store's images directory.
    pub fn find_image_id(&self, id_or_path: &str) -> StrataResult<String> {
        if !id_or_path.starts_with('/') {
            return Ok(id_or_path.to_string());
        }

        let path = Path::new(id_or_path);
        let images_dir = self.images_dir();
        match path.strip_prefix(&images_dir) {
            Ok(rest) => {
                let mut components = rest.components();
                let id = components
                    .next()
                    .and_then(|c| c.as_os_str().to_str())
                    .ok_or_else(|| {
                        StrataError::Invalid(format!("invalid image path `{}`", id_or_path))
                    })?;
                Ok(id.to_string())
            }
            Err(_) => Err(StrataError::Invalid(format!(
                "path `{}` is outside image directory {}",
                id_or_path,
                images_dir.display()
            ))),
        }
    }
}

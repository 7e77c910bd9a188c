//! Two-phase garbage collection of unused layer volumes.
//!
//! Mark renames every unused volume to a `gc.` tombstone; the rename is the
//! commit that takes the volume out of the pull hit-test path. Sweep then
//! destroys tombstones. A crash between the phases only leaves tombstones,
//! which the next sweep reaps.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::dependencies::DependencyManager;
use crate::errors::{StrataError, StrataResult};
use crate::store::layout::{GC_PREFIX, image_ref_key};

/// Volume capabilities the collector consumes.
pub trait GcVolumeDriver {
    fn list_volumes(&self) -> StrataResult<Vec<String>>;
    fn destroy_volume(&self, id: &str) -> StrataResult<()>;
    fn move_volume(&self, from: &Path, to: &Path) -> StrataResult<()>;
    fn volume_path(&self, id: &str) -> StrataResult<PathBuf>;
}

/// Read access to the set of existing images.
pub trait ImageLister {
    fn image_ids(&self) -> StrataResult<Vec<String>>;
}

pub struct GarbageCollector<'a> {
    volume_driver: &'a dyn GcVolumeDriver,
    image_lister: &'a dyn ImageLister,
    dependency_manager: &'a DependencyManager,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(
        volume_driver: &'a dyn GcVolumeDriver,
        image_lister: &'a dyn ImageLister,
        dependency_manager: &'a DependencyManager,
    ) -> Self {
        Self {
            volume_driver,
            image_lister,
            dependency_manager,
        }
    }

    /// Volumes no existing image depends on, excluding `chain_ids_to_preserve`
    /// (the layer set of an in-flight create) and volumes already tombstoned.
    pub fn unused_volumes(&self, chain_ids_to_preserve: &[String]) -> StrataResult<Vec<String>> {
        let mut orphaned: HashSet<String> = self
            .volume_driver
            .list_volumes()?
            .into_iter()
            .filter(|id| !id.starts_with(GC_PREFIX))
            .collect();

        for image_id in self.image_lister.image_ids()? {
            let dependencies = self
                .dependency_manager
                .dependencies(&image_ref_key(&image_id))?;
            for chain_id in dependencies {
                orphaned.remove(&chain_id);
            }
        }

        for chain_id in chain_ids_to_preserve {
            orphaned.remove(chain_id);
        }

        Ok(orphaned.into_iter().collect())
    }

    /// Phase M: claim every unused volume by renaming it to its tombstone.
    pub fn mark_unused(&self, chain_ids_to_preserve: &[String]) -> StrataResult<()> {
        let unused = self.unused_volumes(chain_ids_to_preserve)?;
        tracing::debug!(count = unused.len(), "marking-unused-volumes");

        let mut failed = 0usize;
        let total = unused.len();
        for id in &unused {
            let from = match self.volume_driver.volume_path(id) {
                Ok(path) => path,
                Err(StrataError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let to = from.with_file_name(format!("{}{}", GC_PREFIX, id));
            if let Err(e) = self.volume_driver.move_volume(&from, &to) {
                tracing::error!(volume = %id, error = %e, "marking-volume-failed");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(StrataError::Backend(format!(
                "marking unused volumes failed ({}/{})",
                failed, total
            )));
        }
        Ok(())
    }

    /// Phase S: destroy every tombstoned volume. One failure does not stop
    /// the sweep; a summary error reports the tally.
    pub fn collect(&self) -> StrataResult<()> {
        let tombstones: Vec<String> = self
            .volume_driver
            .list_volumes()?
            .into_iter()
            .filter(|id| id.starts_with(GC_PREFIX))
            .collect();
        tracing::debug!(count = tombstones.len(), "sweeping-tombstones");

        let total = tombstones.len();
        let mut failed = 0usize;
        for id in &tombstones {
            if let Err(e) = self.volume_driver.destroy_volume(id) {
                tracing::error!(volume = %id, error = %e, "destroying-volume-failed");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(StrataError::Backend(format!(
                "destroying volumes failed ({}/{})",
                failed, total
            )));
        }
        Ok(())
    }
}

//! Disk usage accounting for cleanup-threshold decisions.

use std::collections::HashSet;
use std::path::PathBuf;

use walkdir::WalkDir;

use crate::errors::StrataResult;
use crate::fs::meta::read_volume_meta;
use crate::store::layout::StoreLayout;

#[derive(Clone, Debug)]
pub struct StoreMeasurer {
    layout: StoreLayout,
}

impl StoreMeasurer {
    pub fn new(store_path: PathBuf) -> Self {
        Self {
            layout: StoreLayout::new(store_path),
        }
    }

    /// Total bytes used under the store directory.
    ///
    /// Volumes and images are subvolumes of the same filesystem, so a
    /// file-size walk over the tree is the usage the store is accountable
    /// for. Hard-linked blobs are deduplicated by inode.
    pub fn usage(&self) -> StrataResult<i64> {
        let mut seen_inodes = HashSet::new();
        let mut total: i64 = 0;

        for entry in WalkDir::new(self.layout.root()).into_iter() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    // Volumes can vanish mid-walk when a concurrent clean
                    // sweeps them.
                    tracing::debug!(error = %e, "skipping-unreadable-entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };

            use std::os::unix::fs::MetadataExt;
            if seen_inodes.insert((metadata.dev(), metadata.ino())) {
                total += metadata.len() as i64;
            }
        }

        Ok(total)
    }

    /// Bytes attributable to the given volumes, from their recorded unpack
    /// sizes. Volumes without metadata count as zero.
    pub fn cache_usage(&self, volume_ids: &[String]) -> i64 {
        let mut total: i64 = 0;
        for id in volume_ids {
            match read_volume_meta(&self.layout, id) {
                Ok(meta) => total += meta.size,
                Err(e) => {
                    tracing::debug!(volume = %id, error = %e, "volume-meta-unreadable");
                }
            }
        }
        total
    }
}

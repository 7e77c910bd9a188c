//! The copy-on-write filesystem driver.
//!
//! Everything under the store directory is owned by this module: subvolume
//! creation and destruction, snapshots, quota groups and per-volume
//! metadata. Other components reach storage only through the driver.

pub mod btrfs;
pub mod meta;
pub mod quota;

use serde::{Deserialize, Serialize};

pub use btrfs::{BtrfsConfig, BtrfsDriver};
pub use meta::VolumeMeta;
pub use quota::QuotaHelper;

/// A mount the caller must apply to finish composing a root filesystem.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    pub options: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total_bytes_used: i64,
    pub exclusive_bytes_used: i64,
}

/// Disk accounting for one working image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub disk_usage: DiskUsage,
}

//! UID/GID mapping between container namespace ids and host ids.

use serde::{Deserialize, Serialize};

use crate::errors::{StrataError, StrataResult};

/// One contiguous id range translation: namespace ids
/// `[namespace_id, namespace_id + size)` map to host ids starting at
/// `host_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub namespace_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    /// Parse the CLI form `<namespace id>:<host id>:<size>`.
    pub fn parse(raw: &str) -> StrataResult<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            return Err(StrataError::Invalid(format!(
                "expected <namespace id>:<host id>:<size>, got `{}`",
                raw
            )));
        }

        let field = |idx: usize, name: &str| -> StrataResult<u32> {
            parts[idx].parse::<u32>().map_err(|e| {
                StrataError::Invalid(format!("parsing {} in `{}`: {}", name, raw, e))
            })
        };

        Ok(Self {
            namespace_id: field(0, "namespace id")?,
            host_id: field(1, "host id")?,
            size: field(2, "size")?,
        })
    }

    fn contains(&self, id: u32) -> bool {
        id >= self.namespace_id && id - self.namespace_id < self.size
    }
}

/// The store's full translation table, persisted once at init time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappings {
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
}

impl IdMappings {
    pub fn is_empty(&self) -> bool {
        self.uid_mappings.is_empty() && self.gid_mappings.is_empty()
    }

    /// The host owner of the store: the host id that namespace root maps to,
    /// when a single-id root mapping exists. Defaults to the current
    /// process's ids otherwise.
    pub fn store_owner(&self) -> (u32, u32) {
        let uid = Self::mapped_root(&self.uid_mappings)
            .unwrap_or_else(|| unsafe { libc::getuid() });
        let gid = Self::mapped_root(&self.gid_mappings)
            .unwrap_or_else(|| unsafe { libc::getgid() });
        (uid, gid)
    }

    fn mapped_root(mappings: &[IdMapping]) -> Option<u32> {
        mappings
            .iter()
            .find(|m| m.size == 1 && m.namespace_id == 0)
            .map(|m| m.host_id)
    }
}

/// Translate `id` through `mappings`. Ids outside every range pass through.
pub fn map_id(mappings: &[IdMapping], id: u32) -> u32 {
    for mapping in mappings {
        if mapping.contains(id) {
            return mapping.host_id + (id - mapping.namespace_id);
        }
    }
    id
}

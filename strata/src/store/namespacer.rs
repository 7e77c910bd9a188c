//! Persistence of the store's id-mapping identity.
//!
//! The mappings are written once by `init-store` and read by every later
//! operation. They cannot change for the lifetime of the store: unpacked
//! layer ownership is derived from them, so a drifting mapping would corrupt
//! the cache.

use std::fs;
use std::path::PathBuf;

use crate::errors::{StrataError, StrataResult};
use crate::idmap::IdMappings;
use crate::store::layout::StoreLayout;

#[derive(Clone, Debug)]
pub struct StoreNamespacer {
    namespace_file: PathBuf,
}

impl StoreNamespacer {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            namespace_file: layout.namespace_file_path(),
        }
    }

    /// Read the mappings the store was initialized with.
    pub fn read(&self) -> StrataResult<IdMappings> {
        let contents = fs::read_to_string(&self.namespace_file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StrataError::NotFound(format!(
                    "namespace file {} not found, has the store been initialized?",
                    self.namespace_file.display()
                ))
            } else {
                StrataError::Backend(format!(
                    "reading namespace file {}: {}",
                    self.namespace_file.display(),
                    e
                ))
            }
        })?;

        serde_json::from_str(&contents).map_err(|e| {
            StrataError::Backend(format!(
                "parsing namespace file {}: {}",
                self.namespace_file.display(),
                e
            ))
        })
    }

    /// Persist `mappings`, or verify them against a previous init.
    ///
    /// Re-initializing with identical mappings is a no-op; different
    /// mappings are refused because the existing cache was built with the
    /// old translation.
    pub fn apply(&self, mappings: &IdMappings) -> StrataResult<()> {
        if self.namespace_file.exists() {
            let existing = self.read()?;
            if &existing != mappings {
                return Err(StrataError::ConfigMismatch(format!(
                    "store already initialized with different mappings ({})",
                    self.namespace_file.display()
                )));
            }
            return Ok(());
        }

        let contents = serde_json::to_vec_pretty(mappings)?;
        fs::write(&self.namespace_file, contents).map_err(|e| {
            StrataError::Backend(format!(
                "writing namespace file {}: {}",
                self.namespace_file.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.namespace_file.display(), "wrote-namespace-file");
        Ok(())
    }
}

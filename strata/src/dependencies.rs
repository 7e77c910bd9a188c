//! Image -> layer dependency records.
//!
//! One JSON file per image under `<store>/meta/dependencies`, holding the
//! ordered chain ids the image consumes. The garbage collector treats every
//! chain id referenced here as live.

use std::fs;
use std::path::PathBuf;

use crate::errors::{StrataError, StrataResult};

#[derive(Clone, Debug)]
pub struct DependencyManager {
    dependencies_path: PathBuf,
}

impl DependencyManager {
    pub fn new(dependencies_path: PathBuf) -> Self {
        Self { dependencies_path }
    }

    /// Record that `id` depends on `chain_ids`, in order.
    pub fn register(&self, id: &str, chain_ids: &[String]) -> StrataResult<()> {
        let data = serde_json::to_vec(chain_ids)?;
        let path = self.file_path(id);
        fs::write(&path, data).map_err(|e| {
            StrataError::Backend(format!(
                "writing dependency record {}: {}",
                path.display(),
                e
            ))
        })?;
        tracing::debug!(id, count = chain_ids.len(), "registered-dependencies");
        Ok(())
    }

    /// Remove the record for `id`. A missing record is NotFound so callers
    /// can decide whether that matters.
    pub fn deregister(&self, id: &str) -> StrataResult<()> {
        let path = self.file_path(id);
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StrataError::NotFound(format!("image `{}` not found", id))
            } else {
                StrataError::Backend(format!(
                    "removing dependency record {}: {}",
                    path.display(),
                    e
                ))
            }
        })
    }

    /// The chain ids `id` was registered with.
    pub fn dependencies(&self, id: &str) -> StrataResult<Vec<String>> {
        let path = self.file_path(id);
        let contents = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StrataError::NotFound(format!("image `{}` not found", id))
            } else {
                StrataError::Backend(format!(
                    "reading dependency record {}: {}",
                    path.display(),
                    e
                ))
            }
        })?;

        serde_json::from_slice(&contents).map_err(|e| {
            StrataError::Backend(format!(
                "parsing dependency record {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn file_path(&self, id: &str) -> PathBuf {
        let escaped = id.replace('/', "__");
        self.dependencies_path.join(format!("{}.json", escaped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> DependencyManager {
        DependencyManager::new(dir.path().to_path_buf())
    }

    #[test]
    fn test_register_then_dependencies_round_trips() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let chain_ids = vec!["c1".to_string(), "c2".to_string()];
        manager.register("image:my-image", &chain_ids).unwrap();
        assert_eq!(manager.dependencies("image:my-image").unwrap(), chain_ids);
    }

    #[test]
    fn test_keys_with_slashes_are_escaped() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager
            .register("image:docker/library/busybox", &["c1".to_string()])
            .unwrap();
        assert!(
            dir.path()
                .join("image:docker__library__busybox.json")
                .exists()
        );
    }

    #[test]
    fn test_dependencies_of_unknown_image_is_not_found() {
        let dir = TempDir::new().unwrap();
        match manager(&dir).dependencies("image:nope") {
            Err(StrataError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_deregister_removes_record() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.register("image:x", &["c1".to_string()]).unwrap();
        manager.deregister("image:x").unwrap();
        assert!(manager.dependencies("image:x").is_err());
    }

    #[test]
    fn test_deregister_missing_record_is_not_found() {
        let dir = TempDir::new().unwrap();
        match manager(&dir).deregister("image:nope") {
            Err(StrataError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }
}

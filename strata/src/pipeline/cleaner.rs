//! Store-wide cleanup.

use std::time::Instant;

use crate::errors::{StrataError, StrataResult};
use crate::gc::GarbageCollector;
use crate::locksmith::{FileSystemLocksmith, GLOBAL_LOCK_KEY};
use crate::store::measurer::StoreMeasurer;
use crate::telemetry::Emitter;

pub struct Cleaner<'a> {
    locksmith: &'a FileSystemLocksmith,
    measurer: &'a StoreMeasurer,
    gc: &'a GarbageCollector<'a>,
    metrics: Emitter,
}

impl<'a> Cleaner<'a> {
    pub fn new(
        locksmith: &'a FileSystemLocksmith,
        measurer: &'a StoreMeasurer,
        gc: &'a GarbageCollector<'a>,
        metrics: Emitter,
    ) -> Self {
        Self {
            locksmith,
            measurer,
            gc,
            metrics,
        }
    }

    /// Collect unused volumes unless store usage is still below
    /// `threshold_bytes`. Returns true when the clean was skipped.
    ///
    /// `chain_ids_to_preserve` names volumes an in-flight create is about
    /// to depend on; they survive even though no image references them yet.
    pub fn clean(
        &self,
        threshold_bytes: i64,
        chain_ids_to_preserve: &[String],
    ) -> StrataResult<bool> {
        let start = Instant::now();

        if threshold_bytes < 0 {
            return Err(StrataError::Invalid(format!(
                "clean threshold cannot be negative: {}",
                threshold_bytes
            )));
        }

        if threshold_bytes > 0 {
            let usage = self.measurer.usage()?;
            if usage < threshold_bytes {
                tracing::info!(usage, threshold_bytes, "threshold-not-reached-skipping-clean");
                return Ok(true);
            }
        }

        // Exclusive: no create may observe a half-swept store, and two
        // cleans must not race each other's renames.
        let _lock = self.locksmith.lock_exclusive(GLOBAL_LOCK_KEY)?;

        self.gc.mark_unused(chain_ids_to_preserve)?;
        let result = self.gc.collect();

        self.metrics
            .try_emit_duration_from("ImageCleanTime", start);
        result.map(|()| false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::DependencyManager;
    use crate::gc::{GcVolumeDriver, ImageLister};
    use crate::store::layout::StoreLayout;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct DirDriver {
        volumes_dir: PathBuf,
    }

    impl GcVolumeDriver for DirDriver {
        fn list_volumes(&self) -> StrataResult<Vec<String>> {
            Ok(std::fs::read_dir(&self.volumes_dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect())
        }

        fn destroy_volume(&self, id: &str) -> StrataResult<()> {
            std::fs::remove_dir_all(self.volumes_dir.join(id)).unwrap();
            Ok(())
        }

        fn move_volume(&self, from: &Path, to: &Path) -> StrataResult<()> {
            std::fs::rename(from, to).map_err(|e| StrataError::Backend(e.to_string()))
        }

        fn volume_path(&self, id: &str) -> StrataResult<PathBuf> {
            let path = self.volumes_dir.join(id);
            if path.exists() {
                Ok(path)
            } else {
                Err(StrataError::NotFound(id.to_string()))
            }
        }
    }

    struct NoImages;

    impl ImageLister for NoImages {
        fn image_ids(&self) -> StrataResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        _dir: TempDir,
        layout: StoreLayout,
        driver: DirDriver,
        deps: DependencyManager,
        locksmith: FileSystemLocksmith,
        measurer: StoreMeasurer,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let layout = StoreLayout::new(dir.path().to_path_buf());
            layout.prepare().unwrap();
            Self {
                driver: DirDriver {
                    volumes_dir: layout.volumes_dir(),
                },
                deps: DependencyManager::new(layout.dependencies_dir()),
                locksmith: FileSystemLocksmith::new(layout.locks_dir(), Emitter::default()),
                measurer: StoreMeasurer::new(dir.path().to_path_buf()),
                layout,
                _dir: dir,
            }
        }

        fn add_volume_with_payload(&self, id: &str, bytes: usize) {
            let path = self.layout.volume_path(id);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("payload"), vec![0u8; bytes]).unwrap();
        }
    }

    #[test]
    fn test_negative_threshold_is_invalid() {
        let fixture = Fixture::new();
        let images = NoImages;
        let gc = GarbageCollector::new(&fixture.driver, &images, &fixture.deps);
        let cleaner = Cleaner::new(&fixture.locksmith, &fixture.measurer, &gc, Emitter::default());

        match cleaner.clean(-1, &[]) {
            Err(StrataError::Invalid(_)) => {}
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_below_threshold_skips_collection() {
        let fixture = Fixture::new();
        fixture.add_volume_with_payload("chain-1", 10);
        let images = NoImages;
        let gc = GarbageCollector::new(&fixture.driver, &images, &fixture.deps);
        let cleaner = Cleaner::new(&fixture.locksmith, &fixture.measurer, &gc, Emitter::default());

        let noop = cleaner.clean(1_000_000_000, &[]).unwrap();
        assert!(noop);
        assert!(fixture.layout.volume_path("chain-1").exists());
    }

    #[test]
    fn test_zero_threshold_always_collects() {
        let fixture = Fixture::new();
        fixture.add_volume_with_payload("chain-1", 10);
        let images = NoImages;
        let gc = GarbageCollector::new(&fixture.driver, &images, &fixture.deps);
        let cleaner = Cleaner::new(&fixture.locksmith, &fixture.measurer, &gc, Emitter::default());

        let noop = cleaner.clean(0, &[]).unwrap();
        assert!(!noop);
        assert!(!fixture.layout.volume_path("chain-1").exists());
    }

    #[test]
    fn test_preserved_chain_ids_survive_clean() {
        let fixture = Fixture::new();
        fixture.add_volume_with_payload("chain-1", 10);
        fixture.add_volume_with_payload("chain-2", 10);
        let images = NoImages;
        let gc = GarbageCollector::new(&fixture.driver, &images, &fixture.deps);
        let cleaner = Cleaner::new(&fixture.locksmith, &fixture.measurer, &gc, Emitter::default());

        cleaner.clean(0, &["chain-1".to_string()]).unwrap();

        assert!(fixture.layout.volume_path("chain-1").exists());
        assert!(!fixture.layout.volume_path("chain-2").exists());
    }
}

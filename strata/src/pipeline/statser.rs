//! Read-only image statistics.

use std::time::Instant;

use crate::cloner::ImageCloner;
use crate::errors::StrataResult;
use crate::fs::VolumeStats;
use crate::telemetry::Emitter;

pub struct Statser<'a> {
    image_cloner: &'a ImageCloner<'a>,
    metrics: Emitter,
}

impl<'a> Statser<'a> {
    pub fn new(image_cloner: &'a ImageCloner<'a>, metrics: Emitter) -> Self {
        Self {
            image_cloner,
            metrics,
        }
    }

    pub fn stats(&self, id: &str) -> StrataResult<VolumeStats> {
        let start = Instant::now();
        let stats = self.image_cloner.stats(id)?;
        self.metrics
            .try_emit_duration_from("ImageStatsTime", start);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloner::{ImageDriver, ImageDriverSpec};
    use crate::errors::StrataError;
    use crate::fs::{DiskUsage, MountInfo};
    use crate::store::layout::StoreLayout;
    use std::path::Path;
    use tempfile::TempDir;

    struct StatsDriver;

    impl ImageDriver for StatsDriver {
        fn create_image(&self, _spec: &ImageDriverSpec) -> StrataResult<Option<MountInfo>> {
            Ok(None)
        }

        fn destroy_image(&self, _image_path: &Path) -> StrataResult<()> {
            Ok(())
        }

        fn fetch_stats(&self, _image_path: &Path) -> StrataResult<VolumeStats> {
            Ok(VolumeStats {
                disk_usage: DiskUsage {
                    total_bytes_used: 4096,
                    exclusive_bytes_used: 1024,
                },
            })
        }
    }

    #[test]
    fn test_stats_returns_driver_usage() {
        let dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        std::fs::create_dir_all(layout.image_path("img-1")).unwrap();

        let driver = StatsDriver;
        let cloner = ImageCloner::new(&driver, layout);
        let statser = Statser::new(&cloner, Emitter::default());

        let stats = statser.stats("img-1").unwrap();
        assert_eq!(stats.disk_usage.total_bytes_used, 4096);
        assert_eq!(stats.disk_usage.exclusive_bytes_used, 1024);
    }

    #[test]
    fn test_stats_of_unknown_image_is_not_found() {
        let dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();

        let driver = StatsDriver;
        let cloner = ImageCloner::new(&driver, layout);
        let statser = Statser::new(&cloner, Emitter::default());

        match statser.stats("ghost") {
            Err(StrataError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }
}

//! The create pipeline: clean (optionally), pull, clone, register.

use std::time::Instant;

use crate::cloner::{ImageCloner, ImageInfo, ImageSpec};
use crate::dependencies::DependencyManager;
use crate::errors::{StrataError, StrataResult};
use crate::locksmith::{FileSystemLocksmith, GLOBAL_LOCK_KEY};
use crate::pipeline::cleaner::Cleaner;
use crate::puller::{BaseImagePuller, PullSpec};
use crate::store::layout::image_ref_key;
use crate::telemetry::Emitter;

#[derive(Clone, Debug, Default)]
pub struct CreateSpec {
    pub id: String,
    pub mount: bool,
    pub disk_limit: i64,
    pub exclude_base_image_from_quota: bool,
    pub clean_on_create: bool,
    pub clean_threshold_bytes: i64,
    pub owner_uid: u32,
    pub owner_gid: u32,
}

pub struct Creator<'a> {
    image_cloner: &'a ImageCloner<'a>,
    base_image_puller: &'a BaseImagePuller<'a>,
    dependency_manager: &'a DependencyManager,
    locksmith: &'a FileSystemLocksmith,
    cleaner: &'a Cleaner<'a>,
    metrics: Emitter,
}

impl<'a> Creator<'a> {
    pub fn new(
        image_cloner: &'a ImageCloner<'a>,
        base_image_puller: &'a BaseImagePuller<'a>,
        dependency_manager: &'a DependencyManager,
        locksmith: &'a FileSystemLocksmith,
        cleaner: &'a Cleaner<'a>,
        metrics: Emitter,
    ) -> Self {
        Self {
            image_cloner,
            base_image_puller,
            dependency_manager,
            locksmith,
            cleaner,
            metrics,
        }
    }

    pub fn create(&self, spec: &CreateSpec) -> StrataResult<ImageInfo> {
        let start = Instant::now();

        if spec.id.is_empty() || spec.id.contains('/') {
            return Err(StrataError::Invalid(format!(
                "invalid image id `{}`",
                spec.id
            )));
        }
        if self.image_cloner.exists(&spec.id) {
            return Err(StrataError::Conflict(format!(
                "image `{}` already exists",
                spec.id
            )));
        }

        let base_image = self.base_image_puller.fetch_base_image_info()?;
        let chain_ids = base_image.chain_ids();

        if spec.clean_on_create {
            // Our own layers are not registered yet; preserve them from the
            // collector explicitly.
            self.cleaner
                .clean(spec.clean_threshold_bytes, &chain_ids)
                .map_err(|e| e.wrap("failed-to-cleanup-store"))?;
        }

        // Creates share the store; only clean and store deletion are
        // exclusive against them.
        let _lock = self.locksmith.lock_shared(GLOBAL_LOCK_KEY)?;

        self.base_image_puller.pull(
            &base_image,
            &PullSpec {
                disk_limit: spec.disk_limit,
                exclude_base_image_from_quota: spec.exclude_base_image_from_quota,
                owner_uid: spec.owner_uid,
                owner_gid: spec.owner_gid,
            },
        )?;

        let image_info = self.image_cloner.create(&ImageSpec {
            id: spec.id.clone(),
            mount: spec.mount,
            disk_limit: spec.disk_limit,
            exclude_base_image_from_quota: spec.exclude_base_image_from_quota,
            base_volume_ids: chain_ids.clone(),
            config: base_image.config.clone(),
            owner_uid: spec.owner_uid,
            owner_gid: spec.owner_gid,
        })?;

        if let Err(e) = self
            .dependency_manager
            .register(&image_ref_key(&spec.id), &chain_ids)
        {
            // An image without a dependency record would be eligible for
            // GC mid-use; take it down again.
            if let Err(destroy_err) = self.image_cloner.destroy(&spec.id) {
                tracing::error!(
                    id = %spec.id,
                    error = %destroy_err,
                    "destroying-image-after-failed-registration"
                );
            }
            return Err(e.wrap("registering image dependencies"));
        }

        self.metrics
            .try_emit_duration_from("ImageCreationTime", start);
        Ok(image_info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloner::{ImageDriver, ImageDriverSpec};
    use crate::fs::meta::VolumeMeta;
    use crate::fs::{MountInfo, VolumeStats};
    use crate::gc::{GcVolumeDriver, ImageLister};
    use crate::idmap::IdMappings;
    use crate::image::source::ImageSource;
    use crate::image::{BaseImageInfo, ImageConfig, LayerInfo};
    use crate::puller::VolumeDriver;
    use crate::store::layout::StoreLayout;
    use crate::store::measurer::StoreMeasurer;
    use crate::unpack::{UnpackOutput, UnpackSpec, Unpacker};
    use std::io::Read;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    // A driver over plain directories implementing every capability the
    // create pipeline needs.
    struct DirDriver {
        layout: StoreLayout,
    }

    impl VolumeDriver for DirDriver {
        fn volume_path(&self, id: &str) -> StrataResult<PathBuf> {
            let path = self.layout.volume_path(id);
            if path.exists() {
                Ok(path)
            } else {
                Err(StrataError::NotFound(format!("volume does not exist `{}`", id)))
            }
        }

        fn create_volume(&self, _parent_id: &str, id: &str) -> StrataResult<PathBuf> {
            let path = self.layout.volume_path(id);
            std::fs::create_dir_all(&path).unwrap();
            Ok(path)
        }

        fn destroy_volume(&self, id: &str) -> StrataResult<()> {
            let path = self.layout.volume_path(id);
            if path.exists() {
                std::fs::remove_dir_all(path).unwrap();
            }
            Ok(())
        }

        fn move_volume(&self, from: &Path, to: &Path) -> StrataResult<()> {
            match std::fs::rename(from, to) {
                Ok(()) => Ok(()),
                Err(_) if to.exists() => Ok(()),
                Err(e) => Err(StrataError::Backend(e.to_string())),
            }
        }

        fn write_volume_meta(&self, id: &str, meta: &VolumeMeta) -> StrataResult<()> {
            crate::fs::meta::write_volume_meta(&self.layout, id, meta)
        }

        fn handle_opaque_whiteouts(&self, _id: &str, _entries: &[String]) -> StrataResult<()> {
            Ok(())
        }
    }

    impl ImageDriver for DirDriver {
        fn create_image(&self, spec: &ImageDriverSpec) -> StrataResult<Option<MountInfo>> {
            std::fs::create_dir_all(spec.image_path.join("rootfs")).unwrap();
            Ok(None)
        }

        fn destroy_image(&self, image_path: &Path) -> StrataResult<()> {
            if image_path.exists() {
                std::fs::remove_dir_all(image_path).unwrap();
            }
            Ok(())
        }

        fn fetch_stats(&self, _image_path: &Path) -> StrataResult<VolumeStats> {
            Ok(VolumeStats::default())
        }
    }

    impl GcVolumeDriver for DirDriver {
        fn list_volumes(&self) -> StrataResult<Vec<String>> {
            Ok(std::fs::read_dir(self.layout.volumes_dir())
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect())
        }

        fn destroy_volume(&self, id: &str) -> StrataResult<()> {
            VolumeDriver::destroy_volume(self, id)
        }

        fn move_volume(&self, from: &Path, to: &Path) -> StrataResult<()> {
            VolumeDriver::move_volume(self, from, to)
        }

        fn volume_path(&self, id: &str) -> StrataResult<PathBuf> {
            VolumeDriver::volume_path(self, id)
        }
    }

    struct StaticSource {
        info: BaseImageInfo,
    }

    impl ImageSource for StaticSource {
        fn base_image_info(&self) -> StrataResult<BaseImageInfo> {
            Ok(self.info.clone())
        }

        fn stream_blob(&self, _layer: &LayerInfo) -> StrataResult<(Box<dyn Read + Send>, i64)> {
            Ok((Box::new(std::io::Cursor::new(Vec::new())), 0))
        }
    }

    struct NullUnpacker;

    impl Unpacker for NullUnpacker {
        fn unpack(&self, _spec: UnpackSpec) -> StrataResult<UnpackOutput> {
            Ok(UnpackOutput::default())
        }
    }

    struct ClonerImages<'a> {
        layout: &'a StoreLayout,
    }

    impl ImageLister for ClonerImages<'_> {
        fn image_ids(&self) -> StrataResult<Vec<String>> {
            Ok(std::fs::read_dir(self.layout.images_dir())
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect())
        }
    }

    fn two_layer_image() -> BaseImageInfo {
        BaseImageInfo {
            layer_infos: vec![
                LayerInfo {
                    blob_id: "blob-1".to_string(),
                    chain_id: "chain-1".to_string(),
                    ..Default::default()
                },
                LayerInfo {
                    blob_id: "blob-2".to_string(),
                    chain_id: "chain-2".to_string(),
                    parent_chain_id: "chain-1".to_string(),
                    ..Default::default()
                },
            ],
            config: ImageConfig::default(),
        }
    }

    struct Fixture {
        _dir: TempDir,
        layout: StoreLayout,
        driver: DirDriver,
        deps: DependencyManager,
        locksmith: FileSystemLocksmith,
        measurer: StoreMeasurer,
        source: StaticSource,
        unpacker: NullUnpacker,
    }

    impl Fixture {
        fn new(info: BaseImageInfo) -> Self {
            let dir = TempDir::new().unwrap();
            let layout = StoreLayout::new(dir.path().to_path_buf());
            layout.prepare().unwrap();
            Self {
                driver: DirDriver {
                    layout: layout.clone(),
                },
                deps: DependencyManager::new(layout.dependencies_dir()),
                locksmith: FileSystemLocksmith::new(layout.locks_dir(), Emitter::default()),
                measurer: StoreMeasurer::new(layout.root().to_path_buf()),
                source: StaticSource { info },
                unpacker: NullUnpacker,
                layout,
                _dir: dir,
            }
        }

        fn run_create(&self, spec: &CreateSpec) -> StrataResult<ImageInfo> {
            let cloner = ImageCloner::new(&self.driver, self.layout.clone());
            let puller = BaseImagePuller::new(
                &self.source,
                &self.unpacker,
                &self.driver,
                &self.locksmith,
                Emitter::default(),
                IdMappings::default(),
                self.layout.whiteout_device_path(),
            );
            let images = ClonerImages {
                layout: &self.layout,
            };
            let gc = crate::gc::GarbageCollector::new(&self.driver, &images, &self.deps);
            let cleaner = Cleaner::new(&self.locksmith, &self.measurer, &gc, Emitter::default());
            let creator = Creator::new(
                &cloner,
                &puller,
                &self.deps,
                &self.locksmith,
                &cleaner,
                Emitter::default(),
            );
            creator.create(spec)
        }
    }

    #[test]
    fn test_create_materializes_volumes_image_and_dependencies() {
        let fixture = Fixture::new(two_layer_image());

        let info = fixture
            .run_create(&CreateSpec {
                id: "img-1".to_string(),
                mount: true,
                ..Default::default()
            })
            .unwrap();

        assert!(fixture.layout.volume_path("chain-1").is_dir());
        assert!(fixture.layout.volume_path("chain-2").is_dir());
        assert!(info.rootfs.is_dir());
        assert_eq!(
            fixture.deps.dependencies("image:img-1").unwrap(),
            vec!["chain-1".to_string(), "chain-2".to_string()]
        );
    }

    #[test]
    fn test_create_rejects_invalid_ids() {
        let fixture = Fixture::new(two_layer_image());

        for bad in ["", "with/slash"] {
            match fixture.run_create(&CreateSpec {
                id: bad.to_string(),
                ..Default::default()
            }) {
                Err(StrataError::Invalid(_)) => {}
                other => panic!("expected Invalid for `{}`, got {:?}", bad, other.map(|_| ())),
            }
        }
    }

    #[test]
    fn test_create_conflicts_on_existing_image() {
        let fixture = Fixture::new(two_layer_image());
        let spec = CreateSpec {
            id: "img-1".to_string(),
            ..Default::default()
        };

        fixture.run_create(&spec).unwrap();
        match fixture.run_create(&spec) {
            Err(StrataError::Conflict(_)) => {}
            other => panic!("expected Conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_clean_on_create_preserves_the_image_being_created() {
        let fixture = Fixture::new(two_layer_image());

        // A stale volume from a deleted image, plus the two layers the
        // create is about to use, already cached.
        std::fs::create_dir_all(fixture.layout.volume_path("stale")).unwrap();
        std::fs::create_dir_all(fixture.layout.volume_path("chain-1")).unwrap();
        std::fs::create_dir_all(fixture.layout.volume_path("chain-2")).unwrap();

        fixture
            .run_create(&CreateSpec {
                id: "img-1".to_string(),
                clean_on_create: true,
                ..Default::default()
            })
            .unwrap();

        assert!(fixture.layout.volume_path("chain-1").is_dir());
        assert!(fixture.layout.volume_path("chain-2").is_dir());
        assert!(!fixture.layout.volume_path("stale").exists());
    }
}

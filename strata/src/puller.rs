//! The base-image pull pipeline.
//!
//! Turns an ordered list of layer descriptors into finalized layer volumes,
//! idempotently and with at most one concurrent builder per chain id. Layers
//! are processed strictly parent-before-child; each one is built in a
//! temporary volume and published by an atomic rename.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::errors::{StrataError, StrataResult};
use crate::fs::meta::VolumeMeta;
use crate::idmap::IdMappings;
use crate::image::source::ImageSource;
use crate::image::{BaseImageInfo, LayerInfo};
use crate::locksmith::FileSystemLocksmith;
use crate::telemetry::Emitter;
use crate::unpack::{UnpackSpec, Unpacker};

/// Volume capabilities the puller consumes.
pub trait VolumeDriver {
    fn volume_path(&self, id: &str) -> StrataResult<PathBuf>;
    fn create_volume(&self, parent_id: &str, id: &str) -> StrataResult<PathBuf>;
    fn destroy_volume(&self, id: &str) -> StrataResult<()>;
    fn move_volume(&self, from: &Path, to: &Path) -> StrataResult<()>;
    fn write_volume_meta(&self, id: &str, volume_meta: &VolumeMeta) -> StrataResult<()>;
    fn handle_opaque_whiteouts(&self, id: &str, entries: &[String]) -> StrataResult<()>;
}

#[derive(Clone, Debug, Default)]
pub struct PullSpec {
    pub disk_limit: i64,
    pub exclude_base_image_from_quota: bool,
    /// When non-zero, every built volume root is chowned to this pair.
    pub owner_uid: u32,
    pub owner_gid: u32,
}

pub struct BaseImagePuller<'a> {
    source: &'a dyn ImageSource,
    unpacker: &'a dyn Unpacker,
    volume_driver: &'a dyn VolumeDriver,
    locksmith: &'a FileSystemLocksmith,
    metrics: Emitter,
    mappings: IdMappings,
    whiteout_device_path: PathBuf,
}

impl<'a> BaseImagePuller<'a> {
    pub fn new(
        source: &'a dyn ImageSource,
        unpacker: &'a dyn Unpacker,
        volume_driver: &'a dyn VolumeDriver,
        locksmith: &'a FileSystemLocksmith,
        metrics: Emitter,
        mappings: IdMappings,
        whiteout_device_path: PathBuf,
    ) -> Self {
        Self {
            source,
            unpacker,
            volume_driver,
            locksmith,
            metrics,
            mappings,
            whiteout_device_path,
        }
    }

    /// Resolve the image into layer descriptors and configuration.
    pub fn fetch_base_image_info(&self) -> StrataResult<BaseImageInfo> {
        self.source.base_image_info()
    }

    /// Materialize every layer of `base_image` as a finalized volume.
    pub fn pull(&self, base_image: &BaseImageInfo, spec: &PullSpec) -> StrataResult<()> {
        self.check_quota_admission(base_image, spec)?;

        for layer in &base_image.layer_infos {
            self.build_layer(layer, spec)
                .map_err(|e| e.wrap(&format!("building layer `{}`", layer.blob_id)))?;
        }
        Ok(())
    }

    /// An inclusive disk limit must admit the whole declared layer set
    /// before anything is built.
    fn check_quota_admission(
        &self,
        base_image: &BaseImageInfo,
        spec: &PullSpec,
    ) -> StrataResult<()> {
        if spec.disk_limit <= 0 || spec.exclude_base_image_from_quota {
            return Ok(());
        }

        let total: i64 = base_image.layer_infos.iter().map(|l| l.size).sum();
        if total > spec.disk_limit {
            return Err(StrataError::QuotaExceeded(format!(
                "layers exceed disk quota: {} bytes needed, limit is {}",
                total, spec.disk_limit
            )));
        }
        Ok(())
    }

    fn build_layer(&self, layer: &LayerInfo, spec: &PullSpec) -> StrataResult<()> {
        // Hit test outside the lock first: finalized volumes are immutable,
        // a positive answer never goes stale.
        if self.volume_exists(&layer.chain_id)? {
            tracing::debug!(chain_id = %layer.chain_id, "layer-already-materialized");
            return Ok(());
        }

        let _lock = self.locksmith.lock_exclusive(&layer.chain_id)?;

        // Another builder may have finalized while we waited for the lock.
        if self.volume_exists(&layer.chain_id)? {
            tracing::debug!(chain_id = %layer.chain_id, "layer-materialized-while-locked");
            return Ok(());
        }

        let temp_name = temporary_volume_name(&layer.chain_id);
        let temp_path = self
            .volume_driver
            .create_volume(&layer.parent_chain_id, &temp_name)
            .map_err(|e| e.wrap("creating volume"))?;
        tracing::debug!(path = %temp_path.display(), "volume-created");

        match self.populate_layer(layer, spec, &temp_name, &temp_path) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(cleanup_err) = self.volume_driver.destroy_volume(&temp_name) {
                    tracing::error!(
                        volume = %temp_name,
                        error = %cleanup_err,
                        "temp-volume-cleanup-failed"
                    );
                }
                Err(e)
            }
        }
    }

    fn populate_layer(
        &self,
        layer: &LayerInfo,
        spec: &PullSpec,
        temp_name: &str,
        temp_path: &Path,
    ) -> StrataResult<()> {
        if spec.owner_uid != 0 || spec.owner_gid != 0 {
            std::os::unix::fs::chown(temp_path, Some(spec.owner_uid), Some(spec.owner_gid))
                .map_err(|e| {
                    StrataError::Backend(format!(
                        "changing volume ownership to {}:{}: {}",
                        spec.owner_uid, spec.owner_gid, e
                    ))
                })?;
        }

        if !layer.base_directory.is_empty() {
            self.ensure_base_directory(layer, temp_path)?;
        }

        let download_start = Instant::now();
        let streamed = self.source.stream_blob(layer);
        self.metrics
            .try_emit_duration_from("DownloadTime", download_start);
        let (stream, blob_size) = streamed?;
        tracing::debug!(blob = %layer.blob_id, blob_size, "blob-streamed");

        let unpack_start = Instant::now();
        let unpacked = self.unpacker.unpack(UnpackSpec {
            stream,
            target_path: temp_path.to_path_buf(),
            base_directory: layer.base_directory.clone(),
            uid_mappings: self.mappings.uid_mappings.clone(),
            gid_mappings: self.mappings.gid_mappings.clone(),
            whiteout_device_path: self.whiteout_device_path.clone(),
        });
        self.metrics
            .try_emit_duration_from("UnpackTime", unpack_start);
        let output = unpacked.map_err(|e| e.wrap("unpacking layer"))?;

        self.volume_driver
            .handle_opaque_whiteouts(temp_name, &output.opaque_whiteouts)
            .map_err(|e| e.wrap("handling opaque whiteouts"))?;

        self.volume_driver.write_volume_meta(
            &layer.chain_id,
            &VolumeMeta {
                size: output.bytes_written,
            },
        )?;

        // The rename is the linearization point: the volume becomes visible
        // under its chain id, complete, or not at all.
        let final_path = temp_path
            .parent()
            .map(|dir| dir.join(&layer.chain_id))
            .ok_or_else(|| {
                StrataError::Backend(format!(
                    "temporary volume has no parent directory: {}",
                    temp_path.display()
                ))
            })?;
        self.volume_driver
            .move_volume(temp_path, &final_path)
            .map_err(|e| e.wrap("finalizing volume"))?;

        // Losing the race leaves our temp volume behind; the winner's copy
        // is the one under the chain id.
        if temp_path.exists() {
            self.volume_driver.destroy_volume(temp_name)?;
        }

        tracing::info!(chain_id = %layer.chain_id, "layer-finalized");
        Ok(())
    }

    /// Make sure every component of the layer's base directory exists in
    /// the new volume. Components inherited from the parent snapshot are
    /// left exactly as they are; missing ones are created with the mode and
    /// ownership their counterpart has in the parent volume.
    fn ensure_base_directory(&self, layer: &LayerInfo, volume_path: &Path) -> StrataResult<()> {
        let parent_volume_path = if layer.parent_chain_id.is_empty() {
            None
        } else {
            Some(self.volume_driver.volume_path(&layer.parent_chain_id)?)
        };

        let relative = layer.base_directory.trim_start_matches('/');
        let mut accumulated = PathBuf::new();

        for component in Path::new(relative).components() {
            accumulated.push(component);
            let in_volume = volume_path.join(&accumulated);
            if in_volume.exists() {
                continue;
            }

            let Some(parent_volume) = &parent_volume_path else {
                return Err(StrataError::BaseDirectoryMissing(format!(
                    "`/{}`",
                    accumulated.display()
                )));
            };
            let in_parent = parent_volume.join(&accumulated);
            let metadata = std::fs::metadata(&in_parent).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StrataError::BaseDirectoryMissing(format!("`/{}`", accumulated.display()))
                } else {
                    StrataError::Backend(format!(
                        "inspecting {}: {}",
                        in_parent.display(),
                        e
                    ))
                }
            })?;

            use std::os::unix::fs::{MetadataExt, PermissionsExt};
            std::fs::create_dir(&in_volume).map_err(|e| {
                StrataError::Backend(format!("creating {}: {}", in_volume.display(), e))
            })?;
            std::fs::set_permissions(
                &in_volume,
                std::fs::Permissions::from_mode(metadata.permissions().mode()),
            )
            .map_err(|e| {
                StrataError::Backend(format!("setting mode on {}: {}", in_volume.display(), e))
            })?;
            std::os::unix::fs::chown(&in_volume, Some(metadata.uid()), Some(metadata.gid()))
                .map_err(|e| {
                    StrataError::Backend(format!(
                        "changing ownership of {}: {}",
                        in_volume.display(),
                        e
                    ))
                })?;
        }

        Ok(())
    }

    fn volume_exists(&self, chain_id: &str) -> StrataResult<bool> {
        match self.volume_driver.volume_path(chain_id) {
            Ok(_) => Ok(true),
            Err(StrataError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn temporary_volume_name(chain_id: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!(
        "{}-incomplete-{}-{}",
        chain_id,
        nanos,
        rand::random::<u32>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageConfig;
    use crate::unpack::UnpackOutput;
    use std::io::Read;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // ------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------

    type CreateHook = Box<dyn Fn(&str, &Path) + Send + Sync>;

    struct FakeVolumeDriver {
        volumes_dir: PathBuf,
        create_calls: Mutex<Vec<(String, String)>>,
        destroy_calls: Mutex<Vec<String>>,
        meta_calls: Mutex<Vec<(String, VolumeMeta)>>,
        opaque_calls: Mutex<Vec<(String, Vec<String>)>>,
        create_hook: Option<CreateHook>,
    }

    impl FakeVolumeDriver {
        fn new(dir: &TempDir) -> Self {
            let volumes_dir = dir.path().join("volumes");
            std::fs::create_dir_all(&volumes_dir).unwrap();
            Self {
                volumes_dir,
                create_calls: Mutex::new(Vec::new()),
                destroy_calls: Mutex::new(Vec::new()),
                meta_calls: Mutex::new(Vec::new()),
                opaque_calls: Mutex::new(Vec::new()),
                create_hook: None,
            }
        }

        fn with_create_hook(mut self, hook: CreateHook) -> Self {
            self.create_hook = Some(hook);
            self
        }

        fn create_count(&self) -> usize {
            self.create_calls.lock().unwrap().len()
        }

        fn materialize(&self, id: &str) {
            std::fs::create_dir_all(self.volumes_dir.join(id)).unwrap();
        }
    }

    impl VolumeDriver for FakeVolumeDriver {
        fn volume_path(&self, id: &str) -> StrataResult<PathBuf> {
            let path = self.volumes_dir.join(id);
            if path.exists() {
                Ok(path)
            } else {
                Err(StrataError::NotFound(format!("volume does not exist `{}`", id)))
            }
        }

        fn create_volume(&self, parent_id: &str, id: &str) -> StrataResult<PathBuf> {
            self.create_calls
                .lock()
                .unwrap()
                .push((parent_id.to_string(), id.to_string()));

            let path = self.volumes_dir.join(id);
            std::fs::create_dir_all(&path).unwrap();
            if let Some(hook) = &self.create_hook {
                hook(id, &path);
            }
            Ok(path)
        }

        fn destroy_volume(&self, id: &str) -> StrataResult<()> {
            self.destroy_calls.lock().unwrap().push(id.to_string());
            let path = self.volumes_dir.join(id);
            if path.exists() {
                std::fs::remove_dir_all(&path).unwrap();
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

        fn write_volume_meta(&self, id: &str, volume_meta: &VolumeMeta) -> StrataResult<()> {
            self.meta_calls
                .lock()
                .unwrap()
                .push((id.to_string(), *volume_meta));
            Ok(())
        }

        fn handle_opaque_whiteouts(&self, id: &str, entries: &[String]) -> StrataResult<()> {
            self.opaque_calls
                .lock()
                .unwrap()
                .push((id.to_string(), entries.to_vec()));
            Ok(())
        }
    }

    struct FakeSource {
        info: BaseImageInfo,
        fail_blob: Option<String>,
    }

    impl FakeSource {
        fn new(info: BaseImageInfo) -> Self {
            Self {
                info,
                fail_blob: None,
            }
        }
    }

    impl ImageSource for FakeSource {
        fn base_image_info(&self) -> StrataResult<BaseImageInfo> {
            Ok(self.info.clone())
        }

        fn stream_blob(&self, layer: &LayerInfo) -> StrataResult<(Box<dyn Read + Send>, i64)> {
            if self.fail_blob.as_deref() == Some(layer.blob_id.as_str()) {
                return Err(StrataError::Network("stream failed".to_string()));
            }
            let payload = format!("layer-{}-contents", layer.blob_id).into_bytes();
            Ok((Box::new(std::io::Cursor::new(payload)), layer.size))
        }
    }

    #[derive(Default)]
    struct FakeUnpacker {
        specs: Mutex<Vec<(PathBuf, String)>>,
        outputs: Mutex<Vec<StrataResult<UnpackOutput>>>,
    }

    impl FakeUnpacker {
        fn with_outputs(outputs: Vec<StrataResult<UnpackOutput>>) -> Self {
            Self {
                specs: Mutex::new(Vec::new()),
                outputs: Mutex::new(outputs),
            }
        }

        fn unpack_count(&self) -> usize {
            self.specs.lock().unwrap().len()
        }
    }

    impl Unpacker for FakeUnpacker {
        fn unpack(&self, spec: UnpackSpec) -> StrataResult<UnpackOutput> {
            self.specs
                .lock()
                .unwrap()
                .push((spec.target_path.clone(), spec.base_directory.clone()));

            let mut outputs = self.outputs.lock().unwrap();
            if outputs.is_empty() {
                Ok(UnpackOutput::default())
            } else {
                outputs.remove(0)
            }
        }
    }

    // ------------------------------------------------------------------
    // Scaffolding
    // ------------------------------------------------------------------

    fn three_layers() -> BaseImageInfo {
        BaseImageInfo {
            layer_infos: vec![
                LayerInfo {
                    blob_id: "blob-1".to_string(),
                    chain_id: "chain-1".to_string(),
                    parent_chain_id: String::new(),
                    ..Default::default()
                },
                LayerInfo {
                    blob_id: "blob-2".to_string(),
                    chain_id: "chain-2".to_string(),
                    parent_chain_id: "chain-1".to_string(),
                    ..Default::default()
                },
                LayerInfo {
                    blob_id: "blob-3".to_string(),
                    chain_id: "chain-3".to_string(),
                    parent_chain_id: "chain-2".to_string(),
                    ..Default::default()
                },
            ],
            config: ImageConfig::default(),
        }
    }

    struct Harness {
        _store: TempDir,
        locksmith: FileSystemLocksmith,
        whiteout_device: PathBuf,
    }

    impl Harness {
        fn new() -> Self {
            let store = TempDir::new().unwrap();
            let locks = store.path().join("locks");
            std::fs::create_dir_all(&locks).unwrap();
            let whiteout_device = store.path().join("whiteout_dev");
            Self {
                locksmith: FileSystemLocksmith::new(locks, Emitter::default()),
                _store: store,
                whiteout_device,
            }
        }

        fn puller<'a>(
            &'a self,
            source: &'a FakeSource,
            unpacker: &'a FakeUnpacker,
            driver: &'a FakeVolumeDriver,
        ) -> BaseImagePuller<'a> {
            BaseImagePuller::new(
                source,
                unpacker,
                driver,
                &self.locksmith,
                Emitter::default(),
                IdMappings::default(),
                self.whiteout_device.clone(),
            )
        }
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[test]
    fn test_three_layer_pull_materializes_all_volumes() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);
        let source = FakeSource::new(three_layers());
        let unpacker = FakeUnpacker::default();
        let puller = harness.puller(&source, &unpacker, &driver);

        puller.pull(&three_layers(), &PullSpec::default()).unwrap();

        let creates = driver.create_calls.lock().unwrap().clone();
        assert_eq!(creates.len(), 3);

        assert_eq!(creates[0].0, "");
        assert!(creates[0].1.starts_with("chain-1-incomplete-"));
        assert_eq!(creates[1].0, "chain-1");
        assert!(creates[1].1.starts_with("chain-2-incomplete-"));
        assert_eq!(creates[2].0, "chain-2");
        assert!(creates[2].1.starts_with("chain-3-incomplete-"));

        for chain in ["chain-1", "chain-2", "chain-3"] {
            assert!(driver.volumes_dir.join(chain).is_dir(), "{} missing", chain);
        }
    }

    #[test]
    fn test_unpack_targets_temporary_volumes() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);
        let source = FakeSource::new(three_layers());
        let unpacker = FakeUnpacker::default();
        let puller = harness.puller(&source, &unpacker, &driver);

        puller.pull(&three_layers(), &PullSpec::default()).unwrap();

        let specs = unpacker.specs.lock().unwrap();
        assert_eq!(specs.len(), 3);
        for (idx, chain) in ["chain-1", "chain-2", "chain-3"].iter().enumerate() {
            let target = specs[idx].0.file_name().unwrap().to_str().unwrap();
            assert!(
                target.starts_with(&format!("{}-incomplete-", chain)),
                "unexpected target {}",
                target
            );
        }
    }

    #[test]
    fn test_metadata_written_per_layer() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);
        let source = FakeSource::new(three_layers());
        let unpacker = FakeUnpacker::with_outputs(vec![
            Ok(UnpackOutput {
                bytes_written: 100,
                opaque_whiteouts: vec![],
            }),
            Ok(UnpackOutput {
                bytes_written: 200,
                opaque_whiteouts: vec![],
            }),
            Ok(UnpackOutput {
                bytes_written: 300,
                opaque_whiteouts: vec![],
            }),
        ]);
        let puller = harness.puller(&source, &unpacker, &driver);

        puller.pull(&three_layers(), &PullSpec::default()).unwrap();

        let metas = driver.meta_calls.lock().unwrap();
        assert_eq!(
            *metas,
            vec![
                ("chain-1".to_string(), VolumeMeta { size: 100 }),
                ("chain-2".to_string(), VolumeMeta { size: 200 }),
                ("chain-3".to_string(), VolumeMeta { size: 300 }),
            ]
        );
    }

    #[test]
    fn test_opaque_whiteouts_forwarded_to_driver() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);
        let mut info = three_layers();
        info.layer_infos.truncate(1);
        let source = FakeSource::new(info.clone());
        let unpacker = FakeUnpacker::with_outputs(vec![Ok(UnpackOutput {
            bytes_written: 10,
            opaque_whiteouts: vec!["data/.wh..wh..opq".to_string()],
        })]);
        let puller = harness.puller(&source, &unpacker, &driver);

        puller.pull(&info, &PullSpec::default()).unwrap();

        let calls = driver.opaque_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.starts_with("chain-1-incomplete-"));
        assert_eq!(calls[0].1, vec!["data/.wh..wh..opq".to_string()]);
    }

    #[test]
    fn test_partial_hit_builds_only_missing_layers() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);
        driver.materialize("chain-2");

        let source = FakeSource::new(three_layers());
        let unpacker = FakeUnpacker::default();
        let puller = harness.puller(&source, &unpacker, &driver);

        puller.pull(&three_layers(), &PullSpec::default()).unwrap();

        let creates = driver.create_calls.lock().unwrap().clone();
        // chain-1 is built (its hit test misses), chain-2 is a cache hit,
        // chain-3 snapshots chain-2.
        let targets: Vec<&str> = creates.iter().map(|(_, id)| id.as_str()).collect();
        assert_eq!(creates.len(), 2);
        assert!(targets[0].starts_with("chain-1-incomplete-"));
        assert!(targets[1].starts_with("chain-3-incomplete-"));
        assert_eq!(creates[1].0, "chain-2");
    }

    #[test]
    fn test_full_cache_hit_creates_nothing() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);
        for chain in ["chain-1", "chain-2", "chain-3"] {
            driver.materialize(chain);
        }

        let source = FakeSource::new(three_layers());
        let unpacker = FakeUnpacker::default();
        let puller = harness.puller(&source, &unpacker, &driver);

        puller.pull(&three_layers(), &PullSpec::default()).unwrap();

        assert_eq!(driver.create_count(), 0);
        assert_eq!(unpacker.unpack_count(), 0);
    }

    #[test]
    fn test_quota_admission_rejects_oversized_images() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);

        let mut info = three_layers();
        info.layer_infos.truncate(2);
        info.layer_infos[0].size = 1000;
        info.layer_infos[1].size = 201;

        let source = FakeSource::new(info.clone());
        let unpacker = FakeUnpacker::default();
        let puller = harness.puller(&source, &unpacker, &driver);

        let spec = PullSpec {
            disk_limit: 1200,
            exclude_base_image_from_quota: false,
            ..Default::default()
        };
        match puller.pull(&info, &spec) {
            Err(StrataError::QuotaExceeded(_)) => {}
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }
        assert_eq!(driver.create_count(), 0);
    }

    #[test]
    fn test_exclusive_quota_skips_admission_check() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);

        let mut info = three_layers();
        info.layer_infos.truncate(1);
        info.layer_infos[0].size = 5000;

        let source = FakeSource::new(info.clone());
        let unpacker = FakeUnpacker::default();
        let puller = harness.puller(&source, &unpacker, &driver);

        let spec = PullSpec {
            disk_limit: 1200,
            exclude_base_image_from_quota: true,
            ..Default::default()
        };
        puller.pull(&info, &spec).unwrap();
    }

    #[test]
    fn test_unpack_failure_destroys_temp_volume_and_keeps_ancestors() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);
        let source = FakeSource::new(three_layers());
        let unpacker = FakeUnpacker::with_outputs(vec![
            Ok(UnpackOutput::default()),
            Ok(UnpackOutput::default()),
            Err(StrataError::Unpackable("boom".to_string())),
        ]);
        let puller = harness.puller(&source, &unpacker, &driver);

        let result = puller.pull(&three_layers(), &PullSpec::default());
        assert!(matches!(result, Err(StrataError::Unpackable(_))));

        assert_eq!(driver.create_count(), 3);

        let destroys = driver.destroy_calls.lock().unwrap();
        assert_eq!(destroys.len(), 1);
        assert!(destroys[0].starts_with("chain-3-incomplete-"));

        assert!(driver.volumes_dir.join("chain-1").is_dir());
        assert!(driver.volumes_dir.join("chain-2").is_dir());
        assert!(!driver.volumes_dir.join("chain-3").exists());
    }

    #[test]
    fn test_stream_failure_destroys_temp_volume() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);
        let mut source = FakeSource::new(three_layers());
        source.fail_blob = Some("blob-1".to_string());
        let unpacker = FakeUnpacker::default();
        let puller = harness.puller(&source, &unpacker, &driver);

        let result = puller.pull(&three_layers(), &PullSpec::default());
        assert!(matches!(result, Err(StrataError::Network(_))));

        let destroys = driver.destroy_calls.lock().unwrap();
        assert_eq!(destroys.len(), 1);
        assert!(destroys[0].starts_with("chain-1-incomplete-"));
    }

    #[test]
    fn test_errors_carry_the_layer_blob_id() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);
        let mut source = FakeSource::new(three_layers());
        source.fail_blob = Some("blob-2".to_string());
        let unpacker = FakeUnpacker::default();
        let puller = harness.puller(&source, &unpacker, &driver);

        let err = puller
            .pull(&three_layers(), &PullSpec::default())
            .unwrap_err();
        assert!(err.to_string().contains("blob-2"), "error was: {}", err);
    }

    #[test]
    fn test_base_directory_components_copied_from_parent() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();

        let driver = FakeVolumeDriver::new(&driver_dir).with_create_hook(Box::new(|id, path| {
            use std::os::unix::fs::PermissionsExt;
            if id.starts_with("chain-1-incomplete-") {
                std::fs::create_dir_all(path.join("home/base")).unwrap();
                std::fs::set_permissions(
                    path.join("home"),
                    std::fs::Permissions::from_mode(0o700),
                )
                .unwrap();
                std::fs::set_permissions(
                    path.join("home/base"),
                    std::fs::Permissions::from_mode(0o711),
                )
                .unwrap();
            }
        }));

        let mut info = three_layers();
        info.layer_infos[1].base_directory = "/home/base".to_string();

        let source = FakeSource::new(info.clone());
        let unpacker = FakeUnpacker::default();
        let puller = harness.puller(&source, &unpacker, &driver);

        puller.pull(&info, &PullSpec::default()).unwrap();

        // The unpacker saw the prefix for the layer that declares it.
        let specs = unpacker.specs.lock().unwrap();
        assert_eq!(specs[0].1, "");
        assert_eq!(specs[1].1, "/home/base");
        assert_eq!(specs[2].1, "");

        use std::os::unix::fs::PermissionsExt;
        let chain2 = driver.volumes_dir.join("chain-2");
        assert!(chain2.join("home/base").is_dir());
        let home_mode = std::fs::metadata(chain2.join("home")).unwrap().permissions().mode();
        let base_mode = std::fs::metadata(chain2.join("home/base"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(home_mode & 0o7777, 0o700);
        assert_eq!(base_mode & 0o7777, 0o711);
    }

    #[test]
    fn test_base_directory_already_in_child_is_left_alone() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();

        let driver = FakeVolumeDriver::new(&driver_dir).with_create_hook(Box::new(|id, path| {
            use std::os::unix::fs::PermissionsExt;
            if id.starts_with("chain-1-incomplete-") {
                std::fs::create_dir_all(path.join("home/base")).unwrap();
                std::fs::set_permissions(
                    path.join("home"),
                    std::fs::Permissions::from_mode(0o700),
                )
                .unwrap();
            }
            if id.starts_with("chain-2-incomplete-") {
                // The snapshot inherited the directories already; they carry
                // their own attributes.
                std::fs::create_dir_all(path.join("home/base")).unwrap();
                std::fs::set_permissions(
                    path.join("home"),
                    std::fs::Permissions::from_mode(0o755),
                )
                .unwrap();
                std::fs::set_permissions(
                    path.join("home/base"),
                    std::fs::Permissions::from_mode(0o750),
                )
                .unwrap();
            }
        }));

        let mut info = three_layers();
        info.layer_infos[1].base_directory = "/home/base".to_string();

        let source = FakeSource::new(info.clone());
        let unpacker = FakeUnpacker::default();
        let puller = harness.puller(&source, &unpacker, &driver);

        puller.pull(&info, &PullSpec::default()).unwrap();

        use std::os::unix::fs::PermissionsExt;
        let chain2 = driver.volumes_dir.join("chain-2");
        let home_mode = std::fs::metadata(chain2.join("home")).unwrap().permissions().mode();
        let base_mode = std::fs::metadata(chain2.join("home/base"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(home_mode & 0o7777, 0o755);
        assert_eq!(base_mode & 0o7777, 0o750);
    }

    #[test]
    fn test_base_directory_missing_everywhere_fails() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);

        let mut info = three_layers();
        info.layer_infos[1].base_directory = "/home/base".to_string();

        let source = FakeSource::new(info.clone());
        let unpacker = FakeUnpacker::default();
        let puller = harness.puller(&source, &unpacker, &driver);

        match puller.pull(&info, &PullSpec::default()) {
            Err(StrataError::BaseDirectoryMissing(_)) => {}
            other => panic!("expected BaseDirectoryMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_nonzero_owner_is_applied_to_built_volumes() {
        let harness = Harness::new();
        let driver_dir = TempDir::new().unwrap();
        let driver = FakeVolumeDriver::new(&driver_dir);
        let mut info = three_layers();
        info.layer_infos.truncate(1);
        let source = FakeSource::new(info.clone());
        let unpacker = FakeUnpacker::default();
        let puller = harness.puller(&source, &unpacker, &driver);

        // Chowning to our own ids is always permitted, so the chown path is
        // exercised without requiring privilege.
        let spec = PullSpec {
            owner_uid: unsafe { libc::getuid() },
            owner_gid: unsafe { libc::getgid() },
            ..Default::default()
        };
        puller.pull(&info, &spec).unwrap();

        use std::os::unix::fs::MetadataExt;
        let metadata = std::fs::metadata(driver.volumes_dir.join("chain-1")).unwrap();
        assert_eq!(metadata.uid(), spec.owner_uid);
        assert_eq!(metadata.gid(), spec.owner_gid);
    }

    #[test]
    fn test_concurrent_pulls_build_each_layer_once() {
        use std::sync::Arc;

        let harness = Arc::new(Harness::new());
        let driver_dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeVolumeDriver::new(&driver_dir));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let harness = Arc::clone(&harness);
            let driver = Arc::clone(&driver);
            handles.push(std::thread::spawn(move || {
                let source = FakeSource::new(three_layers());
                let unpacker = FakeUnpacker::default();
                let puller = harness.puller(&source, &unpacker, &*driver);
                puller.pull(&three_layers(), &PullSpec::default())
            }));
        }

        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        // Whoever lost a finalization race cleaned its own temp volume; each
        // chain id was created at most once per missing state transition.
        let creates = driver.create_calls.lock().unwrap();
        for chain in ["chain-1", "chain-2", "chain-3"] {
            let count = creates
                .iter()
                .filter(|(_, id)| id.starts_with(&format!("{}-incomplete-", chain)))
                .count();
            assert_eq!(count, 1, "{} built {} times", chain, count);
            assert!(driver.volumes_dir.join(chain).is_dir());
        }
    }
}

//! Working-image creation and destruction.
//!
//! A working image is a writable snapshot of a base image's top layer,
//! owned by a tenant and optionally quota-limited. The cloner composes the
//! mount descriptors a runtime needs to finish assembling the container
//! filesystem.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::errors::{StrataError, StrataResult};
use crate::fs::{MountInfo, VolumeStats};
use crate::image::ImageConfig;
use crate::store::layout::StoreLayout;

/// Image capabilities the cloner consumes.
pub trait ImageDriver {
    /// Snapshot the top base volume into `<image>/rootfs` and apply the
    /// quota. Returns a mount descriptor when the caller still has to
    /// attach the rootfs, `None` when the snapshot is already attached.
    fn create_image(&self, spec: &ImageDriverSpec) -> StrataResult<Option<MountInfo>>;
    fn destroy_image(&self, image_path: &Path) -> StrataResult<()>;
    fn fetch_stats(&self, image_path: &Path) -> StrataResult<VolumeStats>;
}

#[derive(Clone, Debug, Default)]
pub struct ImageDriverSpec {
    pub base_volume_ids: Vec<String>,
    pub mount: bool,
    pub image_path: PathBuf,
    pub disk_limit: i64,
    pub exclusive_disk_limit: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ImageSpec {
    pub id: String,
    pub mount: bool,
    pub disk_limit: i64,
    pub exclude_base_image_from_quota: bool,
    pub base_volume_ids: Vec<String>,
    pub config: ImageConfig,
    pub owner_uid: u32,
    pub owner_gid: u32,
}

/// What a create hands back to the caller: where the rootfs lives and what
/// remains to be mounted.
#[derive(Clone, Debug, Default)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub rootfs: PathBuf,
    pub config: ImageConfig,
    pub mounts: Vec<MountInfo>,
}

pub struct ImageCloner<'a> {
    image_driver: &'a dyn ImageDriver,
    layout: StoreLayout,
}

impl<'a> ImageCloner<'a> {
    pub fn new(image_driver: &'a dyn ImageDriver, layout: StoreLayout) -> Self {
        Self {
            image_driver,
            layout,
        }
    }

    pub fn image_ids(&self) -> StrataResult<Vec<String>> {
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(self.layout.images_dir())
            .map_err(|e| StrataError::Backend(format!("failed to read images dir: {}", e)))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| StrataError::Backend(format!("failed to read images dir: {}", e)))?;
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        Ok(ids)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.layout.image_path(id).exists()
    }

    pub fn create(&self, spec: &ImageSpec) -> StrataResult<ImageInfo> {
        let image_path = self.layout.image_path(&spec.id);
        let rootfs_path = image_path.join("rootfs");
        tracing::info!(id = %spec.id, path = %image_path.display(), "making-image");

        std::fs::create_dir(&image_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                StrataError::Conflict(format!("image `{}` already exists", spec.id))
            } else {
                StrataError::Backend(format!("making image path: {}", e))
            }
        })?;
        set_image_dir_mode(&image_path)?;

        match self.populate(spec, &image_path, &rootfs_path) {
            Ok(info) => Ok(info),
            Err(e) => {
                // Unwind everything the failed create left behind.
                tracing::info!(id = %spec.id, cause = %e, "create-failed-cleaning-up");
                if let Err(destroy_err) = self.image_driver.destroy_image(&image_path) {
                    tracing::error!(error = %destroy_err, "destroying-rootfs-image-failed");
                }
                if image_path.exists() {
                    if let Err(remove_err) = std::fs::remove_dir_all(&image_path) {
                        tracing::error!(error = %remove_err, "deleting-image-path-failed");
                    }
                }
                Err(e)
            }
        }
    }

    fn populate(
        &self,
        spec: &ImageSpec,
        image_path: &Path,
        rootfs_path: &Path,
    ) -> StrataResult<ImageInfo> {
        let driver_spec = ImageDriverSpec {
            base_volume_ids: spec.base_volume_ids.clone(),
            mount: spec.mount,
            image_path: image_path.to_path_buf(),
            disk_limit: spec.disk_limit,
            exclusive_disk_limit: spec.exclude_base_image_from_quota,
        };
        let driver_mount = self
            .image_driver
            .create_image(&driver_spec)
            .map_err(|e| e.wrap("creating image"))?;

        self.set_ownership(spec, &[image_path, rootfs_path])?;

        let mut mounts = Vec::new();
        if !spec.mount {
            if let Some(mount) = driver_mount {
                mounts.push(mount);
            }
        }

        for volume in &spec.config.volumes {
            let source = image_path.join(volume_source_name(volume));
            self.create_volume_source(&source, spec.owner_uid, spec.owner_gid)?;
            mounts.push(MountInfo {
                destination: volume.clone(),
                mount_type: "bind".to_string(),
                source: source.display().to_string(),
                options: vec!["bind".to_string()],
            });
        }

        Ok(ImageInfo {
            path: image_path.to_path_buf(),
            rootfs: rootfs_path.to_path_buf(),
            config: spec.config.clone(),
            mounts,
        })
    }

    /// Destroy a working image. A missing image is success: the caller's
    /// goal state is already reached.
    pub fn destroy(&self, id: &str) -> StrataResult<()> {
        let image_path = self.layout.image_path(id);
        tracing::info!(id, path = %image_path.display(), "deleting-image");

        if !image_path.exists() {
            tracing::debug!(id, "image-not-found");
            return Ok(());
        }

        self.image_driver.destroy_image(&image_path)?;

        if image_path.exists() {
            return Err(StrataError::Backend(format!(
                "deleting image path {}",
                image_path.display()
            )));
        }
        Ok(())
    }

    pub fn stats(&self, id: &str) -> StrataResult<VolumeStats> {
        let image_path = self.layout.image_path(id);
        if !image_path.exists() {
            return Err(StrataError::NotFound(format!("image not found: {}", id)));
        }

        self.image_driver.fetch_stats(&image_path)
    }

    fn set_ownership(&self, spec: &ImageSpec, paths: &[&Path]) -> StrataResult<()> {
        if spec.owner_uid == 0 && spec.owner_gid == 0 {
            return Ok(());
        }

        for path in paths {
            std::os::unix::fs::chown(path, Some(spec.owner_uid), Some(spec.owner_gid)).map_err(
                |e| {
                    StrataError::Backend(format!(
                        "changing {} ownership to {}:{}: {}",
                        path.display(),
                        spec.owner_uid,
                        spec.owner_gid,
                        e
                    ))
                },
            )?;
        }
        Ok(())
    }

    fn create_volume_source(&self, source: &Path, owner_uid: u32, owner_gid: u32) -> StrataResult<()> {
        use std::os::unix::fs::PermissionsExt;

        std::fs::create_dir(source).map_err(|e| {
            StrataError::Backend(format!("creating volume source {}: {}", source.display(), e))
        })?;
        std::fs::set_permissions(source, std::fs::Permissions::from_mode(0o755)).map_err(|e| {
            StrataError::Backend(format!("setting mode on {}: {}", source.display(), e))
        })?;
        if owner_uid != 0 || owner_gid != 0 {
            std::os::unix::fs::chown(source, Some(owner_uid), Some(owner_gid)).map_err(|e| {
                StrataError::Backend(format!(
                    "changing volume source ownership: {}",
                    e
                ))
            })?;
        }
        Ok(())
    }
}

impl crate::gc::ImageLister for ImageCloner<'_> {
    fn image_ids(&self) -> StrataResult<Vec<String>> {
        ImageCloner::image_ids(self)
    }
}

fn set_image_dir_mode(image_path: &Path) -> StrataResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(image_path, std::fs::Permissions::from_mode(0o700)).map_err(|e| {
        StrataError::Backend(format!(
            "restricting image dir {}: {}",
            image_path.display(),
            e
        ))
    })
}

/// Bind-mount source directory name for a declared image volume.
fn volume_source_name(volume: &str) -> String {
    let digest = Sha256::digest(volume.as_bytes());
    format!("vol-{}", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeImageDriver {
        create_specs: Mutex<Vec<ImageDriverSpec>>,
        destroyed: Mutex<Vec<PathBuf>>,
        fail_create: bool,
        stats: VolumeStats,
    }

    impl ImageDriver for FakeImageDriver {
        fn create_image(&self, spec: &ImageDriverSpec) -> StrataResult<Option<MountInfo>> {
            self.create_specs.lock().unwrap().push(spec.clone());
            if self.fail_create {
                return Err(StrataError::Backend("snapshot failed".to_string()));
            }
            std::fs::create_dir_all(spec.image_path.join("rootfs")).unwrap();
            Ok(None)
        }

        fn destroy_image(&self, image_path: &Path) -> StrataResult<()> {
            self.destroyed.lock().unwrap().push(image_path.to_path_buf());
            if image_path.exists() {
                std::fs::remove_dir_all(image_path).unwrap();
            }
            Ok(())
        }

        fn fetch_stats(&self, _image_path: &Path) -> StrataResult<VolumeStats> {
            Ok(self.stats)
        }
    }

    fn layout(dir: &TempDir) -> StoreLayout {
        let layout = StoreLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        layout
    }

    fn spec(id: &str) -> ImageSpec {
        ImageSpec {
            id: id.to_string(),
            mount: true,
            base_volume_ids: vec!["chain-1".to_string(), "chain-2".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_create_builds_rootfs_snapshot() {
        let dir = TempDir::new().unwrap();
        let driver = FakeImageDriver::default();
        let cloner = ImageCloner::new(&driver, layout(&dir));

        let info = cloner.create(&spec("my-image")).unwrap();

        assert_eq!(info.rootfs, dir.path().join("images/my-image/rootfs"));
        assert!(info.rootfs.is_dir());

        let specs = driver.create_specs.lock().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(
            specs[0].base_volume_ids,
            vec!["chain-1".to_string(), "chain-2".to_string()]
        );
    }

    #[test]
    fn test_image_dir_mode_is_0700() {
        let dir = TempDir::new().unwrap();
        let driver = FakeImageDriver::default();
        let cloner = ImageCloner::new(&driver, layout(&dir));

        cloner.create(&spec("my-image")).unwrap();

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.path().join("images/my-image"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, 0o700);
    }

    #[test]
    fn test_create_conflicts_on_taken_id() {
        let dir = TempDir::new().unwrap();
        let driver = FakeImageDriver::default();
        let cloner = ImageCloner::new(&driver, layout(&dir));

        cloner.create(&spec("my-image")).unwrap();
        match cloner.create(&spec("my-image")) {
            Err(StrataError::Conflict(_)) => {}
            other => panic!("expected Conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_create_failure_unwinds_image_directory() {
        let dir = TempDir::new().unwrap();
        let driver = FakeImageDriver {
            fail_create: true,
            ..Default::default()
        };
        let cloner = ImageCloner::new(&driver, layout(&dir));

        assert!(cloner.create(&spec("doomed")).is_err());
        assert!(!dir.path().join("images/doomed").exists());
        assert_eq!(driver.destroyed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_declared_volumes_become_bind_mounts() {
        let dir = TempDir::new().unwrap();
        let driver = FakeImageDriver::default();
        let cloner = ImageCloner::new(&driver, layout(&dir));

        let mut image_spec = spec("voluminous");
        image_spec.config.volumes = vec!["/data".to_string(), "/cache".to_string()];

        let info = cloner.create(&image_spec).unwrap();

        assert_eq!(info.mounts.len(), 2);
        for (mount, volume) in info.mounts.iter().zip(["/data", "/cache"]) {
            assert_eq!(mount.destination, volume);
            assert_eq!(mount.mount_type, "bind");
            assert_eq!(mount.options, vec!["bind".to_string()]);
            assert!(
                Path::new(&mount.source).is_dir(),
                "source {} missing",
                mount.source
            );
            let name = Path::new(&mount.source).file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with("vol-"), "unexpected source name {}", name);
        }
    }

    #[test]
    fn test_volume_source_name_is_stable_hash() {
        assert_eq!(
            volume_source_name("/data"),
            format!("vol-{}", hex::encode(Sha256::digest(b"/data")))
        );
    }

    #[test]
    fn test_destroy_missing_image_is_success() {
        let dir = TempDir::new().unwrap();
        let driver = FakeImageDriver::default();
        let cloner = ImageCloner::new(&driver, layout(&dir));

        cloner.destroy("ghost").unwrap();
        assert!(driver.destroyed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_destroy_removes_image() {
        let dir = TempDir::new().unwrap();
        let driver = FakeImageDriver::default();
        let cloner = ImageCloner::new(&driver, layout(&dir));

        cloner.create(&spec("my-image")).unwrap();
        cloner.destroy("my-image").unwrap();
        assert!(!dir.path().join("images/my-image").exists());
    }

    #[test]
    fn test_stats_of_missing_image_is_not_found() {
        let dir = TempDir::new().unwrap();
        let driver = FakeImageDriver::default();
        let cloner = ImageCloner::new(&driver, layout(&dir));

        match cloner.stats("ghost") {
            Err(StrataError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_image_ids_lists_created_images() {
        let dir = TempDir::new().unwrap();
        let driver = FakeImageDriver::default();
        let cloner = ImageCloner::new(&driver, layout(&dir));

        cloner.create(&spec("a")).unwrap();
        cloner.create(&spec("b")).unwrap();

        let mut ids = cloner.image_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}

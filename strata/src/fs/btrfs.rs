//! BTRFS-backed volume and image driver.
//!
//! Subvolume manipulation shells out to the `btrfs` CLI; quota-group work
//! goes through the set-UID helper. Volume visibility follows one rule: a
//! directory under `volumes/` named by a chain id exists iff that layer was
//! fully unpacked and finalized.

use std::path::{Component, Path, PathBuf};
use std::process::Command;

use crate::cloner::{ImageDriver, ImageDriverSpec};
use crate::errors::{StrataError, StrataResult};
use crate::fs::meta::{self, VolumeMeta};
use crate::fs::quota::QuotaHelper;
use crate::fs::{MountInfo, VolumeStats};
use crate::gc::GcVolumeDriver;
use crate::puller::VolumeDriver;
use crate::store::layout::StoreLayout;
use crate::store::manager::StoreDriver;

#[derive(Clone, Debug)]
pub struct BtrfsConfig {
    pub store_path: PathBuf,
    pub btrfs_bin: PathBuf,
    pub quota_helper_bin: PathBuf,
}

impl BtrfsConfig {
    pub fn new(store_path: PathBuf) -> Self {
        Self {
            store_path,
            btrfs_bin: PathBuf::from("btrfs"),
            quota_helper_bin: PathBuf::from("strata-quota"),
        }
    }
}

pub struct BtrfsDriver {
    layout: StoreLayout,
    btrfs_bin: PathBuf,
    quota: QuotaHelper,
}

impl BtrfsDriver {
    pub fn new(config: BtrfsConfig) -> Self {
        let quota = QuotaHelper::new(config.quota_helper_bin.clone(), config.btrfs_bin.clone());
        Self {
            layout: StoreLayout::new(config.store_path),
            btrfs_bin: config.btrfs_bin,
            quota,
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    // ------------------------------------------------------------------
    // Volume primitives
    // ------------------------------------------------------------------

    /// Create a fresh subvolume, or snapshot `parent_id` when given.
    pub fn create_volume(&self, parent_id: &str, id: &str) -> StrataResult<PathBuf> {
        let volume_path = self.layout.volume_path(id);
        if volume_path.exists() {
            return Err(StrataError::Conflict(format!(
                "volume `{}` already exists",
                id
            )));
        }

        if parent_id.is_empty() {
            self.run_btrfs(&["subvolume", "create"], &[volume_path.as_path()])?;
        } else {
            let parent_path = self.layout.volume_path(parent_id);
            if !parent_path.exists() {
                return Err(StrataError::NotFound(format!(
                    "parent volume `{}` does not exist",
                    parent_id
                )));
            }
            self.run_btrfs(
                &["subvolume", "snapshot"],
                &[parent_path.as_path(), volume_path.as_path()],
            )?;
        }

        tracing::info!(volume = %volume_path.display(), parent = parent_id, "created-volume");
        Ok(volume_path)
    }

    pub fn volume_path(&self, id: &str) -> StrataResult<PathBuf> {
        let path = self.layout.volume_path(id);
        if path.exists() {
            Ok(path)
        } else {
            Err(StrataError::NotFound(format!(
                "volume does not exist `{}`",
                id
            )))
        }
    }

    pub fn list_volumes(&self) -> StrataResult<Vec<String>> {
        let mut volumes = Vec::new();
        let entries = std::fs::read_dir(self.layout.volumes_dir())
            .map_err(|e| StrataError::Backend(format!("failed to list volumes: {}", e)))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| StrataError::Backend(format!("failed to list volumes: {}", e)))?;
            if let Some(name) = entry.file_name().to_str() {
                volumes.push(name.to_string());
            }
        }
        Ok(volumes)
    }

    /// Atomic rename. Losing the finalization race is success: the other
    /// builder produced the same content-addressed volume.
    pub fn move_volume(&self, from: &Path, to: &Path) -> StrataResult<()> {
        match std::fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) => {
                let lost_race = matches!(
                    e.raw_os_error(),
                    Some(libc::EEXIST) | Some(libc::ENOTEMPTY)
                ) && to.exists();
                if lost_race {
                    tracing::debug!(to = %to.display(), "volume-already-finalized");
                    Ok(())
                } else {
                    Err(StrataError::Backend(format!(
                        "moving volume {} to {}: {}",
                        from.display(),
                        to.display(),
                        e
                    )))
                }
            }
        }
    }

    /// Destroy a volume and its quota group. Missing volumes are success.
    pub fn destroy_volume(&self, id: &str) -> StrataResult<()> {
        let meta_path = self.layout.volume_meta_path(id);
        if meta_path.exists() {
            if let Err(e) = std::fs::remove_file(&meta_path) {
                tracing::info!(path = %meta_path.display(), error = %e, "deleting-metadata-file-failed");
            }
        }

        let volume_path = self.layout.volume_path(id);
        if !volume_path.exists() {
            return Ok(());
        }

        self.destroy_subvolume(&volume_path)
    }

    fn destroy_subvolume(&self, path: &Path) -> StrataResult<()> {
        if let Err(e) = self.quota.destroy_quota_group(path) {
            tracing::debug!(path = %path.display(), error = %e, "destroying-quota-group-failed");
        }

        self.run_btrfs(&["subvolume", "delete"], &[path]).map(|_| ())
    }

    /// Mask directories an unpacked layer marked as opaque: everything
    /// currently below them was inherited through the snapshot and must go.
    pub fn handle_opaque_whiteouts(&self, id: &str, entries: &[String]) -> StrataResult<()> {
        let volume_path = self.volume_path(id)?;

        for entry in entries {
            let Some(relative) = sanitize_relative(Path::new(entry)) else {
                return Err(StrataError::Invalid(format!(
                    "opaque whiteout path escapes volume: {}",
                    entry
                )));
            };
            let Some(parent) = volume_path.join(relative).parent().map(Path::to_path_buf)
            else {
                continue;
            };
            if !parent.starts_with(&volume_path) || !parent.exists() {
                continue;
            }

            clean_whiteout_dir(&parent)?;
        }
        Ok(())
    }

    pub fn write_volume_meta(&self, id: &str, volume_meta: &VolumeMeta) -> StrataResult<()> {
        meta::write_volume_meta(&self.layout, id, volume_meta)
    }

    pub fn volume_size(&self, id: &str) -> StrataResult<i64> {
        Ok(meta::read_volume_meta(&self.layout, id)?.size)
    }

    // ------------------------------------------------------------------
    // Quota
    // ------------------------------------------------------------------

    pub fn apply_disk_limit(
        &self,
        rootfs_path: &Path,
        disk_limit_bytes: i64,
        exclusive: bool,
    ) -> StrataResult<()> {
        if disk_limit_bytes == 0 {
            tracing::debug!("no-need-for-quotas");
            return Ok(());
        }

        self.quota
            .apply_disk_limit(rootfs_path, disk_limit_bytes, exclusive)
    }

    // ------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------

    /// Snapshot the top volume of `spec` into `<image>/rootfs`.
    pub fn create_image(&self, spec: &ImageDriverSpec) -> StrataResult<Option<MountInfo>> {
        let top_volume_id = spec.base_volume_ids.last().ok_or_else(|| {
            StrataError::Invalid("image spec carries no base volumes".to_string())
        })?;
        let source = self.volume_path(top_volume_id)?;
        let rootfs = spec.image_path.join("rootfs");

        if rootfs.exists() {
            return Err(StrataError::Conflict(format!(
                "image rootfs already exists: {}",
                rootfs.display()
            )));
        }

        self.run_btrfs(
            &["subvolume", "snapshot"],
            &[source.as_path(), rootfs.as_path()],
        )?;

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&rootfs, std::fs::Permissions::from_mode(0o755)).map_err(
            |e| StrataError::Backend(format!("chmoding snapshot {}: {}", rootfs.display(), e)),
        )?;

        if spec.disk_limit > 0 {
            self.apply_disk_limit(&rootfs, spec.disk_limit, spec.exclusive_disk_limit)?;
        }

        // The snapshot is attached the moment it exists; there is nothing
        // left for the caller to mount.
        Ok(None)
    }

    /// Destroy an image's snapshot, any subvolumes a container created
    /// inside it, and the enclosing directory. Missing image is success.
    pub fn destroy_image(&self, image_path: &Path) -> StrataResult<()> {
        if !image_path.exists() {
            return Ok(());
        }

        let rootfs = image_path.join("rootfs");
        let mut destroy_err = None;
        if rootfs.exists() {
            if let Err(e) = self.destroy_subvolume(&rootfs) {
                if e.to_string().contains("not empty") {
                    self.destroy_nested_subvolumes(image_path)?;
                } else {
                    destroy_err = Some(e);
                }
            }
        }

        if let Err(e) = std::fs::remove_dir_all(image_path) {
            tracing::error!(path = %image_path.display(), error = %e, "removing-image-path-failed");
            return Err(destroy_err.unwrap_or_else(|| {
                StrataError::Backend(format!(
                    "deleting image path {}: {}",
                    image_path.display(),
                    e
                ))
            }));
        }

        match destroy_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// A container may have created subvolumes within its rootfs; those must
    /// be deleted deepest-first before the rootfs itself can go.
    fn destroy_nested_subvolumes(&self, image_path: &Path) -> StrataResult<()> {
        let mut subvolumes = self.quota.list_subvolumes(image_path)?;
        subvolumes.sort_by_key(|path| std::cmp::Reverse(Path::new(path).components().count()));

        for subvolume in subvolumes {
            self.destroy_subvolume(Path::new(&subvolume))?;
        }
        Ok(())
    }

    pub fn fetch_stats(&self, image_path: &Path) -> StrataResult<VolumeStats> {
        self.quota.stats(&image_path.join("rootfs"))
    }

    // ------------------------------------------------------------------
    // Store lifecycle
    // ------------------------------------------------------------------

    pub fn validate_filesystem(&self, path: &Path) -> StrataResult<()> {
        let stat = nix::sys::statfs::statfs(path).map_err(|e| {
            StrataError::Backend(format!("statting {}: {}", path.display(), e))
        })?;

        if stat.filesystem_type() != nix::sys::statfs::BTRFS_SUPER_MAGIC {
            return Err(StrataError::Config(format!(
                "store path `{}` is not on a btrfs filesystem",
                path.display()
            )));
        }
        Ok(())
    }

    /// Create a dedicated btrfs filesystem in `filesystem_file` and mount it
    /// at `store_path`.
    pub fn init_filesystem(
        &self,
        filesystem_file: &Path,
        store_path: &Path,
        size_bytes: i64,
    ) -> StrataResult<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(filesystem_file)
            .map_err(|e| {
                StrataError::Backend(format!(
                    "creating backing file {}: {}",
                    filesystem_file.display(),
                    e
                ))
            })?;
        file.set_len(size_bytes as u64).map_err(|e| {
            StrataError::Backend(format!(
                "truncating backing file {}: {}",
                filesystem_file.display(),
                e
            ))
        })?;

        let mkfs = mkfs_bin(&self.btrfs_bin);
        run_command(Command::new(&mkfs).arg("-f").arg(filesystem_file), "formatting filesystem")?;

        std::fs::create_dir_all(store_path).map_err(|e| {
            StrataError::Backend(format!("creating {}: {}", store_path.display(), e))
        })?;
        run_command(
            Command::new("mount")
                .arg("-o")
                .arg("loop,user_subvol_rm_allowed")
                .arg(filesystem_file)
                .arg(store_path),
            "mounting store filesystem",
        )?;
        Ok(())
    }

    fn run_btrfs(&self, args: &[&str], paths: &[&Path]) -> StrataResult<String> {
        let mut cmd = Command::new(&self.btrfs_bin);
        cmd.args(args);
        for path in paths {
            cmd.arg(path);
        }
        tracing::debug!(bin = %self.btrfs_bin.display(), ?args, "starting-btrfs");
        run_command(&mut cmd, "running btrfs")
    }
}

fn run_command(cmd: &mut Command, context: &str) -> StrataResult<String> {
    let output = cmd
        .output()
        .map_err(|e| StrataError::Backend(format!("{}: {}", context, e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StrataError::Backend(format!(
            "{}: exited with {}: {} {}",
            context,
            output.status,
            stdout.trim(),
            stderr.trim()
        )));
    }
    Ok(stdout)
}

fn mkfs_bin(btrfs_bin: &Path) -> PathBuf {
    match btrfs_bin.parent() {
        Some(dir) if dir.as_os_str().is_empty() => PathBuf::from("mkfs.btrfs"),
        Some(dir) => dir.join("mkfs.btrfs"),
        None => PathBuf::from("mkfs.btrfs"),
    }
}

fn sanitize_relative(path: &Path) -> Option<PathBuf> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) => continue,
            Component::CurDir => {}
            Component::ParentDir => {
                components.pop()?;
            }
            Component::Normal(c) => components.push(c.to_os_string()),
        }
    }
    Some(components.into_iter().collect())
}

fn clean_whiteout_dir(dir: &Path) -> StrataResult<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| StrataError::Backend(format!("reading {}: {}", dir.display(), e)))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| StrataError::Backend(format!("reading {}: {}", dir.display(), e)))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| StrataError::Backend(format!("statting {}: {}", path.display(), e)))?;

        let removed = if file_type.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.map_err(|e| {
            StrataError::Backend(format!("cleaning whiteout dir {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "opaque-whiteout-removed");
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Capability trait wiring
// ----------------------------------------------------------------------

impl VolumeDriver for BtrfsDriver {
    fn volume_path(&self, id: &str) -> StrataResult<PathBuf> {
        BtrfsDriver::volume_path(self, id)
    }

    fn create_volume(&self, parent_id: &str, id: &str) -> StrataResult<PathBuf> {
        BtrfsDriver::create_volume(self, parent_id, id)
    }

    fn destroy_volume(&self, id: &str) -> StrataResult<()> {
        BtrfsDriver::destroy_volume(self, id)
    }

    fn move_volume(&self, from: &Path, to: &Path) -> StrataResult<()> {
        BtrfsDriver::move_volume(self, from, to)
    }

    fn write_volume_meta(&self, id: &str, volume_meta: &VolumeMeta) -> StrataResult<()> {
        BtrfsDriver::write_volume_meta(self, id, volume_meta)
    }

    fn handle_opaque_whiteouts(&self, id: &str, entries: &[String]) -> StrataResult<()> {
        BtrfsDriver::handle_opaque_whiteouts(self, id, entries)
    }
}

impl ImageDriver for BtrfsDriver {
    fn create_image(&self, spec: &ImageDriverSpec) -> StrataResult<Option<MountInfo>> {
        BtrfsDriver::create_image(self, spec)
    }

    fn destroy_image(&self, image_path: &Path) -> StrataResult<()> {
        BtrfsDriver::destroy_image(self, image_path)
    }

    fn fetch_stats(&self, image_path: &Path) -> StrataResult<VolumeStats> {
        BtrfsDriver::fetch_stats(self, image_path)
    }
}

impl GcVolumeDriver for BtrfsDriver {
    fn list_volumes(&self) -> StrataResult<Vec<String>> {
        BtrfsDriver::list_volumes(self)
    }

    fn destroy_volume(&self, id: &str) -> StrataResult<()> {
        BtrfsDriver::destroy_volume(self, id)
    }

    fn move_volume(&self, from: &Path, to: &Path) -> StrataResult<()> {
        BtrfsDriver::move_volume(self, from, to)
    }

    fn volume_path(&self, id: &str) -> StrataResult<PathBuf> {
        BtrfsDriver::volume_path(self, id)
    }
}

impl StoreDriver for BtrfsDriver {
    fn validate_filesystem(&self, path: &Path) -> StrataResult<()> {
        BtrfsDriver::validate_filesystem(self, path)
    }

    fn init_filesystem(
        &self,
        filesystem_file: &Path,
        store_path: &Path,
        size_bytes: i64,
    ) -> StrataResult<()> {
        BtrfsDriver::init_filesystem(self, filesystem_file, store_path, size_bytes)
    }

    fn list_volumes(&self) -> StrataResult<Vec<String>> {
        BtrfsDriver::list_volumes(self)
    }

    fn destroy_volume(&self, id: &str) -> StrataResult<()> {
        BtrfsDriver::destroy_volume(self, id)
    }

    fn destroy_image(&self, image_path: &Path) -> StrataResult<()> {
        BtrfsDriver::destroy_image(self, image_path)
    }
}

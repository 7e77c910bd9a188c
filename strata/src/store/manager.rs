//! Store initialization and deletion.

use std::path::Path;

use crate::errors::{StrataError, StrataResult};
use crate::idmap::IdMappings;
use crate::locksmith::{FileSystemLocksmith, GLOBAL_LOCK_KEY};
use crate::store::layout::StoreLayout;
use crate::store::namespacer::StoreNamespacer;

/// Driver capabilities the manager needs. Implemented by the BTRFS driver;
/// narrow so tests can substitute a fake.
pub trait StoreDriver {
    /// Fail unless `path` lives on a filesystem this driver can manage.
    fn validate_filesystem(&self, path: &Path) -> StrataResult<()>;
    /// Create a backing file of `size_bytes`, format it and mount it at
    /// `store_path`.
    fn init_filesystem(
        &self,
        filesystem_file: &Path,
        store_path: &Path,
        size_bytes: i64,
    ) -> StrataResult<()>;
    fn list_volumes(&self) -> StrataResult<Vec<String>>;
    fn destroy_volume(&self, id: &str) -> StrataResult<()>;
    fn destroy_image(&self, image_path: &Path) -> StrataResult<()>;
}

#[derive(Clone, Debug, Default)]
pub struct InitSpec {
    pub mappings: IdMappings,
    /// When non-zero, a dedicated filesystem of this size is created and
    /// mounted at the store path before initialization.
    pub store_size_bytes: i64,
}

pub struct StoreManager<'a, D: StoreDriver> {
    layout: StoreLayout,
    namespacer: StoreNamespacer,
    driver: &'a D,
}

impl<'a, D: StoreDriver> StoreManager<'a, D> {
    pub fn new(layout: StoreLayout, driver: &'a D) -> Self {
        let namespacer = StoreNamespacer::new(&layout);
        Self {
            layout,
            namespacer,
            driver,
        }
    }

    /// Whether the store skeleton and namespace identity are in place.
    pub fn is_store_initialized(&self) -> bool {
        self.layout.volumes_dir().is_dir()
            && self.layout.images_dir().is_dir()
            && self.layout.meta_dir().is_dir()
            && self.layout.dependencies_dir().is_dir()
            && self.layout.locks_dir().is_dir()
            && self.layout.namespace_file_path().is_file()
    }

    pub fn init_store(
        &self,
        locksmith: &FileSystemLocksmith,
        spec: InitSpec,
    ) -> StrataResult<()> {
        let store_path = self.layout.root();
        tracing::info!(store = %store_path.display(), "initializing-store");

        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StrataError::Backend(format!("creating {}: {}", parent.display(), e))
            })?;
        }

        if spec.store_size_bytes > 0 {
            let backing_file = backing_file_path(store_path);
            self.driver
                .init_filesystem(&backing_file, store_path, spec.store_size_bytes)?;
        }

        self.driver.validate_filesystem(store_path)?;
        self.layout.prepare()?;

        // The lock file lives in the store, so the skeleton has to exist
        // before init can be serialized against other writers.
        let _lock = locksmith.lock_exclusive(GLOBAL_LOCK_KEY)?;

        self.namespacer.apply(&spec.mappings)?;

        let (owner_uid, owner_gid) = spec.mappings.store_owner();
        self.configure_ownership(owner_uid, owner_gid)?;
        self.create_whiteout_device(owner_uid, owner_gid)?;

        tracing::info!(store = %store_path.display(), owner_uid, owner_gid, "store-initialized");
        Ok(())
    }

    /// Tear the store down: every image, every volume, then the directory
    /// tree. Holding the global lock exclusively keeps creates out.
    pub fn delete_store(&self, locksmith: &FileSystemLocksmith) -> StrataResult<()> {
        let store_path = self.layout.root();
        if !store_path.exists() {
            tracing::info!(store = %store_path.display(), "store-already-absent");
            return Ok(());
        }

        let _lock = locksmith.lock_exclusive(GLOBAL_LOCK_KEY)?;

        if self.layout.images_dir().is_dir() {
            for image_id in self.list_image_ids()? {
                self.driver
                    .destroy_image(&self.layout.image_path(&image_id))?;
            }
        }

        if self.layout.volumes_dir().is_dir() {
            for volume_id in self.driver.list_volumes()? {
                self.driver.destroy_volume(&volume_id)?;
            }
        }

        std::fs::remove_dir_all(store_path).map_err(|e| {
            StrataError::Backend(format!("removing {}: {}", store_path.display(), e))
        })?;

        tracing::info!(store = %store_path.display(), "store-deleted");
        Ok(())
    }

    fn list_image_ids(&self) -> StrataResult<Vec<String>> {
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(self.layout.images_dir()).map_err(|e| {
            StrataError::Backend(format!("failed to read images dir: {}", e))
        })?;
        for entry in entries {
            let entry = entry
                .map_err(|e| StrataError::Backend(format!("failed to read images dir: {}", e)))?;
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        Ok(ids)
    }

    fn configure_ownership(&self, owner_uid: u32, owner_gid: u32) -> StrataResult<()> {
        use std::os::unix::fs::PermissionsExt;

        if owner_uid == 0 && owner_gid == 0 {
            return Ok(());
        }

        for path in [
            self.layout.root().to_path_buf(),
            self.layout.volumes_dir(),
            self.layout.images_dir(),
            self.layout.meta_dir(),
            self.layout.dependencies_dir(),
            self.layout.locks_dir(),
            self.layout.tmp_dir(),
        ] {
            std::os::unix::fs::chown(&path, Some(owner_uid), Some(owner_gid)).map_err(|e| {
                StrataError::Backend(format!(
                    "changing {} ownership to {}:{}: {}",
                    path.display(),
                    owner_uid,
                    owner_gid,
                    e
                ))
            })?;
        }

        std::fs::set_permissions(
            self.layout.root(),
            std::fs::Permissions::from_mode(0o700),
        )
        .map_err(|e| {
            StrataError::Backend(format!(
                "restricting store permissions on {}: {}",
                self.layout.root().display(),
                e
            ))
        })?;

        Ok(())
    }

    /// Device nodes in layers cannot be created by unprivileged unpackers;
    /// they are hard-linked to this 0:0 character device instead.
    fn create_whiteout_device(&self, owner_uid: u32, owner_gid: u32) -> StrataResult<()> {
        let path = self.layout.whiteout_device_path();
        if path.exists() {
            return Ok(());
        }

        let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| {
            StrataError::Backend(format!("path contains interior NUL: {}", path.display()))
        })?;
        let res = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFCHR, 0) };
        if res != 0 {
            let err = std::io::Error::last_os_error();
            return Err(StrataError::Backend(format!(
                "creating whiteout device {}: {}",
                path.display(),
                err
            )));
        }

        if owner_uid != 0 || owner_gid != 0 {
            std::os::unix::fs::chown(&path, Some(owner_uid), Some(owner_gid)).map_err(|e| {
                StrataError::Backend(format!(
                    "changing whiteout device ownership: {}",
                    e
                ))
            })?;
        }
        Ok(())
    }
}

fn backing_file_path(store_path: &Path) -> std::path::PathBuf {
    let mut name = store_path.as_os_str().to_os_string();
    name.push(".backing-store");
    std::path::PathBuf::from(name)
}

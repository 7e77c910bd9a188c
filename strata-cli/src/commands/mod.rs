pub mod clean;
pub mod create;
pub mod delete;
pub mod delete_store;
pub mod init_store;
pub mod stats;
pub mod unpack;

use std::path::Path;

use strata::dependencies::DependencyManager;
use strata::fs::{BtrfsConfig, BtrfsDriver};
use strata::locksmith::FileSystemLocksmith;
use strata::store::layout::StoreLayout;
use strata::telemetry::Emitter;

use crate::cli::GlobalFlags;
use crate::config::{Config, ConfigBuilder};

const DEFAULT_STORE: &str = "/var/lib/strata";

/// Start a config builder seeded with the global flags.
pub(crate) fn base_config(global: &GlobalFlags) -> anyhow::Result<ConfigBuilder> {
    let is_default_store = global.store == Path::new(DEFAULT_STORE);
    Ok(ConfigBuilder::load(global.config.as_deref())?
        .with_store(&global.store, is_default_store)
        .with_metron_endpoint(global.metron_endpoint.as_ref()))
}

/// The components every store-touching command wires up.
pub(crate) struct StoreSession {
    pub layout: StoreLayout,
    pub driver: BtrfsDriver,
    pub locksmith: FileSystemLocksmith,
    pub metrics: Emitter,
    pub dependency_manager: DependencyManager,
}

impl StoreSession {
    pub fn new(config: &Config) -> Self {
        let layout = StoreLayout::new(config.store_path.clone());
        let metrics = Emitter::new(config.metron_endpoint.clone());
        let driver = BtrfsDriver::new(BtrfsConfig {
            store_path: config.store_path.clone(),
            btrfs_bin: config.btrfs_bin.clone(),
            quota_helper_bin: config.quota_helper_bin.clone(),
        });
        let locksmith = FileSystemLocksmith::new(layout.locks_dir(), metrics.clone());
        let dependency_manager = DependencyManager::new(layout.dependencies_dir());
        Self {
            layout,
            driver,
            locksmith,
            metrics,
            dependency_manager,
        }
    }
}

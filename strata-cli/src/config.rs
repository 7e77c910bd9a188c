//! Configuration file loading and flag merging.
//!
//! Values resolve flag-first: an explicitly set CLI flag beats the config
//! file, which beats the built-in default.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// The YAML shape of `--config`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub store: Option<PathBuf>,
    pub btrfs_bin: Option<PathBuf>,
    pub quota_helper_bin: Option<PathBuf>,
    pub newuidmap_bin: Option<PathBuf>,
    pub newgidmap_bin: Option<PathBuf>,
    pub metron_endpoint: Option<String>,
    #[serde(default)]
    pub create: CreateSection,
    #[serde(default)]
    pub clean: CleanSection,
    #[serde(default)]
    pub init: InitSection,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSection {
    pub insecure_registries: Option<Vec<String>>,
    pub disk_limit_size_bytes: Option<i64>,
    pub exclude_image_from_quota: Option<bool>,
    pub skip_layer_validation: Option<bool>,
    pub with_clean: Option<bool>,
    pub without_mount: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanSection {
    pub threshold_bytes: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitSection {
    pub store_size_bytes: Option<i64>,
}

/// Fully resolved configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub store_path: PathBuf,
    pub btrfs_bin: PathBuf,
    pub quota_helper_bin: PathBuf,
    pub newuidmap_bin: PathBuf,
    pub newgidmap_bin: PathBuf,
    pub metron_endpoint: Option<String>,
    pub insecure_registries: Vec<String>,
    pub disk_limit_size_bytes: i64,
    pub exclude_image_from_quota: bool,
    pub skip_layer_validation: bool,
    pub with_clean: bool,
    pub without_mount: bool,
    pub clean_threshold_bytes: i64,
    pub store_size_bytes: i64,
}

pub struct ConfigBuilder {
    file: ConfigFile,
    store_flag: Option<PathBuf>,
    metron_flag: Option<String>,
    insecure_registries: Option<Vec<String>>,
    disk_limit_size_bytes: Option<i64>,
    exclude_image_from_quota: Option<bool>,
    skip_layer_validation: Option<bool>,
    with_clean: Option<bool>,
    without_mount: Option<bool>,
    clean_threshold_bytes: Option<i64>,
    store_size_bytes: Option<i64>,
}

impl ConfigBuilder {
    /// Load the config file when given, otherwise start from defaults.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match config_path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_yaml::from_str(&contents)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => ConfigFile::default(),
        };

        Ok(Self {
            file,
            store_flag: None,
            metron_flag: None,
            insecure_registries: None,
            disk_limit_size_bytes: None,
            exclude_image_from_quota: None,
            skip_layer_validation: None,
            with_clean: None,
            without_mount: None,
            clean_threshold_bytes: None,
            store_size_bytes: None,
        })
    }

    /// `store` always comes from the CLI; clap supplies its default when
    /// the user did not pass the flag, and the config file fills in only
    /// for that default.
    pub fn with_store(mut self, store: &Path, is_default: bool) -> Self {
        if !is_default || self.file.store.is_none() {
            self.store_flag = Some(store.to_path_buf());
        }
        self
    }

    pub fn with_metron_endpoint(mut self, endpoint: Option<&String>) -> Self {
        if endpoint.is_some() {
            self.metron_flag = endpoint.cloned();
        }
        self
    }

    pub fn with_insecure_registries(mut self, registries: &[String]) -> Self {
        if !registries.is_empty() {
            self.insecure_registries = Some(registries.to_vec());
        }
        self
    }

    pub fn with_disk_limit_size_bytes(mut self, limit: Option<i64>) -> Self {
        self.disk_limit_size_bytes = limit.or(self.disk_limit_size_bytes);
        self
    }

    pub fn with_exclude_image_from_quota(mut self, exclude: bool) -> Self {
        if exclude {
            self.exclude_image_from_quota = Some(true);
        }
        self
    }

    pub fn with_skip_layer_validation(mut self, skip: bool) -> Self {
        if skip {
            self.skip_layer_validation = Some(true);
        }
        self
    }

    pub fn with_clean(mut self, with_clean: bool, without_clean: bool) -> Self {
        if with_clean {
            self.with_clean = Some(true);
        }
        if without_clean {
            self.with_clean = Some(false);
        }
        self
    }

    pub fn with_mount(mut self, with_mount: bool, without_mount: bool) -> Self {
        if with_mount {
            self.without_mount = Some(false);
        }
        if without_mount {
            self.without_mount = Some(true);
        }
        self
    }

    pub fn with_clean_threshold_bytes(mut self, threshold: Option<i64>) -> Self {
        self.clean_threshold_bytes = threshold.or(self.clean_threshold_bytes);
        self
    }

    pub fn with_store_size_bytes(mut self, size: Option<i64>) -> Self {
        self.store_size_bytes = size.or(self.store_size_bytes);
        self
    }

    pub fn build(self) -> Config {
        Config {
            store_path: self
                .store_flag
                .or(self.file.store.clone())
                .unwrap_or_else(|| PathBuf::from("/var/lib/strata")),
            btrfs_bin: self
                .file
                .btrfs_bin
                .clone()
                .unwrap_or_else(|| PathBuf::from("btrfs")),
            quota_helper_bin: self
                .file
                .quota_helper_bin
                .clone()
                .unwrap_or_else(|| PathBuf::from("strata-quota")),
            newuidmap_bin: self
                .file
                .newuidmap_bin
                .clone()
                .unwrap_or_else(|| PathBuf::from("newuidmap")),
            newgidmap_bin: self
                .file
                .newgidmap_bin
                .clone()
                .unwrap_or_else(|| PathBuf::from("newgidmap")),
            metron_endpoint: self.metron_flag.or(self.file.metron_endpoint.clone()),
            insecure_registries: self
                .insecure_registries
                .or(self.file.create.insecure_registries.clone())
                .unwrap_or_default(),
            disk_limit_size_bytes: self
                .disk_limit_size_bytes
                .or(self.file.create.disk_limit_size_bytes)
                .unwrap_or(0),
            exclude_image_from_quota: self
                .exclude_image_from_quota
                .or(self.file.create.exclude_image_from_quota)
                .unwrap_or(false),
            skip_layer_validation: self
                .skip_layer_validation
                .or(self.file.create.skip_layer_validation)
                .unwrap_or(false),
            with_clean: self
                .with_clean
                .or(self.file.create.with_clean)
                .unwrap_or(false),
            without_mount: self
                .without_mount
                .or(self.file.create.without_mount)
                .unwrap_or(false),
            clean_threshold_bytes: self
                .clean_threshold_bytes
                .or(self.file.clean.threshold_bytes)
                .unwrap_or(0),
            store_size_bytes: self
                .store_size_bytes
                .or(self.file.init.store_size_bytes)
                .unwrap_or(0),
        }
    }
}

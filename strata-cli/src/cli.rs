use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    version,
    about = "Layered copy-on-write root filesystem store for container images"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Path to the store directory
    #[arg(long, global = true, default_value = "/var/lib/strata")]
    pub store: PathBuf,

    /// Path to a YAML config file; flags win over file values
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// host:port to emit metrics to
    #[arg(long, global = true)]
    pub metron_endpoint: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a store directory
    InitStore(InitStoreArgs),
    /// Create a root filesystem for the provided image
    Create(CreateArgs),
    /// Delete a container image
    Delete(DeleteArgs),
    /// Return filesystem stats for an image
    Stats(StatsArgs),
    /// Clean up unused layers
    Clean(CleanArgs),
    /// Delete the store from the system
    DeleteStore(DeleteStoreArgs),
    /// Internal re-exec entrypoint for unprivileged unpacking
    #[command(hide = true)]
    Unpack(UnpackArgs),
}

#[derive(Args, Debug)]
pub struct InitStoreArgs {
    /// UID mapping for image translation, e.g.: <namespace uid>:<host uid>:<size>
    #[arg(long = "uid-mapping")]
    pub uid_mappings: Vec<String>,

    /// GID mapping for image translation, e.g.: <namespace gid>:<host gid>:<size>
    #[arg(long = "gid-mapping")]
    pub gid_mappings: Vec<String>,

    /// Create a filesystem of this size and mount it at the store directory
    #[arg(long)]
    pub store_size_bytes: Option<i64>,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Inclusive disk limit (i.e: includes all layers in the filesystem)
    #[arg(long)]
    pub disk_limit_size_bytes: Option<i64>,

    /// Set the disk limit to be exclusive (i.e.: excluding image layers)
    #[arg(long)]
    pub exclude_image_from_quota: bool,

    /// Clean up unused layers before creating the rootfs
    #[arg(long, conflicts_with = "without_clean")]
    pub with_clean: bool,

    /// Do NOT clean up unused layers before creating the rootfs
    #[arg(long)]
    pub without_clean: bool,

    /// Mount the root filesystem after creation (may require privileges)
    #[arg(long, conflicts_with = "without_mount")]
    pub with_mount: bool,

    /// Do not mount the root filesystem
    #[arg(long)]
    pub without_mount: bool,

    /// Do not validate checksums of image layers (oci:/// images only)
    #[arg(long)]
    pub skip_layer_validation: bool,

    /// Username to authenticate in the image registry
    #[arg(long)]
    pub username: Option<String>,

    /// Password to authenticate in the image registry
    #[arg(long)]
    pub password: Option<String>,

    /// Whitelist a private registry
    #[arg(long = "insecure-registry")]
    pub insecure_registries: Vec<String>,

    /// Image reference (docker://, oci:/// or a local tar path)
    pub image: String,

    /// Id for the new root filesystem
    pub id: String,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Image id or image path
    pub id_or_path: String,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Image id or image path
    pub id_or_path: String,
}

#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Store disk usage below which cleanup is skipped
    #[arg(long)]
    pub threshold_bytes: Option<i64>,
}

#[derive(Args, Debug)]
pub struct DeleteStoreArgs {}

#[derive(Args, Debug)]
pub struct UnpackArgs {
    #[arg(long)]
    pub target_path: PathBuf,

    #[arg(long, default_value = "")]
    pub base_directory: String,

    #[arg(long)]
    pub whiteout_device: PathBuf,

    #[arg(long)]
    pub ctl_pipe_fd: i32,
}

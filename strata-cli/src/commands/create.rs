use anyhow::anyhow;
use oci_spec::runtime::{MountBuilder, ProcessBuilder, RootBuilder, SpecBuilder};

use strata::cloner::{ImageCloner, ImageInfo};
use strata::errors::{StrataError, StrataResult};
use strata::gc::GarbageCollector;
use strata::image::registry::{RegistryCredentials, RegistrySource};
use strata::image::source::ImageSource;
use strata::image::tar_source::TarSource;
use strata::image::{ImageRef, oci_layout::OciLayoutSource};
use strata::pipeline::{Cleaner, CreateSpec, Creator};
use strata::puller::BaseImagePuller;
use strata::store::manager::StoreManager;
use strata::store::measurer::StoreMeasurer;
use strata::store::namespacer::StoreNamespacer;
use strata::unpack::{IdMapper, NsIdMapperUnpacker, TarUnpacker, Unpacker};

use crate::cli::{CreateArgs, GlobalFlags};
use crate::commands::{StoreSession, base_config};
use crate::config::Config;

pub fn execute(args: CreateArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let config = base_config(global)?
        .with_insecure_registries(&args.insecure_registries)
        .with_disk_limit_size_bytes(args.disk_limit_size_bytes)
        .with_exclude_image_from_quota(args.exclude_image_from_quota)
        .with_skip_layer_validation(args.skip_layer_validation)
        .with_clean(args.with_clean, args.without_clean)
        .with_mount(args.with_mount, args.without_mount)
        .build();

    let session = StoreSession::new(&config);
    let result = run_create(&args, &config, &session);
    session
        .metrics
        .try_increment_run_count("create", result.is_err());

    match result {
        Ok(container_spec) => {
            println!("{}", container_spec);
            emit_usage_metrics(&config, &session);
            Ok(())
        }
        Err(e) => {
            tracing::debug!(error = %e, "create-failed");
            session.metrics.try_emit_error("create", &e.to_string(), 1);
            Err(anyhow!(humanize(&e, &args)))
        }
    }
}

fn run_create(args: &CreateArgs, config: &Config, session: &StoreSession) -> StrataResult<String> {
    let manager = StoreManager::new(session.layout.clone(), &session.driver);
    if !manager.is_store_initialized() {
        return Err(StrataError::Config(
            "Store path is not initialized. Please run init-store.".to_string(),
        ));
    }

    let mappings = StoreNamespacer::new(&session.layout).read()?;
    let (owner_uid, owner_gid) = mappings.store_owner();

    let source = build_source(args, config, session)?;
    let unpacker: Box<dyn Unpacker> = if unsafe { libc::geteuid() } == 0 {
        Box::new(TarUnpacker::new())
    } else {
        Box::new(NsIdMapperUnpacker::new(IdMapper::new(
            config.newuidmap_bin.clone(),
            config.newgidmap_bin.clone(),
        )))
    };

    let puller = BaseImagePuller::new(
        &*source,
        &*unpacker,
        &session.driver,
        &session.locksmith,
        session.metrics.clone(),
        mappings,
        session.layout.whiteout_device_path(),
    );
    let cloner = ImageCloner::new(&session.driver, session.layout.clone());
    let measurer = StoreMeasurer::new(config.store_path.clone());
    let gc = GarbageCollector::new(&session.driver, &cloner, &session.dependency_manager);
    let cleaner = Cleaner::new(
        &session.locksmith,
        &measurer,
        &gc,
        session.metrics.clone(),
    );
    let creator = Creator::new(
        &cloner,
        &puller,
        &session.dependency_manager,
        &session.locksmith,
        &cleaner,
        session.metrics.clone(),
    );

    let image_info = creator.create(&CreateSpec {
        id: args.id.clone(),
        mount: !config.without_mount,
        disk_limit: config.disk_limit_size_bytes,
        exclude_base_image_from_quota: config.exclude_image_from_quota,
        clean_on_create: config.with_clean,
        clean_threshold_bytes: config.clean_threshold_bytes,
        owner_uid,
        owner_gid,
    })?;

    render_container_spec(&image_info)
}

fn build_source(
    args: &CreateArgs,
    config: &Config,
    session: &StoreSession,
) -> StrataResult<Box<dyn ImageSource>> {
    match ImageRef::parse(&args.image)? {
        ImageRef::Registry { reference } => {
            let credentials = RegistryCredentials {
                username: args.username.clone(),
                password: args.password.clone(),
            };
            Ok(Box::new(RegistrySource::new(
                &reference,
                &credentials,
                &config.insecure_registries,
                session.layout.tmp_dir(),
            )?))
        }
        ImageRef::OciLayout { path, tag } => Ok(Box::new(OciLayoutSource::new(
            path,
            tag,
            config.skip_layer_validation,
        ))),
        ImageRef::LocalTar { path } => Ok(Box::new(TarSource::new(path))),
    }
}

/// Render the runtime-spec document a create emits on stdout.
fn render_container_spec(image_info: &ImageInfo) -> StrataResult<String> {
    let root = RootBuilder::default()
        .path(image_info.rootfs.clone())
        .build()
        .map_err(|e| StrataError::Backend(format!("building root spec: {}", e)))?;

    let process = ProcessBuilder::default()
        .env(image_info.config.env.clone())
        .cwd("/")
        .build()
        .map_err(|e| StrataError::Backend(format!("building process spec: {}", e)))?;

    let mut mounts = Vec::with_capacity(image_info.mounts.len());
    for mount in &image_info.mounts {
        mounts.push(
            MountBuilder::default()
                .destination(&mount.destination)
                .typ(&mount.mount_type)
                .source(&mount.source)
                .options(mount.options.clone())
                .build()
                .map_err(|e| {
                    StrataError::Backend(format!(
                        "building mount spec for {}: {}",
                        mount.destination, e
                    ))
                })?,
        );
    }

    let spec = SpecBuilder::default()
        .root(root)
        .process(process)
        .mounts(mounts)
        .build()
        .map_err(|e| StrataError::Backend(format!("building container spec: {}", e)))?;

    serde_json::to_string(&spec)
        .map_err(|e| StrataError::Backend(format!("formatting container spec: {}", e)))
}

fn emit_usage_metrics(config: &Config, session: &StoreSession) {
    let measurer = StoreMeasurer::new(config.store_path.clone());
    if let Ok(usage) = measurer.usage() {
        session.metrics.try_emit_usage("StoreUsage", usage);
    }

    let cloner = ImageCloner::new(&session.driver, session.layout.clone());
    let gc = GarbageCollector::new(&session.driver, &cloner, &session.dependency_manager);
    match gc.unused_volumes(&[]) {
        Ok(unused) => {
            session
                .metrics
                .try_emit_usage("UnusedLayersSize", measurer.cache_usage(&unused));
        }
        Err(e) => tracing::debug!(error = %e, "getting-unused-layers-failed"),
    }
}

/// Map the most common failures onto actionable one-liners; the raw error
/// is already on the debug log.
fn humanize(err: &StrataError, args: &CreateArgs) -> String {
    match err {
        StrataError::Unauthorized(_) => {
            if args.username.is_some() {
                "authorization failed: username and password are invalid".to_string()
            } else {
                format!(
                    "{} does not exist or you do not have permissions to see it.",
                    args.image
                )
            }
        }
        StrataError::Network(message)
            if message.contains("certificate") || message.contains("unknown authority") =>
        {
            "This registry is insecure. To pull images from this registry, \
             please use the --insecure-registry option."
                .to_string()
        }
        StrataError::NotFound(_) if !args.image.starts_with("docker://") => {
            "Image source doesn't exist".to_string()
        }
        other => other.to_string(),
    }
}

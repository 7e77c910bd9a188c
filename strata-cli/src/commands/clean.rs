use strata::cloner::ImageCloner;
use strata::gc::GarbageCollector;
use strata::pipeline::Cleaner;
use strata::store::measurer::StoreMeasurer;

use crate::cli::{CleanArgs, GlobalFlags};
use crate::commands::{StoreSession, base_config};

pub fn execute(args: CleanArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let config = base_config(global)?
        .with_clean_threshold_bytes(args.threshold_bytes)
        .build();

    if !config.store_path.exists() {
        // Nothing to clean is not an error.
        println!("no store found at {}", config.store_path.display());
        return Ok(());
    }

    let session = StoreSession::new(&config);
    let cloner = ImageCloner::new(&session.driver, session.layout.clone());
    let measurer = StoreMeasurer::new(config.store_path.clone());
    let gc = GarbageCollector::new(&session.driver, &cloner, &session.dependency_manager);
    let cleaner = Cleaner::new(
        &session.locksmith,
        &measurer,
        &gc,
        session.metrics.clone(),
    );

    let result = cleaner.clean(config.clean_threshold_bytes, &[]);
    session
        .metrics
        .try_increment_run_count("clean", result.is_err());
    let noop = result?;

    if noop {
        println!("threshold not reached: skipping clean");
        return Ok(());
    }

    println!("clean completed");

    if let Ok(usage) = measurer.usage() {
        session.metrics.try_emit_usage("StoreUsage", usage);
    }
    match gc.unused_volumes(&[]) {
        Ok(unused) => session
            .metrics
            .try_emit_usage("UnusedLayersSize", measurer.cache_usage(&unused)),
        Err(e) => tracing::debug!(error = %e, "getting-unused-layers-failed"),
    }

    Ok(())
}

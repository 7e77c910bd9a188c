use anyhow::anyhow;

use strata::cloner::ImageCloner;
use strata::pipeline::Statser;

use crate::cli::{GlobalFlags, StatsArgs};
use crate::commands::{StoreSession, base_config};

pub fn execute(args: StatsArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let config = base_config(global)?.build();
    let session = StoreSession::new(&config);

    let id = session
        .layout
        .find_image_id(&args.id_or_path)
        .map_err(|e| anyhow!(e.to_string()))?;

    let cloner = ImageCloner::new(&session.driver, session.layout.clone());
    let statser = Statser::new(&cloner, session.metrics.clone());

    let result = statser.stats(&id);
    session
        .metrics
        .try_increment_run_count("stats", result.is_err());
    let stats = result?;

    println!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

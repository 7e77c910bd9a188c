use anyhow::{anyhow, bail};

use strata::idmap::{IdMapping, IdMappings};
use strata::store::manager::{InitSpec, StoreManager};

use crate::cli::{GlobalFlags, InitStoreArgs};
use crate::commands::{StoreSession, base_config};

pub fn execute(args: InitStoreArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let config = base_config(global)?
        .with_store_size_bytes(args.store_size_bytes)
        .build();

    if unsafe { libc::geteuid() } != 0 {
        bail!(
            "store {} can only be initialized by the root user",
            config.store_path.display()
        );
    }

    let mappings = IdMappings {
        uid_mappings: parse_mappings(&args.uid_mappings, "uid-mapping")?,
        gid_mappings: parse_mappings(&args.gid_mappings, "gid-mapping")?,
    };

    let session = StoreSession::new(&config);
    let manager = StoreManager::new(session.layout.clone(), &session.driver);
    manager
        .init_store(
            &session.locksmith,
            InitSpec {
                mappings,
                store_size_bytes: config.store_size_bytes,
            },
        )
        .map_err(|e| anyhow!(e.to_string()))?;

    Ok(())
}

fn parse_mappings(raw: &[String], flag: &str) -> anyhow::Result<Vec<IdMapping>> {
    raw.iter()
        .map(|value| {
            IdMapping::parse(value).map_err(|e| anyhow!("parsing {}: {}", flag, e))
        })
        .collect()
}

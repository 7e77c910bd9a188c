use anyhow::anyhow;

use strata::store::manager::StoreManager;

use crate::cli::{DeleteStoreArgs, GlobalFlags};
use crate::commands::{StoreSession, base_config};

pub fn execute(_args: DeleteStoreArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let config = base_config(global)?.build();
    let session = StoreSession::new(&config);

    let manager = StoreManager::new(session.layout.clone(), &session.driver);
    manager
        .delete_store(&session.locksmith)
        .map_err(|e| anyhow!(e.to_string()))?;

    Ok(())
}

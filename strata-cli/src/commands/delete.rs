use strata::cloner::ImageCloner;
use strata::pipeline::Deleter;

use crate::cli::{DeleteArgs, GlobalFlags};
use crate::commands::{StoreSession, base_config};

pub fn execute(args: DeleteArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let config = base_config(global)?.build();
    let session = StoreSession::new(&config);

    let id = match session.layout.find_image_id(&args.id_or_path) {
        Ok(id) => id,
        Err(e) => {
            // Asking to delete something that cannot name an image in this
            // store is a no-op, not a failure.
            tracing::debug!(target = %args.id_or_path, error = %e, "id-not-found-skipping");
            println!("{}", e);
            return Ok(());
        }
    };

    if !session.layout.image_path(&id).exists() {
        println!("Image `{}` not found. Skipping delete.", id);
        return Ok(());
    }

    let cloner = ImageCloner::new(&session.driver, session.layout.clone());
    let deleter = Deleter::new(&cloner, &session.dependency_manager, session.metrics.clone());

    let result = deleter.delete(&id);
    session
        .metrics
        .try_increment_run_count("delete", result.is_err());
    result?;

    println!("Image {} deleted", id);
    Ok(())
}

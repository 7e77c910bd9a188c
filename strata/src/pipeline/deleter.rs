//! The delete pipeline: destroy the image, then its dependency record.

use std::time::Instant;

use crate::cloner::ImageCloner;
use crate::dependencies::DependencyManager;
use crate::errors::{StrataError, StrataResult};
use crate::store::layout::image_ref_key;
use crate::telemetry::Emitter;

pub struct Deleter<'a> {
    image_cloner: &'a ImageCloner<'a>,
    dependency_manager: &'a DependencyManager,
    metrics: Emitter,
}

impl<'a> Deleter<'a> {
    pub fn new(
        image_cloner: &'a ImageCloner<'a>,
        dependency_manager: &'a DependencyManager,
        metrics: Emitter,
    ) -> Self {
        Self {
            image_cloner,
            dependency_manager,
            metrics,
        }
    }

    pub fn delete(&self, id: &str) -> StrataResult<()> {
        let start = Instant::now();

        // Destroy before deregistering: a record pointing at a destroyed
        // image is harmless, an image without a record can be collected
        // out from under a user.
        self.image_cloner.destroy(id)?;

        match self.dependency_manager.deregister(&image_ref_key(id)) {
            Ok(()) => {}
            Err(StrataError::NotFound(_)) => {
                tracing::debug!(id, "dependency-record-already-absent");
            }
            Err(e) => return Err(e.wrap("deregistering image dependencies")),
        }

        self.metrics
            .try_emit_duration_from("ImageDeletionTime", start);
        Ok(())
    }
}

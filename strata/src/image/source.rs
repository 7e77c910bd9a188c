//! The image-source collaborator interface.

use std::io::Read;

use crate::errors::StrataResult;
use crate::image::{BaseImageInfo, LayerInfo};

/// A resolved image the puller can stream layers from.
///
/// Implementations exist for remote registries, local OCI layouts and local
/// tar files; the puller is agnostic of which one it holds.
pub trait ImageSource {
    /// Resolve the source into an ordered layer list plus configuration.
    fn base_image_info(&self) -> StrataResult<BaseImageInfo>;

    /// Open the (possibly compressed) blob for `layer`. Returns the byte
    /// stream and the blob size when known (0 otherwise).
    fn stream_blob(&self, layer: &LayerInfo) -> StrataResult<(Box<dyn Read + Send>, i64)>;
}

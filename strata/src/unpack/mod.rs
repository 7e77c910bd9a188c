//! Layer tar unpacking.
//!
//! Two strategies produce identical on-disk results: `TarUnpacker` applies
//! the stream directly (ownership remapped in-process, requires privilege),
//! and `NsIdMapperUnpacker` re-execs the binary inside a new user namespace
//! where the kernel performs the remapping.

pub mod ns;
pub mod tar;

use std::io::Read;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::StrataResult;
use crate::idmap::IdMapping;

pub use ns::{IdMapper, NsIdMapperUnpacker};
pub use tar::TarUnpacker;

/// Tar entry basename prefix marking a single-file whiteout.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Tar entry basename marking an opaque directory whiteout.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

pub struct UnpackSpec {
    pub stream: Box<dyn Read + Send>,
    pub target_path: PathBuf,
    /// Non-root prefix the layer's entries unpack under, empty for the root.
    pub base_directory: String,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    /// Placeholder device linked in place of device nodes that cannot be
    /// created unprivileged.
    pub whiteout_device_path: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpackOutput {
    /// Uncompressed bytes the layer declared for its entries.
    pub bytes_written: i64,
    /// Marker entry paths (relative to the volume root) recorded during the
    /// walk; the filesystem driver masks the marked directories afterwards.
    pub opaque_whiteouts: Vec<String>,
}

pub trait Unpacker {
    fn unpack(&self, spec: UnpackSpec) -> StrataResult<UnpackOutput>;
}

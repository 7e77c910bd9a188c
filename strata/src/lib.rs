//! Layered copy-on-write root filesystem store for container images.
//!
//! strata turns a container image reference into a mounted root filesystem
//! backed by BTRFS subvolumes. Each image layer is materialized once as a
//! content-addressed volume snapshotted from its parent; working images are
//! writable snapshots of the top layer. The store is shared between
//! processes: per-layer file locks give at-most-one-builder semantics and a
//! two-phase garbage collector reclaims layers no image depends on.

pub mod cloner;
pub mod dependencies;
pub mod errors;
pub mod fs;
pub mod gc;
pub mod idmap;
pub mod image;
pub mod locksmith;
pub mod pipeline;
pub mod puller;
pub mod store;
pub mod telemetry;
pub mod unpack;

pub use errors::{StrataError, StrataResult};
pub use idmap::{IdMapping, IdMappings};
pub use store::layout::StoreLayout;

//! Ports: capabilities the engine consumes without owning their implementation

pub mod localfs;
pub mod vfs;

pub use localfs::LocalFs;
pub use vfs::{ItemMetadata, PinState, Vfs, VfsOff, VfsStatus};

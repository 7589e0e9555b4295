//! Filesystem plumbing: mount operations, the mount table snapshot,
//! and path primitives used by both managers.

pub mod mounts;
pub mod pathops;

pub use mounts::{MountEntry, MountFlags, MountTable, UnmountFlags};
pub use pathops::FsUsage;

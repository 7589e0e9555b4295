//! Cgroup management: controller discovery, the node-per-cgroup tree,
//! process attachment, freeze/kill, and teardown.

pub mod snapshot;
pub mod subsystem;
pub mod tree;

pub use snapshot::CgroupSnapshot;
pub use tree::{Cgroup, CgroupRegistry};

/// Name of our top-level cgroup in every shared hierarchy.
pub const APP_ROOT_CGROUP: &str = "silo";

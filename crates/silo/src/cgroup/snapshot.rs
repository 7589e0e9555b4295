//! Discovery of every cgroup hierarchy already present on the host.

use std::sync::Arc;

use silo_common::SiloResult;

use crate::filesystem::mounts::MountTable;
use crate::filesystem::pathops;

use super::tree::{Cgroup, CgroupRegistry};
use super::{subsystem, APP_ROOT_CGROUP};

/// All cgroups the daemon may touch, discovered from the mount table.
#[derive(Debug, Default)]
pub struct CgroupSnapshot {
    /// Discovered nodes, children before parents.
    pub cgroups: Vec<Arc<Cgroup>>,
}

impl CgroupSnapshot {
    /// Walk every mounted cgroup hierarchy.
    ///
    /// Each cgroup mount is intersected with the supported controller
    /// set; hierarchies carrying none of them are skipped. Subtrees
    /// directly under a root that are not ours are left alone — other
    /// cgroup users share these hierarchies.
    pub fn discover(registry: &CgroupRegistry) -> SiloResult<Self> {
        let table = MountTable::snapshot()?;
        let mut snapshot = Self::default();

        for entry in table.entries() {
            if entry.fstype != "cgroup" {
                continue;
            }

            let controllers = subsystem::supported_subset(&entry.flags);
            if controllers.is_empty() {
                continue;
            }

            let root = registry.root_for_mount(entry, controllers);
            Self::collect(&root, &mut snapshot.cgroups)?;
        }

        tracing::debug!(count = snapshot.cgroups.len(), "Discovered cgroups");
        Ok(snapshot)
    }

    fn collect(cgroup: &Arc<Cgroup>, out: &mut Vec<Arc<Cgroup>>) -> SiloResult<()> {
        if let Some(parent) = cgroup.parent() {
            if parent.is_root() && cgroup.name() != APP_ROOT_CGROUP {
                return Ok(());
            }
        }

        for name in pathops::subdirectories(&cgroup.path())? {
            Self::collect(&cgroup.child(&name), out)?;
        }

        out.push(cgroup.clone());
        Ok(())
    }
}

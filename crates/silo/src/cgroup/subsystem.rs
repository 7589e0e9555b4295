//! Known cgroup controllers and their controller-specific knobs.

use std::collections::BTreeSet;

/// Every controller the daemon is willing to manage.
///
/// `name=systemd` is the named hierarchy systemd mounts for itself.
pub const SUPPORTED: &[&str] = &[
    "cpuset",
    "cpu",
    "cpuacct",
    "memory",
    "devices",
    "freezer",
    "net_cls",
    "net_prio",
    "blkio",
    "perf_event",
    "hugetlb",
    "name=systemd",
];

/// Whether a controller name is one we manage.
#[must_use]
pub fn is_supported(name: &str) -> bool {
    SUPPORTED.contains(&name)
}

/// Intersection of a mount's flag set with the supported controllers.
#[must_use]
pub fn supported_subset(flags: &BTreeSet<String>) -> Vec<String> {
    flags
        .iter()
        .filter(|f| is_supported(f))
        .cloned()
        .collect()
}

/// Memory controller knobs.
pub mod memory {
    use silo_common::SiloResult;

    use crate::cgroup::tree::Cgroup;

    const USE_HIERARCHY: &str = "memory.use_hierarchy";

    /// Turn on hierarchical accounting for a cgroup.
    ///
    /// The kernel rejects the write once the cgroup has children, so
    /// this runs exactly once, right after creation.
    pub fn enable_hierarchy(cgroup: &Cgroup) -> SiloResult<()> {
        if !cgroup.has_knob(USE_HIERARCHY) {
            return Ok(());
        }
        cgroup.set_knob(USE_HIERARCHY, "1", false)
    }
}

/// Freezer controller knobs.
pub mod freezer {
    use silo_common::SiloResult;

    use crate::cgroup::tree::Cgroup;

    const STATE: &str = "freezer.state";
    const FROZEN: &str = "FROZEN";
    const THAWED: &str = "THAWED";

    /// Freeze every task in the cgroup.
    pub fn freeze(cgroup: &Cgroup) -> SiloResult<()> {
        cgroup.set_knob(STATE, FROZEN, false)
    }

    /// Thaw the cgroup.
    pub fn thaw(cgroup: &Cgroup) -> SiloResult<()> {
        cgroup.set_knob(STATE, THAWED, false)
    }

    /// Whether the cgroup is currently frozen or freezing.
    pub fn is_frozen(cgroup: &Cgroup) -> SiloResult<bool> {
        Ok(cgroup.get_knob(STATE)? != THAWED)
    }
}

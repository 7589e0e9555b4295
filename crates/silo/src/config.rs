//! Core daemon tunables.

use std::path::PathBuf;

use silo_common::paths::{SILO_PLACE, SILO_STATE_DIR};

/// Configuration shared by the cgroup and volume managers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default place for volumes and layers.
    pub place: PathBuf,
    /// Directory holding persisted volume records.
    pub state_dir: PathBuf,
    /// Whether project quotas may be used at all.
    pub enable_quota: bool,
    /// Group id owning the volumes and layers directories.
    pub runtime_gid: u32,
    /// Parent directory of the controller hierarchies.
    pub cgroup_root: PathBuf,
    /// How long cgroup removal keeps killing stragglers, in seconds.
    pub cgroup_remove_timeout_s: u64,
}

impl Config {
    /// Configuration with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the place directory.
    #[must_use]
    pub fn with_place(mut self, place: impl Into<PathBuf>) -> Self {
        self.place = place.into();
        self
    }

    /// Override the record directory.
    #[must_use]
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    /// Disable project quotas globally.
    #[must_use]
    pub fn without_quota(mut self) -> Self {
        self.enable_quota = false;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            place: SILO_PLACE.clone(),
            state_dir: SILO_STATE_DIR.clone(),
            enable_quota: true,
            runtime_gid: 0,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_remove_timeout_s: 5,
        }
    }
}

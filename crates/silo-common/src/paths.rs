//! Standard filesystem layout for silo volumes and layers.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default place directory (volumes and layers live under it).
pub static SILO_PLACE: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("SILO_PLACE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/silo"))
});

/// Default directory for persisted volume records.
pub static SILO_STATE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("SILO_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/silo/state"))
});

/// Name of the volumes directory under a place.
pub const VOLUMES_DIR: &str = "volumes";

/// Name of the layers directory under a place.
pub const LAYERS_DIR: &str = "layers";

/// Staging directory for layer removal, under the layers directory.
pub const LAYERS_TMP_DIR: &str = "_tmp_";

/// Directory created inside a chroot for auto-assigned volume paths.
pub const CHROOT_DIR: &str = "silo";

/// Paths derived from one place directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiloPaths {
    /// The place root.
    pub place: PathBuf,
}

impl SiloPaths {
    /// Paths rooted at the default place.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths rooted at a custom place.
    #[must_use]
    pub fn with_place(place: impl Into<PathBuf>) -> Self {
        Self {
            place: place.into(),
        }
    }

    /// `<place>/volumes`.
    #[must_use]
    pub fn volumes(&self) -> PathBuf {
        self.place.join(VOLUMES_DIR)
    }

    /// `<place>/volumes/<id>` — per-volume internal directory.
    #[must_use]
    pub fn volume_dir(&self, id: &str) -> PathBuf {
        self.volumes().join(id)
    }

    /// `<place>/volumes/<id>/volume` — default mount target.
    #[must_use]
    pub fn volume_mountpoint(&self, id: &str) -> PathBuf {
        self.volume_dir(id).join("volume")
    }

    /// `<place>/layers`.
    #[must_use]
    pub fn layers(&self) -> PathBuf {
        self.place.join(LAYERS_DIR)
    }

    /// `<place>/layers/<name>` — a named layer root.
    #[must_use]
    pub fn layer(&self, name: &str) -> PathBuf {
        self.layers().join(name)
    }

    /// `<place>/layers/_tmp_` — layer removal staging.
    #[must_use]
    pub fn layers_tmp(&self) -> PathBuf {
        self.layers().join(LAYERS_TMP_DIR)
    }

    /// `<root>/silo` — the in-chroot directory for auto paths.
    #[must_use]
    pub fn chroot_dir(root: &Path) -> PathBuf {
        root.join(CHROOT_DIR)
    }
}

impl Default for SiloPaths {
    fn default() -> Self {
        Self {
            place: SILO_PLACE.clone(),
        }
    }
}

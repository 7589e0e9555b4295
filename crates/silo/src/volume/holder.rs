//! The volume registry: path-keyed map, id allocation, cross-volume
//! guarantee accounting, and layer garbage collection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use silo_common::{SiloError, SiloPaths, SiloResult};

use crate::config::Config;
use crate::filesystem::pathops::{self, FsUsage};

use super::backend::BackendKind;
use super::volume::{Volume, VolumeSpec};

/// Registry of live volumes.
///
/// One coarse lock protects the map, the id allocator and guarantee
/// accounting. Long operations (build, mount, copy) run outside it;
/// only registration, lookup and the guarantee arithmetic run under it.
pub struct VolumeHolder {
    config: Config,
    inner: Mutex<Inner>,
}

struct Inner {
    volumes: HashMap<PathBuf, Arc<Mutex<Volume>>>,
    next_id: u64,
}

impl VolumeHolder {
    /// An empty holder.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                volumes: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// The configuration volumes are created under.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Allocate an id and hand out an unregistered volume.
    #[must_use]
    pub fn create(&self) -> Volume {
        let id = {
            let mut inner = self.inner.lock().expect("volume holder lock");
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };
        Volume::new(self.config.clone(), id.to_string())
    }

    /// Make sure future ids stay above an id seen during recovery.
    pub fn bump_next_id(&self, seen: u64) {
        let mut inner = self.inner.lock().expect("volume holder lock");
        if seen >= inner.next_id {
            inner.next_id = seen + 1;
        }
    }

    /// Insert a volume by path.
    pub fn register(&self, volume: Volume) -> SiloResult<Arc<Mutex<Volume>>> {
        let path = volume.path().to_path_buf();
        let mut inner = self.inner.lock().expect("volume holder lock");

        if inner.volumes.contains_key(&path) {
            return Err(SiloError::VolumeAlreadyExists {
                path: path.display().to_string(),
            });
        }

        let arc = Arc::new(Mutex::new(volume));
        inner.volumes.insert(path, arc.clone());
        Ok(arc)
    }

    /// Remove a volume by path, handing it back if it was registered.
    pub fn unregister(&self, path: &Path) -> Option<Arc<Mutex<Volume>>> {
        let mut inner = self.inner.lock().expect("volume holder lock");
        inner.volumes.remove(path)
    }

    /// Look a volume up by path.
    #[must_use]
    pub fn find(&self, path: &Path) -> Option<Arc<Mutex<Volume>>> {
        let inner = self.inner.lock().expect("volume holder lock");
        inner.volumes.get(path).cloned()
    }

    /// Every registered volume path.
    #[must_use]
    pub fn list_paths(&self) -> Vec<PathBuf> {
        let inner = self.inner.lock().expect("volume holder lock");
        inner.volumes.keys().cloned().collect()
    }

    /// Ids of every registered volume.
    #[must_use]
    pub fn list_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("volume holder lock");
        inner
            .volumes
            .values()
            .filter_map(|arc| arc.try_lock().ok().map(|v| v.id().to_string()))
            .collect()
    }

    /// Unregister and destroy one volume.
    pub fn destroy_volume(&self, path: &Path) -> SiloResult<()> {
        let arc = self.unregister(path).ok_or_else(|| SiloError::InvalidValue {
            message: format!("volume {} not found", path.display()),
        })?;

        let mut volume = arc.lock().expect("volume lock");
        volume.destroy(self)
    }

    /// Destroy every registered volume, logging failures.
    pub fn destroy_all(&self) {
        for path in self.list_paths() {
            if let Err(err) = self.destroy_volume(&path) {
                tracing::error!(path = %path.display(), %err, "Cannot destroy volume");
            }
        }
    }

    /// Whether any volume with this place references the layer.
    #[must_use]
    pub fn layer_in_use(&self, name: &str, place: &Path) -> bool {
        let inner = self.inner.lock().expect("volume holder lock");
        Self::layer_in_use_locked(&inner, name, place)
    }

    fn layer_in_use_locked(inner: &Inner, name: &str, place: &Path) -> bool {
        for arc in inner.volumes.values() {
            // A contended volume counts as using the layer; removal can
            // be retried, silently dropping a layer cannot.
            let Ok(volume) = arc.try_lock() else {
                return true;
            };
            let spec = volume.spec();
            if spec.place == place && spec.layers.iter().any(|l| l == name) {
                return true;
            }
        }
        false
    }

    /// Remove a named layer from the place.
    ///
    /// Under the holder lock the layer is renamed into the `_tmp_`
    /// staging directory; the actual tree removal happens outside the
    /// lock. The staging directory is pre-created at startup.
    pub fn remove_layer(&self, name: &str, place: &Path) -> SiloResult<()> {
        let paths = SiloPaths::with_place(place);
        let layer = paths.layer(name);

        if !layer.exists() {
            return Err(SiloError::LayerNotFound {
                name: name.to_string(),
            });
        }

        let staged = paths.layers_tmp().join(name);
        {
            let inner = self.inner.lock().expect("volume holder lock");
            if Self::layer_in_use_locked(&inner, name, place) {
                return Err(SiloError::Busy {
                    message: format!("layer {} in use", name),
                });
            }
            std::fs::rename(&layer, &staged)?;
        }

        pathops::remove_all(&staged)
    }

    /// Decide whether a volume may hold the wanted guarantees.
    ///
    /// Availability on the storage device must cover the new guarantee
    /// on top of every other volume's guarantee, where each of those is
    /// claimed at `min(usage, guarantee)` — over-quota usage is
    /// opportunistic and reclaimable. rbd stores remotely and plain
    /// cannot report usage, so both are skipped; loop pre-allocates its
    /// inodes inside the image, so its inode side is exempt.
    pub fn check_guarantee(
        &self,
        candidate: &VolumeSpec,
        current: Option<FsUsage>,
        want_space: u64,
        want_inodes: u64,
    ) -> SiloResult<()> {
        let kind = candidate.kind();

        if kind == BackendKind::Rbd || kind == BackendKind::Tmpfs {
            return Ok(());
        }
        if want_space == 0 && want_inodes == 0 {
            return Ok(());
        }

        let storage_root = if candidate.is_auto_storage() {
            candidate.paths().volumes()
        } else {
            candidate.storage()
        };

        let total = pathops::statfs(&storage_root)?;
        let current = current.unwrap_or_default();

        if total.space_avail + current.space_used < want_space {
            return Err(SiloError::NoSpace {
                message: format!(
                    "not enough space for volume guarantee: {} available {} used",
                    total.space_avail, current.space_used
                ),
            });
        }
        if kind != BackendKind::Loop && total.inode_avail + current.inode_used < want_inodes {
            return Err(SiloError::NoSpace {
                message: format!(
                    "not enough inodes for volume guarantee: {} available {} used",
                    total.inode_avail, current.inode_used
                ),
            });
        }

        let device = pathops::device_id(&storage_root)?;

        let mut space_claimed: u64 = 0;
        let mut space_guaranteed: u64 = 0;
        let mut inode_claimed: u64 = 0;
        let mut inode_guaranteed: u64 = 0;

        let inner = self.inner.lock().expect("volume holder lock");
        for (path, arc) in &inner.volumes {
            if *path == candidate.path {
                continue;
            }
            // A volume busy in another operation claims nothing here;
            // that only makes this check stricter.
            let Ok(volume) = arc.try_lock() else {
                continue;
            };
            let spec = volume.spec();

            let other_kind = spec.kind();
            if other_kind == BackendKind::Rbd || other_kind == BackendKind::Plain {
                continue;
            }
            if spec.space_guarantee == 0 && spec.inode_guarantee == 0 {
                continue;
            }

            let other_root = if spec.is_auto_storage() {
                spec.paths().volumes()
            } else {
                spec.storage()
            };
            match pathops::device_id(&other_root) {
                Ok(other_device) if other_device == device => {}
                _ => continue,
            }

            let stat = if volume.is_ready() {
                volume.stat_fs().unwrap_or_default()
            } else {
                FsUsage::default()
            };

            space_guaranteed += spec.space_guarantee;
            space_claimed += stat.space_used.min(spec.space_guarantee);

            if other_kind != BackendKind::Loop {
                inode_guaranteed += spec.inode_guarantee;
                inode_claimed += stat.inode_used.min(spec.inode_guarantee);
            }
        }
        drop(inner);

        if total.space_avail + current.space_used + space_claimed
            < want_space + space_guaranteed
        {
            return Err(SiloError::NoSpace {
                message: format!(
                    "not enough space for volume guarantee: {} available {} used {} claimed {} guaranteed",
                    total.space_avail, current.space_used, space_claimed, space_guaranteed
                ),
            });
        }
        if kind != BackendKind::Loop
            && total.inode_avail + current.inode_used + inode_claimed
                < want_inodes + inode_guaranteed
        {
            return Err(SiloError::NoSpace {
                message: format!(
                    "not enough inodes for volume guarantee: {} available {} used {} claimed {} guaranteed",
                    total.inode_avail, current.inode_used, inode_claimed, inode_guaranteed
                ),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_holder() -> (tempfile::TempDir, VolumeHolder) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default()
            .with_place(dir.path())
            .with_state_dir(dir.path().join("state"));
        (dir, VolumeHolder::new(config))
    }

    fn volume_at(holder: &VolumeHolder, path: &Path) -> Volume {
        let mut volume = holder.create();
        // Registration only needs a path; skip full configuration.
        set_path(&mut volume, path);
        volume
    }

    fn set_path(volume: &mut Volume, path: &Path) {
        // Restore-style assignment through the record round trip.
        let mut record = volume.to_record();
        record.path = path.display().to_string();
        record.ready = "true".to_string();
        record.backend = "plain".to_string();
        volume.restore(&record).unwrap();
    }

    #[test]
    fn ids_are_monotonic() {
        let (_dir, holder) = test_holder();
        assert_eq!(holder.create().id(), "1");
        assert_eq!(holder.create().id(), "2");

        holder.bump_next_id(41);
        assert_eq!(holder.create().id(), "42");

        holder.bump_next_id(7);
        assert_eq!(holder.create().id(), "43");
    }

    #[test]
    fn register_conflicts_on_path() {
        let (_dir, holder) = test_holder();
        let path = Path::new("/mnt/data");

        holder.register(volume_at(&holder, path)).unwrap();
        let err = holder.register(volume_at(&holder, path)).unwrap_err();
        assert!(matches!(err, SiloError::VolumeAlreadyExists { .. }));

        assert!(holder.find(path).is_some());
        holder.unregister(path).unwrap();
        assert!(holder.find(path).is_none());

        // A fresh registration after unregister succeeds again.
        holder.register(volume_at(&holder, path)).unwrap();
    }

    #[test]
    fn layer_use_tracking() {
        let (_dir, holder) = test_holder();
        let place = holder.config().place.clone();

        let mut volume = holder.create();
        let mut record = volume.to_record();
        record.path = "/mnt/overlay".to_string();
        record.ready = "true".to_string();
        record.backend = "overlay".to_string();
        record.layers = "base;app".to_string();
        volume.restore(&record).unwrap();
        holder.register(volume).unwrap();

        assert!(holder.layer_in_use("base", &place));
        assert!(holder.layer_in_use("app", &place));
        assert!(!holder.layer_in_use("other", &place));
        assert!(!holder.layer_in_use("base", Path::new("/elsewhere")));
    }

    #[test]
    fn remove_layer_stages_through_tmp() {
        let (_dir, holder) = test_holder();
        let place = holder.config().place.clone();
        let paths = SiloPaths::with_place(&place);

        pathops::create_dir_all(&paths.layers_tmp(), 0o700).unwrap();
        pathops::create_dir_all(&paths.layer("stale"), 0o700).unwrap();
        std::fs::write(paths.layer("stale").join("f"), b"x").unwrap();

        holder.remove_layer("stale", &place).unwrap();
        assert!(!paths.layer("stale").exists());
        assert!(paths.layers_tmp().exists());

        let err = holder.remove_layer("stale", &place).unwrap_err();
        assert!(matches!(err, SiloError::LayerNotFound { .. }));
    }

    #[test]
    fn remove_layer_in_use_is_busy() {
        let (_dir, holder) = test_holder();
        let place = holder.config().place.clone();
        let paths = SiloPaths::with_place(&place);

        pathops::create_dir_all(&paths.layers_tmp(), 0o700).unwrap();
        pathops::create_dir_all(&paths.layer("base"), 0o700).unwrap();

        let mut volume = holder.create();
        let mut record = volume.to_record();
        record.path = "/mnt/overlay".to_string();
        record.ready = "true".to_string();
        record.backend = "overlay".to_string();
        record.layers = "base".to_string();
        volume.restore(&record).unwrap();
        holder.register(volume).unwrap();

        let err = holder.remove_layer("base", &place).unwrap_err();
        assert!(matches!(err, SiloError::Busy { .. }));
        assert!(paths.layer("base").exists());
    }
}

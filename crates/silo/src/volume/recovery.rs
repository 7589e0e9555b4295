//! Startup recovery: replay persisted records, re-bind container
//! links, purge orphaned on-disk state.

use std::collections::HashSet;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use silo_common::{SiloError, SiloPaths, SiloResult};

use crate::config::Config;
use crate::filesystem::mounts;
use crate::filesystem::pathops;

use super::holder::VolumeHolder;
use super::record::VolumeRecord;
use super::volume::Volume;

/// The external container registry, as little of it as recovery needs.
pub trait ContainerRegistry {
    /// Whether a container with this name is known.
    fn exists(&self, name: &str) -> bool;

    /// Re-bind a restored volume to a known container.
    fn attach_volume(&self, name: &str, volume_path: &Path);
}

/// A registry that knows no containers; every restored link is dropped.
pub struct NoContainers;

impl ContainerRegistry for NoContainers {
    fn exists(&self, _name: &str) -> bool {
        false
    }

    fn attach_volume(&self, _name: &str, _volume_path: &Path) {}
}

/// Enforce the canonical layout of a place directory.
///
/// The volumes directory is root-owned with the runtime group, 0755;
/// the layers directory is 0700. With `init` both are created if
/// missing, along with the layer removal staging directory.
pub fn check_place(config: &Config, place: &Path, init: bool) -> SiloResult<()> {
    if !place.is_absolute() || !pathops::is_normalized(place) {
        return Err(SiloError::InvalidValue {
            message: "place path must be normalized".to_string(),
        });
    }

    let paths = SiloPaths::with_place(place);

    check_place_dir(config, &paths.volumes(), 0o755, init)?;
    check_place_dir(config, &paths.layers(), 0o700, init)?;

    let tmp = paths.layers_tmp();
    if !tmp.is_dir() {
        let _ = pathops::remove_all(&tmp);
        let _ = pathops::create_dir(&tmp, 0o700);
    }

    Ok(())
}

fn check_place_dir(config: &Config, dir: &Path, mode: u32, init: bool) -> SiloResult<()> {
    if init && !dir.is_dir() {
        pathops::remove_all(dir)?;
        pathops::create_dir_all(dir, mode)?;
    }

    let meta = std::fs::metadata(dir).map_err(|_| SiloError::InvalidValue {
        message: format!("in place {} must be a directory", dir.display()),
    })?;
    if !meta.is_dir() {
        return Err(SiloError::InvalidValue {
            message: format!("in place {} must be a directory", dir.display()),
        });
    }

    if meta.uid() != 0 || meta.gid() != config.runtime_gid {
        let _ = pathops::chown(dir, 0, config.runtime_gid);
    }
    if meta.permissions().mode() & 0o777 != mode {
        let _ = pathops::chmod(dir, mode);
    }

    Ok(())
}

/// Replay every persisted volume record.
///
/// Crash-safe by construction: a half-built volume either has
/// `ready=false` in its record (discarded here) or no record at all
/// (its directory is removed as an orphan).
pub fn restore(holder: &VolumeHolder, containers: &dyn ContainerRegistry) -> SiloResult<()> {
    let config = holder.config().clone();

    if let Err(err) = check_place(&config, &config.place, true) {
        tracing::error!(%err, "Cannot prepare place");
    }

    tracing::info!("Removing stale layers");
    let layers_tmp = SiloPaths::with_place(&config.place).layers_tmp();
    if layers_tmp.exists() {
        if let Err(err) = pathops::clear_directory(&layers_tmp) {
            tracing::error!(%err, "Cannot remove stale layers");
        }
    }

    for node in VolumeRecord::list(&config.state_dir)? {
        tracing::info!(node = %node.display(), "Restoring volume");

        let record = match VolumeRecord::load(&node) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(node = %node.display(), %err, "Cannot load record, removed");
                let _ = pathops::remove_all(&node);
                continue;
            }
        };

        let mut volume = Volume::new(config.clone(), record.id.clone());
        if let Err(err) = volume.restore(&record) {
            tracing::warn!(node = %node.display(), %err, "Corrupted volume removed");
            let _ = volume.destroy(holder);
            continue;
        }

        if let Ok(id) = volume.id().parse::<u64>() {
            holder.bump_next_id(id);
        }

        let arc = match holder.register(volume) {
            Ok(arc) => arc,
            Err(err) => {
                tracing::warn!(node = %node.display(), %err, "Cannot register volume, removed");
                let mut volume = Volume::new(config.clone(), record.id.clone());
                if volume.restore(&record).is_ok() {
                    let _ = volume.destroy(holder);
                }
                continue;
            }
        };

        let (path, names) = {
            let volume = arc.lock().expect("volume lock");
            (volume.path().to_path_buf(), volume.containers().to_vec())
        };

        let mut destroyed = false;
        for name in names {
            if containers.exists(&name) {
                containers.attach_volume(&name, &path);
                continue;
            }

            let now_empty = {
                let mut volume = arc.lock().expect("volume lock");
                volume.unlink_container(&name)
            };
            if now_empty {
                tracing::warn!(
                    path = %path.display(),
                    container = %name,
                    "Last container gone, destroying volume"
                );
                let _ = holder.destroy_volume(&path);
                destroyed = true;
                break;
            }
        }
        if destroyed {
            continue;
        }

        let saved = arc.lock().expect("volume lock").save();
        if saved.is_err() {
            let _ = holder.destroy_volume(&path);
            continue;
        }

        tracing::info!(path = %path.display(), "Volume restored");
    }

    remove_stale_volumes(holder, &config)
}

/// Drop `<place>/volumes/<id>` directories no live volume owns.
fn remove_stale_volumes(holder: &VolumeHolder, config: &Config) -> SiloResult<()> {
    tracing::info!("Removing stale volumes");

    let volumes_dir = SiloPaths::with_place(&config.place).volumes();
    let live: HashSet<String> = holder.list_ids().into_iter().collect();

    for name in pathops::subdirectories(&volumes_dir)? {
        if live.contains(&name) {
            continue;
        }

        let dir = volumes_dir.join(&name);
        let mountpoint = dir.join("volume");
        if mountpoint.exists() {
            if let Err(err) = mounts::unmount_all(&mountpoint) {
                tracing::error!(mountpoint = %mountpoint.display(), %err, "Cannot umount volume");
            }
        }
        if let Err(err) = pathops::remove_all(&dir) {
            tracing::error!(dir = %dir.display(), %err, "Cannot remove directory");
        } else {
            tracing::debug!(dir = %dir.display(), "Removed stale volume directory");
        }
    }

    Ok(())
}

//! Volume backends: the seven strategies a volume can be built with.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;
use std::sync::OnceLock;

use silo_common::{SiloError, SiloResult};

use crate::config::Config;
use crate::filesystem::mounts::{self, MountFlags};
use crate::filesystem::pathops::{self, FsUsage};

use super::layer;
use super::loopdev;
use super::quota::ProjectQuota;
use super::volume::VolumeSpec;

/// The available storage strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Bind mount of the storage directory.
    Plain,
    /// tmpfs sized to the space limit.
    Tmpfs,
    /// Project quota on the volume path, no mount.
    Quota,
    /// Project quota on storage plus a bind mount.
    Native,
    /// overlayfs over read-only layers.
    Overlay,
    /// ext4 image on a loop device.
    Loop,
    /// ext4 on a mapped ceph rbd device.
    Rbd,
}

impl BackendKind {
    /// The wire name of the backend.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Plain => "plain",
            BackendKind::Tmpfs => "tmpfs",
            BackendKind::Quota => "quota",
            BackendKind::Native => "native",
            BackendKind::Overlay => "overlay",
            BackendKind::Loop => "loop",
            BackendKind::Rbd => "rbd",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = SiloError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(BackendKind::Plain),
            "tmpfs" => Ok(BackendKind::Tmpfs),
            "quota" => Ok(BackendKind::Quota),
            "native" => Ok(BackendKind::Native),
            "overlay" => Ok(BackendKind::Overlay),
            "loop" => Ok(BackendKind::Loop),
            "rbd" => Ok(BackendKind::Rbd),
            _ => Err(SiloError::InvalidValue {
                message: format!("unknown volume backend '{}'", s),
            }),
        }
    }
}

/// The operations every backend implements.
///
/// Backends are plain values; the enclosing volume's configuration is
/// handed in explicitly on every call. `destroy` must be idempotent
/// and safe on partially-built volumes.
pub trait VolumeBackend: Send {
    /// Which strategy this is.
    fn kind(&self) -> BackendKind;

    /// Post-property validation.
    fn configure(&self, _vol: &VolumeSpec) -> SiloResult<()> {
        Ok(())
    }

    /// Materialize the backend. The volume path, storage directory and
    /// internal work directory already exist.
    fn build(&mut self, vol: &VolumeSpec) -> SiloResult<()>;

    /// Empty the user-visible contents.
    fn clear(&self, vol: &VolumeSpec) -> SiloResult<()> {
        pathops::clear_directory(&vol.path)
    }

    /// Reverse `build`.
    fn destroy(&mut self, vol: &VolumeSpec) -> SiloResult<()>;

    /// Change the limits.
    fn resize(&mut self, _vol: &VolumeSpec, _space_limit: u64, _inode_limit: u64) -> SiloResult<()> {
        Err(SiloError::NotSupported {
            message: format!("{} backend does not support resize", self.kind()),
        })
    }

    /// Push backend-private state into the volume before persisting.
    fn save(&self, _vol: &mut VolumeSpec) -> SiloResult<()> {
        Ok(())
    }

    /// Reload backend-private state from a restored volume.
    fn restore(&mut self, _vol: &VolumeSpec) -> SiloResult<()> {
        Ok(())
    }

    /// Space and inode usage of the volume.
    fn stat_fs(&self, vol: &VolumeSpec) -> SiloResult<FsUsage> {
        pathops::statfs(&vol.path)
    }
}

/// Instantiate the backend for a strategy.
#[must_use]
pub fn open(kind: BackendKind) -> Box<dyn VolumeBackend> {
    match kind {
        BackendKind::Plain => Box::new(PlainBackend),
        BackendKind::Tmpfs => Box::new(TmpfsBackend),
        BackendKind::Quota => Box::new(QuotaBackend),
        BackendKind::Native => Box::new(NativeBackend),
        BackendKind::Overlay => Box::new(OverlayBackend),
        BackendKind::Loop => Box::new(LoopBackend::default()),
        BackendKind::Rbd => Box::new(RbdBackend::default()),
    }
}

/// Whether the native (quota + bind) backend can work here.
///
/// Probed once per process against the default place.
pub fn native_supported(config: &Config) -> bool {
    static PROBE: OnceLock<bool> = OnceLock::new();

    if !config.enable_quota {
        return false;
    }
    *PROBE.get_or_init(|| {
        let volumes = silo_common::SiloPaths::with_place(&config.place).volumes();
        let supported = ProjectQuota::supported(&volumes);
        tracing::info!(path = %volumes.display(), supported, "Project quota probe");
        supported
    })
}

/// Whether the kernel knows overlayfs. Probed once per process with a
/// sentinel mount that is expected to fail: EINVAL means the filesystem
/// type exists and rejected our empty options, ENODEV means no overlay.
pub fn overlay_supported() -> bool {
    static PROBE: OnceLock<bool> = OnceLock::new();

    *PROBE.get_or_init(|| {
        let supported = match mounts::mount(
            "none",
            std::path::Path::new("/"),
            "overlay",
            MountFlags::SILENT,
            "",
        ) {
            Ok(()) => {
                tracing::error!("Unexpected success when probing for overlayfs");
                false
            }
            Err(err) => match err.errno() {
                Some(libc::EINVAL) => true,
                Some(libc::ENODEV) => false,
                other => {
                    tracing::error!(errno = ?other, "Unexpected errno when probing for overlayfs");
                    false
                }
            },
        };
        tracing::info!(supported, "Overlayfs probe");
        supported
    })
}

/// Bind mount of the storage directory onto the volume path.
struct PlainBackend;

impl VolumeBackend for PlainBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Plain
    }

    fn configure(&self, vol: &VolumeSpec) -> SiloResult<()> {
        if vol.have_quota() {
            return Err(SiloError::NotSupported {
                message: "plain backend has no quota support".to_string(),
            });
        }
        Ok(())
    }

    fn build(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        let storage = vol.storage();

        pathops::chown(&storage, vol.owner_uid, vol.owner_gid)?;
        pathops::chmod(&storage, vol.perms)?;

        mounts::bind_remount(&vol.path, &storage, vol.mount_flags())
    }

    fn clear(&self, vol: &VolumeSpec) -> SiloResult<()> {
        pathops::clear_directory(&vol.storage())
    }

    fn destroy(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        mounts::unmount_all(&vol.path)
    }
}

/// tmpfs sized, owned and moded from the volume configuration.
struct TmpfsBackend;

impl TmpfsBackend {
    fn options(vol: &VolumeSpec, space_limit: u64) -> String {
        format!(
            "size={},uid={},gid={},mode=0{:o}",
            space_limit, vol.owner_uid, vol.owner_gid, vol.perms
        )
    }
}

impl VolumeBackend for TmpfsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tmpfs
    }

    fn configure(&self, vol: &VolumeSpec) -> SiloResult<()> {
        if !vol.have_quota() {
            return Err(SiloError::NotSupported {
                message: "tmpfs backend requires space_limit".to_string(),
            });
        }
        if !vol.is_auto_storage() {
            return Err(SiloError::NotSupported {
                message: "tmpfs backend does not support storage".to_string(),
            });
        }
        Ok(())
    }

    fn build(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        mounts::mount(
            &format!("silo:{}", vol.id),
            &vol.path,
            "tmpfs",
            vol.mount_flags(),
            &Self::options(vol, vol.space_limit),
        )
    }

    fn resize(&mut self, vol: &VolumeSpec, space_limit: u64, _inode_limit: u64) -> SiloResult<()> {
        mounts::remount(&vol.path, vol.mount_flags(), &Self::options(vol, space_limit))
    }

    fn destroy(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        mounts::unmount_all(&vol.path)
    }
}

/// Project quota pinned to the volume path itself; nothing is mounted.
struct QuotaBackend;

impl VolumeBackend for QuotaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Quota
    }

    fn configure(&self, vol: &VolumeSpec) -> SiloResult<()> {
        if vol.is_auto_path {
            return Err(SiloError::NotSupported {
                message: "quota backend requires a path".to_string(),
            });
        }
        if !vol.have_quota() {
            return Err(SiloError::NotSupported {
                message: "quota backend requires space_limit".to_string(),
            });
        }
        if vol.is_read_only {
            return Err(SiloError::NotSupported {
                message: "quota backend does not support read_only".to_string(),
            });
        }
        if !vol.is_auto_storage() {
            return Err(SiloError::NotSupported {
                message: "quota backend does not support storage".to_string(),
            });
        }
        if !vol.layers.is_empty() {
            return Err(SiloError::NotSupported {
                message: "quota backend does not support layers".to_string(),
            });
        }
        Ok(())
    }

    fn build(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        let (space, inodes) = vol.quota_limits();
        ProjectQuota::with_limits(&vol.path, space, inodes).create()
    }

    fn clear(&self, _vol: &VolumeSpec) -> SiloResult<()> {
        Err(SiloError::NotSupported {
            message: "quota backend cannot be cleared".to_string(),
        })
    }

    fn destroy(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        let quota = ProjectQuota::new(&vol.path);
        if quota.exists()? {
            quota.destroy()?;
        }
        Ok(())
    }

    fn resize(&mut self, vol: &VolumeSpec, space_limit: u64, inode_limit: u64) -> SiloResult<()> {
        ProjectQuota::with_limits(&vol.path, space_limit, inode_limit).resize()
    }

    fn stat_fs(&self, vol: &VolumeSpec) -> SiloResult<FsUsage> {
        ProjectQuota::new(&vol.path).stat_fs()
    }
}

/// Project quota on the storage directory plus a bind mount.
struct NativeBackend;

impl VolumeBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn configure(&self, vol: &VolumeSpec) -> SiloResult<()> {
        if !vol.config.enable_quota && vol.have_quota() {
            return Err(SiloError::NotSupported {
                message: "project quota is disabled".to_string(),
            });
        }
        Ok(())
    }

    fn build(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        let storage = vol.storage();

        if vol.have_quota() {
            let (space, inodes) = vol.quota_limits();
            ProjectQuota::with_limits(&storage, space, inodes).create()?;
        }

        pathops::chown(&storage, vol.owner_uid, vol.owner_gid)?;
        pathops::chmod(&storage, vol.perms)?;

        mounts::bind_remount(&vol.path, &storage, vol.mount_flags())
    }

    fn clear(&self, vol: &VolumeSpec) -> SiloResult<()> {
        pathops::clear_directory(&vol.storage())
    }

    fn destroy(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        let result = mounts::unmount_all(&vol.path);
        if let Err(err) = &result {
            tracing::error!(path = %vol.path.display(), %err, "Cannot umount volume");
        }

        if vol.have_quota() {
            let quota = ProjectQuota::new(vol.storage());
            if quota.exists().unwrap_or(false) {
                if let Err(err) = quota.destroy() {
                    tracing::error!(%err, "Cannot destroy quota");
                    if result.is_ok() {
                        return Err(err);
                    }
                }
            }
        }

        result
    }

    fn resize(&mut self, vol: &VolumeSpec, space_limit: u64, inode_limit: u64) -> SiloResult<()> {
        let quota = ProjectQuota::with_limits(vol.storage(), space_limit, inode_limit);
        if !vol.have_quota() {
            return quota.create();
        }
        quota.resize()
    }

    fn stat_fs(&self, vol: &VolumeSpec) -> SiloResult<FsUsage> {
        if vol.have_quota() {
            return ProjectQuota::new(vol.storage()).stat_fs();
        }
        pathops::statfs(&vol.path)
    }
}

/// ext4 image under storage, mounted through a loop device.
#[derive(Default)]
struct LoopBackend {
    device: Option<i32>,
}

impl LoopBackend {
    fn image(vol: &VolumeSpec) -> PathBuf {
        vol.storage().join("loop.img")
    }
}

impl VolumeBackend for LoopBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Loop
    }

    fn build(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        if vol.space_limit == 0 {
            return Err(SiloError::InvalidValue {
                message: "loop backend requires space_limit".to_string(),
            });
        }

        let image = Self::image(vol);
        if image.exists() {
            let current = std::fs::metadata(&image)?.len();
            if current != vol.space_limit {
                return Err(SiloError::NotSupported {
                    message: format!(
                        "cannot resize existing image from {} to {} bytes",
                        current, vol.space_limit
                    ),
                });
            }
        } else {
            loopdev::make_image(
                &image,
                vol.owner_uid,
                vol.owner_gid,
                vol.space_limit,
                vol.space_guarantee,
            )?;
        }

        let index = loopdev::attach(&image)?;

        let result = (|| {
            mounts::mount(
                &loopdev::device_path(index).display().to_string(),
                &vol.path,
                "ext4",
                vol.mount_flags(),
                "",
            )?;

            if !vol.is_read_only {
                let chowned = pathops::chown(&vol.path, vol.owner_uid, vol.owner_gid)
                    .and_then(|()| pathops::chmod(&vol.path, vol.perms));
                if let Err(err) = chowned {
                    let _ = mounts::unmount_all(&vol.path);
                    return Err(err);
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.device = Some(index);
                Ok(())
            }
            Err(err) => {
                let _ = loopdev::release(index);
                Err(err)
            }
        }
    }

    fn destroy(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        let Some(index) = self.device.take() else {
            return Ok(());
        };

        tracing::debug!(index, path = %vol.path.display(), "Destroying loop volume");
        let unmounted = mounts::unmount_all(&vol.path);
        let released = loopdev::release(index);
        unmounted.and(released)
    }

    fn save(&self, vol: &mut VolumeSpec) -> SiloResult<()> {
        vol.loop_dev = self.device.unwrap_or(-1);
        Ok(())
    }

    fn restore(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        self.device = (vol.loop_dev >= 0).then_some(vol.loop_dev);
        Ok(())
    }
}

/// overlayfs assembled from staged read-only layers.
struct OverlayBackend;

impl VolumeBackend for OverlayBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Overlay
    }

    fn configure(&self, vol: &VolumeSpec) -> SiloResult<()> {
        if !overlay_supported() {
            return Err(SiloError::NotSupported {
                message: "overlayfs is not supported by this kernel".to_string(),
            });
        }
        if !vol.config.enable_quota && vol.have_quota() {
            return Err(SiloError::NotSupported {
                message: "project quota is disabled".to_string(),
            });
        }
        Ok(())
    }

    fn build(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        let storage = vol.storage();
        let upper = storage.join("upper");
        let work = storage.join("work");

        if vol.have_quota() {
            let (space, inodes) = vol.quota_limits();
            ProjectQuota::with_limits(&storage, space, inodes).create()?;
        }

        let mut staged: Vec<PathBuf> = Vec::new();
        let result = (|| {
            let mut lower = String::new();

            for (idx, name) in vol.layers.iter().enumerate() {
                let source = vol.resolve_layer(name)?;
                let stage_dir = vol.internal(&format!("layer_{}", idx));

                layer::stage(&stage_dir, &source)?;
                staged.push(stage_dir.clone());

                if idx > 0 {
                    lower.push(':');
                }
                lower.push_str(&stage_dir.display().to_string().replace(':', "\\:"));
            }

            if !upper.exists() {
                pathops::create_dir(&upper, 0o755)?;
            }
            pathops::chown(&upper, vol.owner_uid, vol.owner_gid)?;
            pathops::chmod(&upper, vol.perms)?;

            if !work.exists() {
                pathops::create_dir(&work, 0o755)?;
            } else {
                pathops::clear_directory(&work)?;
            }

            mounts::mount(
                "overlay",
                &vol.path,
                "overlay",
                vol.mount_flags(),
                &format!(
                    "lowerdir={},upperdir={},workdir={}",
                    lower,
                    upper.display(),
                    work.display()
                ),
            )
        })();

        // Stages are gone by the end of build no matter what happened;
        // the overlay holds its own references to the layer trees.
        for stage_dir in &staged {
            layer::unstage(stage_dir);
        }

        if result.is_err() && vol.have_quota() {
            let _ = ProjectQuota::new(&storage).destroy();
        }

        result
    }

    fn clear(&self, vol: &VolumeSpec) -> SiloResult<()> {
        pathops::clear_directory(&vol.storage().join("upper"))
    }

    fn destroy(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        let storage = vol.storage();
        let mut first_err = None;

        if let Err(err) = mounts::unmount_all(&vol.path) {
            tracing::error!(path = %vol.path.display(), %err, "Cannot umount overlay");
            first_err = Some(err);
        }

        if vol.is_auto_storage() && storage.exists() {
            if let Err(err) = pathops::clear_directory(&storage) {
                tracing::error!(%err, "Cannot clear overlay storage");
                let _ = pathops::remove_all(&storage.join("upper"));
                first_err = first_err.or(Some(err));
            }
        }

        let work = storage.join("work");
        if work.exists() {
            let _ = pathops::remove_all(&work);
        }

        if vol.have_quota() {
            let quota = ProjectQuota::new(&storage);
            if quota.exists().unwrap_or(false) {
                if let Err(err) = quota.destroy() {
                    tracing::error!(%err, "Cannot destroy quota");
                    first_err = first_err.or(Some(err));
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn resize(&mut self, vol: &VolumeSpec, space_limit: u64, inode_limit: u64) -> SiloResult<()> {
        let quota = ProjectQuota::with_limits(vol.storage(), space_limit, inode_limit);
        if !vol.have_quota() {
            return quota.create();
        }
        quota.resize()
    }

    fn stat_fs(&self, vol: &VolumeSpec) -> SiloResult<FsUsage> {
        if vol.have_quota() {
            return ProjectQuota::new(vol.storage()).stat_fs();
        }
        pathops::statfs(&vol.path)
    }
}

/// ext4 on a ceph rbd device named by `<id>@<pool>/<image>`.
#[derive(Default)]
struct RbdBackend {
    device: Option<i32>,
}

impl RbdBackend {
    fn parse_storage(vol: &VolumeSpec) -> SiloResult<(String, String, String)> {
        let spec = vol
            .storage_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let bad = || SiloError::InvalidValue {
            message: format!("invalid rbd storage '{}'", spec),
        };

        let (client, rest) = spec.split_once('@').ok_or_else(bad)?;
        let (pool, image) = rest.split_once('/').ok_or_else(bad)?;
        if client.is_empty() || pool.is_empty() || image.is_empty() {
            return Err(bad());
        }

        Ok((client.to_string(), pool.to_string(), image.to_string()))
    }

    fn unmap(device: &str) -> SiloResult<()> {
        tracing::debug!(device, "Unmapping rbd device");
        pathops::run_command(Command::new("rbd").arg("unmap").arg(device))
    }
}

impl VolumeBackend for RbdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Rbd
    }

    fn configure(&self, vol: &VolumeSpec) -> SiloResult<()> {
        Self::parse_storage(vol).map(|_| ())
    }

    fn build(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        let (client, pool, image) = Self::parse_storage(vol)?;

        tracing::debug!(client, pool, image, "Mapping rbd device");
        let device = pathops::run_command_output(
            Command::new("rbd")
                .arg(format!("--id={}", client))
                .arg(format!("--pool={}", pool))
                .arg("map")
                .arg(&image),
        )?;

        let index: i32 = match device.strip_prefix("/dev/rbd").and_then(|s| s.parse().ok()) {
            Some(index) => index,
            None => {
                let _ = Self::unmap(&device);
                return Err(SiloError::InvalidValue {
                    message: format!("not an rbd device: {}", device),
                });
            }
        };

        if let Err(err) = mounts::mount(&device, &vol.path, "ext4", vol.mount_flags(), "") {
            let _ = Self::unmap(&device);
            return Err(err);
        }

        self.device = Some(index);
        Ok(())
    }

    fn destroy(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        let Some(index) = self.device.take() else {
            return Ok(());
        };

        let device = format!("/dev/rbd{}", index);
        let unmounted = mounts::unmount_all(&vol.path);
        let unmapped = Self::unmap(&device);
        unmounted.and(unmapped)
    }

    fn save(&self, vol: &mut VolumeSpec) -> SiloResult<()> {
        vol.loop_dev = self.device.unwrap_or(-1);
        Ok(())
    }

    fn restore(&mut self, vol: &VolumeSpec) -> SiloResult<()> {
        self.device = (vol.loop_dev >= 0).then_some(vol.loop_dev);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        for kind in [
            BackendKind::Plain,
            BackendKind::Tmpfs,
            BackendKind::Quota,
            BackendKind::Native,
            BackendKind::Overlay,
            BackendKind::Loop,
            BackendKind::Rbd,
        ] {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("zfs".parse::<BackendKind>().is_err());
    }

    #[test]
    fn open_matches_kind() {
        assert_eq!(open(BackendKind::Overlay).kind(), BackendKind::Overlay);
        assert_eq!(open(BackendKind::Loop).kind(), BackendKind::Loop);
    }
}

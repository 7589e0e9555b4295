//! Project quota primitives.
//!
//! A project quota pins a byte/inode budget to an inode tree. The
//! project id is derived deterministically from the storage path, the
//! id is stamped on the tree with `FS_IOC_FSSETXATTR` (directories get
//! the inherit flag so new entries stay in the project), and the limits
//! are pushed with `quotactl(2)`.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use silo_common::{SiloError, SiloResult};

use crate::filesystem::mounts::MountTable;
use crate::filesystem::pathops::{self, FsUsage};

const PRJQUOTA: i32 = 2;
const Q_GETQUOTA: i32 = 0x80_0007;
const Q_SETQUOTA: i32 = 0x80_0008;

const QIF_BLIMITS: u32 = 1;
const QIF_ILIMITS: u32 = 4;
const QIF_LIMITS: u32 = QIF_BLIMITS | QIF_ILIMITS;

/// Block limits in `if_dqblk` are counted in units of this many bytes.
const QUOTA_BLOCK_SIZE: u64 = 1024;

const FS_IOC_FSGETXATTR: libc::c_ulong = 0x801c_5831;
const FS_IOC_FSSETXATTR: libc::c_ulong = 0x401c_5832;
const FS_XFLAG_PROJINHERIT: u32 = 0x0000_0200;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FsXAttr {
    fsx_xflags: u32,
    fsx_extsize: u32,
    fsx_nextents: u32,
    fsx_projid: u32,
    fsx_cowextsize: u32,
    fsx_pad: [u8; 8],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct IfDqblk {
    dqb_bhardlimit: u64,
    dqb_bsoftlimit: u64,
    dqb_curspace: u64,
    dqb_ihardlimit: u64,
    dqb_isoftlimit: u64,
    dqb_curinodes: u64,
    dqb_btime: u64,
    dqb_itime: u64,
    dqb_valid: u32,
}

const fn qcmd(cmd: i32, quota_type: i32) -> i32 {
    (cmd << 8) | (quota_type & 0xff)
}

/// A project quota attached to one directory tree.
#[derive(Debug, Clone)]
pub struct ProjectQuota {
    /// Root of the quota-controlled tree.
    pub path: PathBuf,
    /// Byte limit; 0 means unlimited.
    pub space_limit: u64,
    /// Inode limit; 0 means unlimited.
    pub inode_limit: u64,
}

impl ProjectQuota {
    /// A quota handle without limits (for queries and teardown).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            space_limit: 0,
            inode_limit: 0,
        }
    }

    /// A quota handle carrying the limits to apply.
    #[must_use]
    pub fn with_limits(path: impl Into<PathBuf>, space_limit: u64, inode_limit: u64) -> Self {
        Self {
            path: path.into(),
            space_limit,
            inode_limit,
        }
    }

    /// The project id for this path.
    ///
    /// Derived from the path bytes (FNV-1a, clamped to 31 bits, never
    /// zero) so that repeated daemon runs agree without extra state.
    #[must_use]
    pub fn project_id(&self) -> u32 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in self.path.as_os_str().as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let id = (hash as u32) & 0x7fff_ffff;
        if id == 0 {
            1
        } else {
            id
        }
    }

    /// Whether the filesystem under `path` takes project quotas.
    #[must_use]
    pub fn supported(path: &Path) -> bool {
        let probe = Self::new(path);

        let device = match probe.device() {
            Ok(device) => device,
            Err(_) => return false,
        };
        if probe.read_attr().is_err() {
            return false;
        }

        let mut dq = IfDqblk::default();
        // Safety: quotactl(2) with an owned device path and an out struct.
        let rc = unsafe {
            libc::quotactl(
                qcmd(Q_GETQUOTA, PRJQUOTA),
                device.as_ptr(),
                0,
                std::ptr::addr_of_mut!(dq).cast(),
            )
        };
        if rc == 0 {
            return true;
        }
        matches!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::ENOENT) | Some(libc::ESRCH)
        )
    }

    /// Whether the tree already carries our project id.
    pub fn exists(&self) -> SiloResult<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        Ok(self.read_attr()?.fsx_projid == self.project_id())
    }

    /// Stamp the tree with the project id and push the limits.
    pub fn create(&self) -> SiloResult<()> {
        tracing::debug!(
            path = %self.path.display(),
            project = self.project_id(),
            space_limit = self.space_limit,
            inode_limit = self.inode_limit,
            "Creating project quota"
        );

        self.apply_project_id(self.project_id())?;
        self.set_limits(self.space_limit, self.inode_limit)
    }

    /// Adjust the limits of an existing project.
    pub fn resize(&self) -> SiloResult<()> {
        tracing::debug!(
            path = %self.path.display(),
            project = self.project_id(),
            space_limit = self.space_limit,
            inode_limit = self.inode_limit,
            "Resizing project quota"
        );

        self.set_limits(self.space_limit, self.inode_limit)
    }

    /// Drop the limits and detach the tree from the project.
    pub fn destroy(&self) -> SiloResult<()> {
        tracing::debug!(
            path = %self.path.display(),
            project = self.project_id(),
            "Destroying project quota"
        );

        self.set_limits(0, 0)?;
        if self.path.exists() {
            self.apply_project_id(0)?;
        }
        Ok(())
    }

    /// Usage and availability of the project.
    pub fn stat_fs(&self) -> SiloResult<FsUsage> {
        let dq = self.query()?;

        let space_used = dq.dqb_curspace;
        let inode_used = dq.dqb_curinodes;

        let fs = pathops::statfs(&self.path)?;
        let space_avail = if dq.dqb_bhardlimit > 0 {
            (dq.dqb_bhardlimit * QUOTA_BLOCK_SIZE)
                .saturating_sub(space_used)
                .min(fs.space_avail)
        } else {
            fs.space_avail
        };
        let inode_avail = if dq.dqb_ihardlimit > 0 {
            dq.dqb_ihardlimit
                .saturating_sub(inode_used)
                .min(fs.inode_avail)
        } else {
            fs.inode_avail
        };

        Ok(FsUsage {
            space_used,
            space_avail,
            inode_used,
            inode_avail,
        })
    }

    /// The block device backing the quota tree.
    fn device(&self) -> SiloResult<CString> {
        let table = MountTable::snapshot()?;

        let mut best: Option<&crate::filesystem::mounts::MountEntry> = None;
        for entry in table.entries() {
            if !pathops::is_inside(&entry.mountpoint, &self.path) {
                continue;
            }
            let deeper = best.map_or(true, |b| {
                entry.mountpoint.components().count() > b.mountpoint.components().count()
            });
            if deeper {
                best = Some(entry);
            }
        }

        let entry = best.ok_or_else(|| SiloError::NotSupported {
            message: format!("no mount found for {}", self.path.display()),
        })?;
        if !entry.source.starts_with("/dev/") {
            return Err(SiloError::NotSupported {
                message: format!("{} is not backed by a block device", self.path.display()),
            });
        }

        CString::new(entry.source.as_bytes()).map_err(|_| SiloError::InvalidValue {
            message: format!("bad device path {}", entry.source),
        })
    }

    fn read_attr(&self) -> SiloResult<FsXAttr> {
        let file = std::fs::File::open(&self.path)?;
        let mut attr = FsXAttr::default();

        // Safety: ioctl(2) on an open fd with an out struct.
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                FS_IOC_FSGETXATTR,
                std::ptr::addr_of_mut!(attr),
            )
        };
        if rc != 0 {
            return Err(SiloError::Io(std::io::Error::last_os_error()));
        }
        Ok(attr)
    }

    fn write_attr(path: &Path, mut attr: FsXAttr) -> SiloResult<()> {
        let file = std::fs::File::open(path)?;

        // Safety: ioctl(2) on an open fd with an in struct.
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                FS_IOC_FSSETXATTR,
                std::ptr::addr_of_mut!(attr),
            )
        };
        if rc != 0 {
            return Err(SiloError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Stamp `projid` on the whole tree; directories inherit.
    fn apply_project_id(&self, projid: u32) -> SiloResult<()> {
        for entry in walkdir::WalkDir::new(&self.path).follow_links(false) {
            let entry = entry.map_err(|e| SiloError::Unknown {
                message: format!("walk {}: {}", self.path.display(), e),
            })?;
            let file_type = entry.file_type();
            if !file_type.is_dir() && !file_type.is_file() {
                continue;
            }

            let probe = Self::new(entry.path());
            let mut attr = probe.read_attr()?;
            attr.fsx_projid = projid;
            if file_type.is_dir() {
                if projid == 0 {
                    attr.fsx_xflags &= !FS_XFLAG_PROJINHERIT;
                } else {
                    attr.fsx_xflags |= FS_XFLAG_PROJINHERIT;
                }
            }
            Self::write_attr(entry.path(), attr)?;
        }
        Ok(())
    }

    fn set_limits(&self, space_limit: u64, inode_limit: u64) -> SiloResult<()> {
        let device = self.device()?;

        let mut dq = IfDqblk {
            dqb_bhardlimit: space_limit.div_ceil(QUOTA_BLOCK_SIZE),
            dqb_bsoftlimit: space_limit.div_ceil(QUOTA_BLOCK_SIZE),
            dqb_ihardlimit: inode_limit,
            dqb_isoftlimit: inode_limit,
            dqb_valid: QIF_LIMITS,
            ..IfDqblk::default()
        };

        // Safety: quotactl(2) with an owned device path and an in struct.
        let rc = unsafe {
            libc::quotactl(
                qcmd(Q_SETQUOTA, PRJQUOTA),
                device.as_ptr(),
                self.project_id() as i32,
                std::ptr::addr_of_mut!(dq).cast(),
            )
        };
        if rc != 0 {
            return Err(SiloError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn query(&self) -> SiloResult<IfDqblk> {
        let device = self.device()?;
        let mut dq = IfDqblk::default();

        // Safety: quotactl(2) with an owned device path and an out struct.
        let rc = unsafe {
            libc::quotactl(
                qcmd(Q_GETQUOTA, PRJQUOTA),
                device.as_ptr(),
                self.project_id() as i32,
                std::ptr::addr_of_mut!(dq).cast(),
            )
        };
        if rc != 0 {
            return Err(SiloError::Io(std::io::Error::last_os_error()));
        }
        Ok(dq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_ids_are_stable_and_nonzero() {
        let a = ProjectQuota::new("/place/volumes/12/native");
        let b = ProjectQuota::new("/place/volumes/12/native");
        let c = ProjectQuota::new("/place/volumes/13/native");

        assert_eq!(a.project_id(), b.project_id());
        assert_ne!(a.project_id(), c.project_id());
        assert_ne!(a.project_id(), 0);
        assert!(a.project_id() <= 0x7fff_ffff);
    }

    #[test]
    fn qcmd_packs_type() {
        assert_eq!(qcmd(Q_GETQUOTA, PRJQUOTA), 0x8000_0702u32 as i32);
    }

    #[test]
    fn unsupported_on_tmpdir_or_probe_runs() {
        // Most CI filesystems lack project quota; the probe must not
        // panic either way.
        let dir = tempfile::tempdir().unwrap();
        let _ = ProjectQuota::supported(dir.path());
    }
}

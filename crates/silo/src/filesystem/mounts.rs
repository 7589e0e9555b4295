//! Mount operations and the kernel mount table.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use silo_common::SiloResult;

pub use rustix::mount::{MountFlags, UnmountFlags};

/// One line of the kernel's mount listing.
///
/// Two entries compare equal iff source, mountpoint, filesystem type and
/// flag set all match; the flag set is unordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mount source (device, fs name, or "none").
    pub source: String,
    /// Where the mount lives.
    pub mountpoint: PathBuf,
    /// Filesystem type.
    pub fstype: String,
    /// Mount options, unordered.
    pub flags: BTreeSet<String>,
}

impl MountEntry {
    /// Build an entry from parts.
    pub fn new<S, F>(source: S, mountpoint: impl Into<PathBuf>, fstype: S, flags: F) -> Self
    where
        S: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        Self {
            source: source.into(),
            mountpoint: mountpoint.into(),
            fstype: fstype.into(),
            flags: flags.into_iter().map(Into::into).collect(),
        }
    }

    fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let source = unescape_octal(fields.next()?);
        let mountpoint = unescape_octal(fields.next()?);
        let fstype = fields.next()?.to_string();
        let options = fields.next()?;

        Some(Self {
            source,
            mountpoint: PathBuf::from(mountpoint),
            fstype,
            flags: options.split(',').map(str::to_string).collect(),
        })
    }
}

/// Octal escapes used by the kernel for whitespace in mount fields.
fn unescape_octal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 {
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }

    out
}

/// Snapshot of the kernel's active mounts.
///
/// No caching: retake the snapshot whenever mount state may have changed.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Read the current mount table from the kernel.
    pub fn snapshot() -> SiloResult<Self> {
        let text = std::fs::read_to_string("/proc/self/mounts")?;
        Ok(Self::parse(&text))
    }

    /// Parse a mount listing in `/proc/self/mounts` format.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self {
            entries: text.lines().filter_map(MountEntry::parse_line).collect(),
        }
    }

    /// All entries, in listing order.
    #[must_use]
    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Whether an equal entry is present.
    #[must_use]
    pub fn contains(&self, entry: &MountEntry) -> bool {
        self.entries.iter().any(|e| e == entry)
    }

    /// Whether anything is mounted exactly at `path`.
    #[must_use]
    pub fn has_mountpoint(&self, path: &Path) -> bool {
        self.entries.iter().any(|e| e.mountpoint == path)
    }

    /// Mounts at or below `path`, deepest first.
    #[must_use]
    pub fn mounts_under(&self, path: &Path) -> Vec<&MountEntry> {
        let mut found: Vec<&MountEntry> = self
            .entries
            .iter()
            .filter(|e| e.mountpoint == path || e.mountpoint.starts_with(path))
            .collect();
        found.sort_by_key(|e| std::cmp::Reverse(e.mountpoint.components().count()));
        found
    }
}

/// Mount a filesystem.
pub fn mount(
    source: &str,
    target: &Path,
    fstype: &str,
    flags: MountFlags,
    data: &str,
) -> SiloResult<()> {
    tracing::debug!(
        source,
        target = %target.display(),
        fstype,
        ?flags,
        data,
        "Mounting filesystem"
    );

    rustix::mount::mount(source, target, fstype, flags, data)
        .map_err(|e| silo_common::SiloError::Io(e.into()))?;

    Ok(())
}

/// Change the flags (and options) of an existing mount.
pub fn remount(target: &Path, flags: MountFlags, data: &str) -> SiloResult<()> {
    tracing::debug!(target = %target.display(), ?flags, data, "Remounting");

    rustix::mount::mount_remount(target, flags, data)
        .map_err(|e| silo_common::SiloError::Io(e.into()))?;

    Ok(())
}

/// Bind mount `source` onto `target`.
pub fn bind_mount(source: &Path, target: &Path) -> SiloResult<()> {
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        "Creating bind mount"
    );

    rustix::mount::mount_bind(source, target).map_err(|e| silo_common::SiloError::Io(e.into()))?;

    Ok(())
}

/// Bind mount `source` onto `target`, then apply `flags` to the bind.
///
/// The two-step dance is required: the kernel ignores flags on the
/// initial bind, they only stick on a `MS_REMOUNT | MS_BIND` pass.
pub fn bind_remount(target: &Path, source: &Path, flags: MountFlags) -> SiloResult<()> {
    bind_mount(source, target)?;
    remount(target, MountFlags::BIND | flags, "")
}

/// Make a mount point private (no propagation).
pub fn make_private(target: &Path) -> SiloResult<()> {
    use rustix::mount::{mount_change, MountPropagationFlags};

    mount_change(target, MountPropagationFlags::PRIVATE)
        .map_err(|e| silo_common::SiloError::Io(e.into()))?;

    Ok(())
}

/// Unmount a single mount point.
pub fn unmount(target: &Path, flags: UnmountFlags) -> SiloResult<()> {
    tracing::debug!(target = %target.display(), ?flags, "Unmounting");

    rustix::mount::unmount(target, flags).map_err(|e| silo_common::SiloError::Io(e.into()))?;

    Ok(())
}

/// Detach every mount at or below `target`.
///
/// Stacked mounts reappear in the table once the top one is gone, so the
/// snapshot is retaken until nothing under `target` remains.
pub fn unmount_all(target: &Path) -> SiloResult<()> {
    for _ in 0..32 {
        let table = MountTable::snapshot()?;
        let found = table.mounts_under(target);
        if found.is_empty() {
            return Ok(());
        }
        for entry in found {
            unmount(&entry.mountpoint, UnmountFlags::DETACH)?;
        }
    }

    Err(silo_common::SiloError::Busy {
        message: format!("mounts keep reappearing under {}", target.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
cgroup /sys/fs/cgroup/memory cgroup rw,nosuid,nodev,noexec,relatime,memory 0 0
cgroup /sys/fs/cgroup/cpu,cpuacct cgroup rw,cpu,cpuacct 0 0
/dev/sda1 /srv/with\\040space ext4 rw,relatime 0 0
";

    #[test]
    fn parse_listing() {
        let table = MountTable::parse(LISTING);
        assert_eq!(table.entries().len(), 4);
        assert!(table.has_mountpoint(Path::new("/sys/fs/cgroup/memory")));
        assert!(table.has_mountpoint(Path::new("/srv/with space")));
    }

    #[test]
    fn entry_equality_ignores_flag_order() {
        let a = MountEntry::new("cgroup", "/sys/fs/cgroup/cpu,cpuacct", "cgroup", ["cpu", "cpuacct", "rw"]);
        let b = MountEntry::new("cgroup", "/sys/fs/cgroup/cpu,cpuacct", "cgroup", ["rw", "cpuacct", "cpu"]);
        assert_eq!(a, b);

        let table = MountTable::parse(LISTING);
        assert!(table.contains(&a));
    }

    #[test]
    fn entry_inequality() {
        let a = MountEntry::new("cgroup", "/sys/fs/cgroup/memory", "cgroup", ["memory"]);
        let b = MountEntry::new("cgroup", "/sys/fs/cgroup/memory", "tmpfs", ["memory"]);
        assert_ne!(a, b);
    }

    #[test]
    fn mounts_under_orders_deepest_first() {
        let listing = "\
tmpfs /mnt/vol tmpfs rw 0 0
tmpfs /mnt/vol/nested tmpfs rw 0 0
tmpfs /mnt/volume tmpfs rw 0 0
";
        let table = MountTable::parse(listing);
        let under = table.mounts_under(Path::new("/mnt/vol"));
        assert_eq!(under.len(), 2);
        assert_eq!(under[0].mountpoint, PathBuf::from("/mnt/vol/nested"));
        assert_eq!(under[1].mountpoint, PathBuf::from("/mnt/vol"));
    }
}

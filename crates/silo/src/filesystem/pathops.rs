//! Filesystem primitives shared by the cgroup and volume managers.

use std::ffi::CString;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use silo_common::{Cred, SiloError, SiloResult};

/// Space and inode usage of a filesystem or quota project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsUsage {
    /// Bytes in use.
    pub space_used: u64,
    /// Bytes still available.
    pub space_avail: u64,
    /// Inodes in use.
    pub inode_used: u64,
    /// Inodes still available.
    pub inode_avail: u64,
}

/// Usage and availability of the filesystem holding `path`.
pub fn statfs(path: &Path) -> SiloResult<FsUsage> {
    let st = rustix::fs::statvfs(path).map_err(|e| SiloError::Io(e.into()))?;

    Ok(FsUsage {
        space_used: (st.f_blocks - st.f_bfree) * st.f_frsize,
        space_avail: st.f_bavail * st.f_frsize,
        inode_used: st.f_files - st.f_ffree,
        inode_avail: st.f_favail,
    })
}

/// Device id of the filesystem holding `path`.
pub fn device_id(path: &Path) -> SiloResult<u64> {
    Ok(std::fs::metadata(path)?.dev())
}

/// Create one directory with the given mode.
pub fn create_dir(path: &Path, mode: u32) -> SiloResult<()> {
    std::fs::DirBuilder::new().mode(mode).create(path)?;
    Ok(())
}

/// Create a directory and any missing parents, all with the given mode.
pub fn create_dir_all(path: &Path, mode: u32) -> SiloResult<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)?;
    Ok(())
}

/// Remove a file or a directory tree, tolerating absence.
pub fn remove_all(path: &Path) -> SiloResult<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if meta.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Empty a directory without removing the directory itself.
pub fn clear_directory(path: &Path) -> SiloResult<()> {
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        remove_all(&entry.path())?;
    }
    Ok(())
}

/// Change the owner of a path.
pub fn chown(path: &Path, uid: u32, gid: u32) -> SiloResult<()> {
    std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
    Ok(())
}

/// Change the mode of a path.
pub fn chmod(path: &Path, mode: u32) -> SiloResult<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Set an extended attribute on a path.
pub fn set_xattr(path: &Path, name: &str, value: &str) -> SiloResult<()> {
    let c_path = cstring(path)?;
    let c_name = CString::new(name).map_err(|_| SiloError::InvalidValue {
        message: format!("bad xattr name '{}'", name),
    })?;

    // Safety: plain setxattr(2) with owned, NUL-terminated buffers.
    let rc = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if rc != 0 {
        return Err(SiloError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Create an overlayfs whiteout: a 0:0 character device node.
pub fn mknod_whiteout(path: &Path) -> SiloResult<()> {
    let c_path = cstring(path)?;

    // Safety: mknod(2) with an owned, NUL-terminated path.
    let rc = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFCHR, 0) };
    if rc != 0 {
        return Err(SiloError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Whether `cred` may write to `path`, judged by owner/group/other bits.
pub fn writable_by(path: &Path, cred: &Cred) -> SiloResult<bool> {
    if cred.is_root() {
        return Ok(true);
    }

    let meta = std::fs::metadata(path)?;
    let mode = meta.mode();

    if meta.uid() == cred.uid {
        return Ok(mode & 0o200 != 0);
    }
    if cred.is_member_of(meta.gid()) {
        return Ok(mode & 0o020 != 0);
    }
    Ok(mode & 0o002 != 0)
}

/// Whether a path is absolute and free of `.` / `..` components.
#[must_use]
pub fn is_normalized(path: &Path) -> bool {
    path.components()
        .all(|c| !matches!(c, Component::CurDir | Component::ParentDir))
}

/// Rebase an absolute path under `root` ("/a" under "/chroot" is "/chroot/a").
#[must_use]
pub fn rebase(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(rel) => root.join(rel),
        Err(_) => root.join(path),
    }
}

/// Whether `path` lives at or below `root`.
#[must_use]
pub fn is_inside(root: &Path, path: &Path) -> bool {
    path == root || path.starts_with(root)
}

/// Copy the contents of one directory into another, preserving
/// ownership, modes, timestamps and special files.
pub fn copy_tree(src: &Path, dst: &Path) -> SiloResult<()> {
    let mut from = src.as_os_str().to_os_string();
    from.push("/.");
    run_command(
        Command::new("cp")
            .arg("-a")
            .arg("--one-file-system")
            .arg(from)
            .arg(dst),
    )
}

/// Run an external command, folding a non-zero exit into an error.
pub fn run_command(command: &mut Command) -> SiloResult<()> {
    tracing::debug!(?command, "Running command");

    let output = command.output()?;
    if output.status.success() {
        return Ok(());
    }

    Err(SiloError::Unknown {
        message: format!(
            "{:?} failed: {} {}",
            command.get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    })
}

/// Run an external command and return its trimmed stdout.
pub fn run_command_output(command: &mut Command) -> SiloResult<String> {
    tracing::debug!(?command, "Running command");

    let output = command.output()?;
    if !output.status.success() {
        return Err(SiloError::Unknown {
            message: format!(
                "{:?} failed: {} {}",
                command.get_program(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Names of the immediate subdirectories of `path`.
pub fn subdirectories(path: &Path) -> SiloResult<Vec<String>> {
    let mut names = Vec::new();

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
    }

    Ok(names)
}

fn cstring(path: &Path) -> SiloResult<CString> {
    use std::os::unix::ffi::OsStrExt;

    CString::new(path.as_os_str().as_bytes()).map_err(|_| SiloError::InvalidValue {
        message: format!("path contains NUL: {}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_paths() {
        assert!(is_normalized(Path::new("/srv/volumes/1")));
        assert!(!is_normalized(Path::new("/srv/../etc")));
        assert!(!is_normalized(Path::new("/srv/./x")));
    }

    #[test]
    fn rebase_under_root() {
        assert_eq!(
            rebase(Path::new("/chroot"), Path::new("/data")),
            PathBuf::from("/chroot/data")
        );
        assert!(is_inside(Path::new("/chroot"), Path::new("/chroot/data")));
        assert!(!is_inside(Path::new("/chroot"), Path::new("/chrootx/data")));
    }

    #[test]
    fn clear_directory_keeps_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), b"y").unwrap();

        clear_directory(dir.path()).unwrap();
        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn remove_all_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        remove_all(&dir.path().join("missing")).unwrap();
    }

    #[test]
    fn writable_by_owner_bits() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        chmod(&file, 0o600).unwrap();

        let me = Cred::new(
            // Safety: geteuid/getegid never fail.
            unsafe { libc::geteuid() },
            unsafe { libc::getegid() },
        );
        if me.is_root() {
            return;
        }
        assert!(writable_by(&file, &me).unwrap());

        chmod(&file, 0o400).unwrap();
        assert!(!writable_by(&file, &me).unwrap());
    }
}

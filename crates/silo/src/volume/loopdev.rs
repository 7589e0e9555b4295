//! Loop devices and ext4 image files.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

use rustix::fs::FallocateFlags;
use silo_common::{SiloError, SiloResult};

use crate::filesystem::pathops;

/// `/dev/loopN` for a device index.
#[must_use]
pub fn device_path(index: i32) -> PathBuf {
    PathBuf::from(format!("/dev/loop{}", index))
}

/// Create and format an ext4 image file.
///
/// The file is sized with `ftruncate` so it stays sparse; a guarantee
/// is backed by a real `fallocate` reservation, and running out of
/// space for that reservation is a resource error, not an I/O error.
/// On any failure the newly-created image is removed again.
pub fn make_image(image: &Path, uid: u32, gid: u32, size: u64, guarantee: u64) -> SiloResult<()> {
    use std::os::unix::fs::OpenOptionsExt;

    tracing::debug!(
        image = %image.display(),
        size,
        guarantee,
        "Allocating ext4 image"
    );

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(image)?;

    let result = fill_image(&file, image, uid, gid, size, guarantee);
    if result.is_err() {
        let _ = std::fs::remove_file(image);
    }
    result
}

fn fill_image(
    file: &File,
    image: &Path,
    uid: u32,
    gid: u32,
    size: u64,
    guarantee: u64,
) -> SiloResult<()> {
    std::os::unix::fs::fchown(file, Some(uid), Some(gid))?;

    rustix::fs::ftruncate(file, size).map_err(|e| SiloError::Io(e.into()))?;

    if guarantee > 0 {
        rustix::fs::fallocate(file, FallocateFlags::KEEP_SIZE, 0, guarantee).map_err(|e| {
            if e == rustix::io::Errno::NOSPC {
                SiloError::ResourceNotAvailable {
                    message: format!("cannot fallocate guarantee of {} bytes", guarantee),
                }
            } else {
                SiloError::Io(e.into())
            }
        })?;
    }

    pathops::run_command(
        Command::new("mkfs.ext4")
            .args(["-F", "-m", "0", "-E", "nodiscard", "-O", "^has_journal"])
            .arg(image),
    )
}

/// Attach an image to a free loop device, returning its index.
pub fn attach(image: &Path) -> SiloResult<i32> {
    let device = pathops::run_command_output(
        Command::new("losetup").arg("--find").arg("--show").arg(image),
    )
    .map_err(|err| SiloError::ResourceNotAvailable {
        message: format!("no free loop device: {}", err),
    })?;

    let index: i32 = device
        .strip_prefix("/dev/loop")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SiloError::Unknown {
            message: format!("unexpected losetup output '{}'", device),
        })?;

    tracing::debug!(image = %image.display(), device = %device, "Attached loop device");
    Ok(index)
}

/// Release a loop device.
pub fn release(index: i32) -> SiloResult<()> {
    tracing::debug!(index, "Releasing loop device");
    pathops::run_command(Command::new("losetup").arg("-d").arg(device_path(index)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_paths() {
        assert_eq!(device_path(0), PathBuf::from("/dev/loop0"));
        assert_eq!(device_path(17), PathBuf::from("/dev/loop17"));
    }

    #[test]
    fn image_creation_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("loop.img");
        std::fs::write(&image, b"existing").unwrap();

        let err = make_image(&image, 0, 0, 1 << 20, 0);
        assert!(err.is_err());
        // The pre-existing file must survive the failed attempt.
        assert_eq!(std::fs::read(&image).unwrap(), b"existing");
    }
}

//! Layer naming, staging, and whiteout sanitization.

use std::path::Path;

use silo_common::{SiloError, SiloResult};

use crate::filesystem::mounts::{self, MountFlags};
use crate::filesystem::pathops;

/// aufs whiteout prefix.
const WHITEOUT_PREFIX: &str = ".wh.";
/// aufs metadata prefix (whiteouts about whiteouts).
const WHITEOUT_META_PREFIX: &str = ".wh..wh.";
/// aufs opaque-directory marker.
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Layers removed automatically with their last volume carry this prefix.
pub const WEAK_PREFIX: &str = "_weak_";

/// Check a named layer against the allowed character set.
///
/// `.`, `..` and the removal staging directory name are reserved.
pub fn validate_name(name: &str) -> SiloResult<()> {
    if let Some(bad) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '_' | '-' | '.' | '@'))
    {
        return Err(SiloError::InvalidValue {
            message: format!("forbidden character '{}' in layer name", bad),
        });
    }
    if name.is_empty()
        || name == "."
        || name == ".."
        || name == silo_common::paths::LAYERS_TMP_DIR
    {
        return Err(SiloError::InvalidValue {
            message: format!("invalid layer name '{}'", name),
        });
    }
    Ok(())
}

/// Bind a layer source read-only into a private stage directory.
pub fn stage(stage_dir: &Path, source: &Path) -> SiloResult<()> {
    pathops::create_dir(stage_dir, 0o700)?;

    let result = mounts::bind_remount(
        stage_dir,
        source,
        MountFlags::RDONLY | MountFlags::NODEV,
    )
    .and_then(|()| mounts::make_private(stage_dir));

    if result.is_err() {
        let _ = std::fs::remove_dir(stage_dir);
    }
    result
}

/// Undo [`stage`]: unmount and drop the stage directory, best effort.
pub fn unstage(stage_dir: &Path) {
    let _ = mounts::unmount_all(stage_dir);
    let _ = std::fs::remove_dir(stage_dir);
}

/// Convert aufs whiteouts in a tree.
///
/// Every `.wh.X` entry is dropped, and `X` is removed from the tree.
/// `.wh..wh..opq` marks the containing directory opaque via xattr;
/// other `.wh..wh.*` entries are metadata and vanish. When not merging,
/// each whiteout is reborn as an overlayfs char-device whiteout at `X`.
///
/// Idempotent: a sanitized tree has no `.wh.` entries left to convert.
pub fn sanitize(layer: &Path, merge: bool) -> SiloResult<()> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(layer)? {
        if let Ok(name) = entry?.file_name().into_string() {
            names.push(name);
        }
    }

    for name in names {
        let path = layer.join(&name);

        if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            pathops::remove_all(&path)?;

            if name == WHITEOUT_OPAQUE {
                pathops::set_xattr(layer, "trusted.overlay.opaque", "y")?;
            }
            if name.starts_with(WHITEOUT_META_PREFIX) {
                continue;
            }

            let victim = layer.join(target);
            if victim.symlink_metadata().is_ok() {
                pathops::remove_all(&victim)?;
            }
            if !merge {
                pathops::mknod_whiteout(&victim)?;
            }
            continue;
        }

        let meta = path.symlink_metadata()?;
        if meta.is_dir() {
            sanitize(&path, merge)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert!(validate_name("ubuntu-base").is_ok());
        assert!(validate_name("app@2024.1").is_ok());
        assert!(validate_name("_weak_tmp-layer").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("_tmp_").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("no spaces").is_err());
    }

    #[test]
    fn sanitize_removes_whiteouted_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep"), b"1").unwrap();
        std::fs::write(dir.path().join("gone"), b"2").unwrap();
        std::fs::write(dir.path().join(".wh.gone"), b"").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/other"), b"3").unwrap();
        std::fs::write(dir.path().join("sub/.wh.other"), b"").unwrap();
        std::fs::write(dir.path().join("sub/.wh..wh.meta"), b"").unwrap();

        sanitize(dir.path(), true).unwrap();

        assert!(dir.path().join("keep").exists());
        assert!(!dir.path().join("gone").exists());
        assert!(!dir.path().join(".wh.gone").exists());
        assert!(!dir.path().join("sub/other").exists());
        assert!(!dir.path().join("sub/.wh.other").exists());
        assert!(!dir.path().join("sub/.wh..wh.meta").exists());
    }

    #[test]
    fn sanitize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"1").unwrap();
        std::fs::write(dir.path().join(".wh.b"), b"").unwrap();

        sanitize(dir.path(), true).unwrap();
        let first: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();

        sanitize(dir.path(), true).unwrap();
        let second: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();

        assert_eq!(first, second);
    }
}

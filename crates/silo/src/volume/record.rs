//! The persisted projection of a volume.
//!
//! One record per volume, stored as a flat key-value file at
//! `<state-dir>/<id>`. All values are strings; lists are `;`-separated
//! with backslash escaping. A volume exists in the registry iff its
//! record exists on disk.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use silo_common::SiloResult;

use crate::filesystem::pathops;

/// Everything a volume needs to come back after a daemon restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Monotonic volume id.
    pub id: String,
    /// Absolute mount target.
    pub path: String,
    /// "true" when the runtime owns the path directory.
    pub auto_path: String,
    /// Storage override, empty when auto.
    pub storage: String,
    /// Backend name.
    pub backend: String,
    /// Owner uid.
    pub user: String,
    /// Owner gid.
    pub group: String,
    /// Octal mode of the storage directory.
    pub permissions: String,
    /// Who created the volume (audit only).
    pub creator: String,
    /// "true" once build and save both succeeded.
    pub ready: String,
    /// Opaque user tag.
    pub private: String,
    /// Linked container names, `;`-separated and escaped.
    pub containers: String,
    /// Loop or rbd device index, "-1" when none.
    pub loop_dev: String,
    /// "true" for read-only mounts.
    pub read_only: String,
    /// Layer names/paths, top first, `;`-separated and escaped.
    pub layers: String,
    /// Byte limit, "0" when unlimited.
    pub space_limit: String,
    /// Byte guarantee, "0" when none.
    pub space_guarantee: String,
    /// Inode limit, "0" when unlimited.
    pub inode_limit: String,
    /// Inode guarantee, "0" when none.
    pub inode_guarantee: String,
    /// Present only for a custom place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place: Option<String>,
}

impl VolumeRecord {
    /// Where the record for `id` lives.
    #[must_use]
    pub fn node_path(state_dir: &Path, id: &str) -> PathBuf {
        state_dir.join(id)
    }

    /// Persist the record. The write happens before the caller reports
    /// success to its client.
    pub fn save(&self, state_dir: &Path) -> SiloResult<()> {
        if !state_dir.exists() {
            pathops::create_dir_all(state_dir, 0o700)?;
        }

        let node = Self::node_path(state_dir, &self.id);
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(&node, text)?;

        tracing::debug!(id = %self.id, node = %node.display(), "Volume record saved");
        Ok(())
    }

    /// Load one record file.
    pub fn load(node: &Path) -> SiloResult<Self> {
        let text = std::fs::read_to_string(node)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Paths of every record under the state directory.
    pub fn list(state_dir: &Path) -> SiloResult<Vec<PathBuf>> {
        let mut nodes = Vec::new();

        if !state_dir.exists() {
            return Ok(nodes);
        }
        for entry in std::fs::read_dir(state_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                nodes.push(entry.path());
            }
        }
        nodes.sort();
        Ok(nodes)
    }

    /// Remove the record for `id`, tolerating absence.
    pub fn unlink(state_dir: &Path, id: &str) -> SiloResult<()> {
        match std::fs::remove_file(Self::node_path(state_dir, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Join list items with `sep`, escaping separators and backslashes.
#[must_use]
pub fn join_escaped(items: &[String], sep: char) -> String {
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(sep);
        }
        for c in item.chars() {
            if c == sep || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

/// Inverse of [`join_escaped`]. An empty string is an empty list.
#[must_use]
pub fn split_escaped(s: &str, sep: char) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }

    let mut items = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for c in s.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            items.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    items.push(current);
    items
}

//! The cgroup tree: one node per kernel cgroup, interned roots.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use silo_common::{SiloError, SiloResult};

use crate::config::Config;
use crate::filesystem::mounts::{self, MountEntry, MountFlags, UnmountFlags};
use crate::filesystem::pathops;

use super::subsystem;

const CGROUP_MODE: u32 = 0o755;

/// One node of a controller hierarchy.
///
/// Children are held weakly and pruned on lookup; the parent link is
/// strong, so a held leaf keeps its whole chain alive. Handle equality
/// (by `Arc` identity) implies kernel-cgroup identity as long as nodes
/// are obtained through one [`CgroupRegistry`].
#[derive(Debug)]
pub struct Cgroup {
    name: String,
    parent: Option<Arc<Cgroup>>,
    children: Mutex<Vec<Weak<Cgroup>>>,
    root: Option<RootInfo>,
}

#[derive(Debug)]
struct RootInfo {
    controllers: Vec<String>,
    mount: MountEntry,
    remove_timeout_s: u64,
}

impl Cgroup {
    fn new_root(mount: MountEntry, controllers: Vec<String>, remove_timeout_s: u64) -> Arc<Self> {
        Arc::new(Self {
            name: "/".to_string(),
            parent: None,
            children: Mutex::new(Vec::new()),
            root: Some(RootInfo {
                controllers,
                mount,
                remove_timeout_s,
            }),
        })
    }

    /// Local name ("/" for the root).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parent node, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Cgroup>> {
        self.parent.as_ref()
    }

    /// Whether this node is the hierarchy root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    fn root_info(&self) -> &RootInfo {
        match (&self.root, &self.parent) {
            (Some(info), _) => info,
            (None, Some(parent)) => parent.root_info(),
            (None, None) => unreachable!("non-root node without parent"),
        }
    }

    /// The controllers this hierarchy was mounted with.
    #[must_use]
    pub fn controllers(&self) -> &[String] {
        &self.root_info().controllers
    }

    /// Whether `name` is one of this hierarchy's controllers.
    #[must_use]
    pub fn has_controller(&self, name: &str) -> bool {
        self.controllers().iter().any(|c| c == name)
    }

    /// Absolute path of the cgroup directory.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        match &self.parent {
            None => self.root_info().mount.mountpoint.clone(),
            Some(parent) => parent.path().join(&self.name),
        }
    }

    /// Path relative to the hierarchy root ("" for the root itself).
    #[must_use]
    pub fn relpath(&self) -> String {
        match &self.parent {
            None => String::new(),
            Some(parent) => format!("{}/{}", parent.relpath(), self.name),
        }
    }

    /// Return or create the child with the given local name.
    ///
    /// Idempotent: a live child with this name is returned as-is. Dead
    /// weak entries are pruned along the way.
    pub fn child(self: &Arc<Self>, name: &str) -> Arc<Cgroup> {
        let mut children = self.children.lock().expect("cgroup children lock");

        let mut found = None;
        children.retain(|weak| match weak.upgrade() {
            Some(child) => {
                if child.name == name {
                    found = Some(child);
                }
                true
            }
            None => false,
        });

        if let Some(child) = found {
            return child;
        }

        let child = Arc::new(Cgroup {
            name: name.to_string(),
            parent: Some(self.clone()),
            children: Mutex::new(Vec::new()),
            root: None,
        });
        children.push(Arc::downgrade(&child));
        child
    }

    /// Materialize the cgroup directory (and the root mounts if needed).
    pub fn create(&self) -> SiloResult<()> {
        if let Some(info) = &self.root {
            let table = mounts::MountTable::snapshot()?;

            if table.contains(&info.mount) || table.has_mountpoint(&info.mount.mountpoint) {
                return Ok(());
            }

            let hier_root = info
                .mount
                .mountpoint
                .parent()
                .ok_or_else(|| SiloError::InvalidValue {
                    message: format!("bad cgroup mountpoint {}", info.mount.mountpoint.display()),
                })?
                .to_path_buf();

            if !table.has_mountpoint(&hier_root) {
                mounts::mount("cgroup", &hier_root, "tmpfs", MountFlags::empty(), "")?;
            }

            if !info.mount.mountpoint.exists() {
                pathops::create_dir(&info.mount.mountpoint, CGROUP_MODE)?;
            }

            mounts::mount(
                "cgroup",
                &info.mount.mountpoint,
                "cgroup",
                MountFlags::empty(),
                &info.controllers.join(","),
            )?;
        } else {
            let parent = self.parent.as_ref().expect("non-root has a parent");
            parent.create()?;

            let path = self.path();
            if !path.exists() {
                pathops::create_dir(&path, CGROUP_MODE)?;
            }
        }

        if self.has_controller("memory") {
            subsystem::memory::enable_hierarchy(self)?;
        }

        Ok(())
    }

    /// Tear the cgroup down.
    ///
    /// The root is unmounted. A child is first emptied: every task gets
    /// SIGKILL and the freezer is thawed, retrying every 100 ms until
    /// the cgroup is empty or the timeout runs out. The final rmdir
    /// failure is logged, not returned — the kernel rejects rmdir on a
    /// non-empty cgroup and the next removal attempt picks it up.
    pub fn remove(&self) -> SiloResult<()> {
        if let Some(info) = &self.root {
            return mounts::unmount(&info.mount.mountpoint, UnmountFlags::DETACH);
        }

        let attempts = self.root_info().remove_timeout_s * 10;
        let mut emptied = false;
        for _ in 0..attempts {
            self.kill(libc::SIGKILL)?;
            if self.has_controller("freezer") {
                let _ = subsystem::freezer::thaw(self);
            }
            if self.is_empty()? {
                emptied = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        if !emptied {
            tracing::warn!(cgroup = %self.path().display(), "Tasks survived cgroup removal");
        }

        if let Err(err) = std::fs::remove_dir(self.path()) {
            tracing::warn!(
                cgroup = %self.path().display(),
                error = %err,
                "Cannot remove cgroup directory"
            );
        }

        Ok(())
    }

    /// Move a process into this cgroup. A no-op on the root.
    pub fn attach(&self, pid: i32) -> SiloResult<()> {
        if self.is_root() {
            return Ok(());
        }

        tracing::debug!(cgroup = %self.path().display(), pid, "Attaching process");
        self.set_knob("cgroup.procs", &pid.to_string(), true)
    }

    /// Deliver a signal to every task. A no-op on the root.
    ///
    /// Individual delivery failures (task exited already) are ignored.
    pub fn kill(&self, signal: i32) -> SiloResult<()> {
        if self.is_root() {
            return Ok(());
        }

        for pid in self.tasks()? {
            // Safety: kill(2) with a pid read from the cgroup.
            unsafe {
                libc::kill(pid, signal);
            }
        }
        Ok(())
    }

    /// Pids listed in `cgroup.procs`.
    pub fn processes(&self) -> SiloResult<Vec<i32>> {
        self.knob_pids("cgroup.procs")
    }

    /// Pids listed in `tasks`.
    pub fn tasks(&self) -> SiloResult<Vec<i32>> {
        self.knob_pids("tasks")
    }

    /// Whether the cgroup has no tasks left.
    pub fn is_empty(&self) -> SiloResult<bool> {
        Ok(self.tasks()?.is_empty())
    }

    fn knob_pids(&self, knob: &str) -> SiloResult<Vec<i32>> {
        let mut pids = Vec::new();
        for line in self.get_knob_lines(knob)? {
            pids.push(line.parse().map_err(|_| SiloError::InvalidValue {
                message: format!("bad pid '{}' in {}", line, knob),
            })?);
        }
        Ok(pids)
    }

    /// Whether a knob file exists for this cgroup.
    #[must_use]
    pub fn has_knob(&self, knob: &str) -> bool {
        self.path().join(knob).exists()
    }

    /// Read a knob as a trimmed string.
    pub fn get_knob(&self, knob: &str) -> SiloResult<String> {
        Ok(std::fs::read_to_string(self.path().join(knob))?
            .trim_end()
            .to_string())
    }

    /// Read a knob as a list of non-empty lines.
    pub fn get_knob_lines(&self, knob: &str) -> SiloResult<Vec<String>> {
        Ok(std::fs::read_to_string(self.path().join(knob))?
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Write a knob, appending instead of truncating when asked.
    pub fn set_knob(&self, knob: &str, value: &str, append: bool) -> SiloResult<()> {
        let path = self.path().join(knob);

        if append {
            let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
            file.write_all(value.as_bytes())?;
        } else {
            std::fs::write(path, value)?;
        }
        Ok(())
    }
}

/// Process-wide interner for hierarchy roots.
///
/// Keyed by (mountpoint, controller set); entries are weak and pruned
/// once the last holder releases the root. Construct one in `main` and
/// thread it through — two lookups of the same key must yield the same
/// node.
#[derive(Debug)]
pub struct CgroupRegistry {
    cgroup_root: PathBuf,
    remove_timeout_s: u64,
    roots: Mutex<HashMap<String, Weak<Cgroup>>>,
}

impl CgroupRegistry {
    /// A registry rooted at the configured hierarchy parent.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            cgroup_root: config.cgroup_root.clone(),
            remove_timeout_s: config.cgroup_remove_timeout_s,
            roots: Mutex::new(HashMap::new()),
        }
    }

    /// Parent directory of the controller hierarchies.
    #[must_use]
    pub fn cgroup_root(&self) -> &Path {
        &self.cgroup_root
    }

    /// The unique root for a controller set, at its canonical mountpoint.
    pub fn root(&self, controllers: &[&str]) -> Arc<Cgroup> {
        let controllers: Vec<String> = controllers.iter().map(|s| s.to_string()).collect();
        let mountpoint = self.cgroup_root.join(controllers.join(","));
        let mount = MountEntry::new(
            "cgroup".to_string(),
            mountpoint,
            "cgroup".to_string(),
            controllers.clone(),
        );
        self.intern(mount, controllers)
    }

    /// The unique root for an already-mounted hierarchy.
    pub fn root_for_mount(&self, mount: &MountEntry, controllers: Vec<String>) -> Arc<Cgroup> {
        self.intern(mount.clone(), controllers)
    }

    fn intern(&self, mount: MountEntry, controllers: Vec<String>) -> Arc<Cgroup> {
        let key = format!("{}|{}", mount.mountpoint.display(), controllers.join(","));
        let mut roots = self.roots.lock().expect("cgroup registry lock");

        roots.retain(|_, weak| weak.strong_count() > 0);

        if let Some(live) = roots.get(&key).and_then(Weak::upgrade) {
            return live;
        }

        let root = Cgroup::new_root(mount, controllers, self.remove_timeout_s);
        roots.insert(key, Arc::downgrade(&root));
        root
    }
}

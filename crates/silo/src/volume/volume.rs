//! One materialized volume: configuration, lifecycle, persistence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use silo_common::paths::CHROOT_DIR;
use silo_common::{size, Cred, SiloError, SiloPaths, SiloResult};

use crate::config::Config;
use crate::filesystem::mounts::MountFlags;
use crate::filesystem::pathops::{self, FsUsage};

use super::backend::{self, BackendKind, VolumeBackend};
use super::holder::VolumeHolder;
use super::layer;
use super::record::{join_escaped, split_escaped, VolumeRecord};

/// Property names accepted from clients and stored in records.
pub mod prop {
    /// Storage strategy.
    pub const BACKEND: &str = "backend";
    /// Storage path override.
    pub const STORAGE: &str = "storage";
    /// Construction-complete flag (read-only).
    pub const READY: &str = "ready";
    /// Opaque user tag.
    pub const PRIVATE: &str = "private";
    /// Owner uid.
    pub const USER: &str = "user";
    /// Owner gid.
    pub const GROUP: &str = "group";
    /// Storage directory mode.
    pub const PERMISSIONS: &str = "permissions";
    /// Audit string (read-only).
    pub const CREATOR: &str = "creator";
    /// Mount read-only.
    pub const READ_ONLY: &str = "read_only";
    /// Overlay layers, top first.
    pub const LAYERS: &str = "layers";
    /// Place override.
    pub const PLACE: &str = "place";
    /// Byte limit.
    pub const SPACE_LIMIT: &str = "space_limit";
    /// Inode limit.
    pub const INODE_LIMIT: &str = "inode_limit";
    /// Byte guarantee.
    pub const SPACE_GUARANTEE: &str = "space_guarantee";
    /// Inode guarantee.
    pub const INODE_GUARANTEE: &str = "inode_guarantee";
    /// Current usage (read-only).
    pub const SPACE_USED: &str = "space_used";
    /// Current inode usage (read-only).
    pub const INODE_USED: &str = "inode_used";
    /// Available bytes (read-only).
    pub const SPACE_AVAILABLE: &str = "space_available";
    /// Available inodes (read-only).
    pub const INODE_AVAILABLE: &str = "inode_available";
}

/// Metadata for one settable or reflected volume property.
#[derive(Debug, Clone, Copy)]
pub struct VolumeProperty {
    /// Property name on the wire.
    pub name: &'static str,
    /// Human-readable description.
    pub desc: &'static str,
    /// Whether clients may set it.
    pub read_only: bool,
}

/// Every property a volume understands.
pub const PROPERTIES: &[VolumeProperty] = &[
    VolumeProperty { name: prop::BACKEND, desc: "plain|tmpfs|quota|native|overlay|loop|rbd (default - autodetect)", read_only: false },
    VolumeProperty { name: prop::STORAGE, desc: "path to data storage (default - internal)", read_only: false },
    VolumeProperty { name: prop::READY, desc: "true|false - construction complete (ro)", read_only: true },
    VolumeProperty { name: prop::PRIVATE, desc: "user-defined property", read_only: false },
    VolumeProperty { name: prop::USER, desc: "owner uid (default - creator)", read_only: false },
    VolumeProperty { name: prop::GROUP, desc: "owner gid (default - creator)", read_only: false },
    VolumeProperty { name: prop::PERMISSIONS, desc: "directory permissions (default - 0775)", read_only: false },
    VolumeProperty { name: prop::CREATOR, desc: "container user group (ro)", read_only: true },
    VolumeProperty { name: prop::READ_ONLY, desc: "true|false (default - false)", read_only: false },
    VolumeProperty { name: prop::LAYERS, desc: "top-layer;...;bottom-layer - overlayfs layers", read_only: false },
    VolumeProperty { name: prop::PLACE, desc: "place for layers and default storage (optional)", read_only: false },
    VolumeProperty { name: prop::SPACE_LIMIT, desc: "disk space limit (dynamic, default zero - unlimited)", read_only: false },
    VolumeProperty { name: prop::INODE_LIMIT, desc: "disk inode limit (dynamic, default zero - unlimited)", read_only: false },
    VolumeProperty { name: prop::SPACE_GUARANTEE, desc: "disk space guarantee (dynamic, default - zero)", read_only: false },
    VolumeProperty { name: prop::INODE_GUARANTEE, desc: "disk inode guarantee (dynamic, default - zero)", read_only: false },
    VolumeProperty { name: prop::SPACE_USED, desc: "current disk space usage (ro)", read_only: true },
    VolumeProperty { name: prop::INODE_USED, desc: "current disk inode usage (ro)", read_only: true },
    VolumeProperty { name: prop::SPACE_AVAILABLE, desc: "available disk space (ro)", read_only: true },
    VolumeProperty { name: prop::INODE_AVAILABLE, desc: "available disk inodes (ro)", read_only: true },
];

fn parse_bool(value: &str) -> SiloResult<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(SiloError::InvalidValue {
            message: format!("bad bool value '{}'", value),
        }),
    }
}

/// A volume's configuration, shared with its backend on every call.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    /// Daemon configuration the volume was created under.
    pub config: Config,
    /// Monotonic id, unique within the holder.
    pub id: String,
    /// Absolute mount target.
    pub path: PathBuf,
    /// Whether the runtime owns the path directory.
    pub is_auto_path: bool,
    /// Storage override; `None` means auto storage under the place.
    pub storage_path: Option<PathBuf>,
    /// Chosen strategy; `None` until configure autodetects.
    pub backend_kind: Option<BackendKind>,
    /// Owner uid of the storage directory.
    pub owner_uid: u32,
    /// Owner gid of the storage directory.
    pub owner_gid: u32,
    /// Mode of the storage directory.
    pub perms: u32,
    /// Audit string recorded at creation.
    pub creator: String,
    /// Credential of the creator.
    pub creator_cred: Cred,
    /// Root directory of the creator at creation time.
    pub creator_root: PathBuf,
    /// Opaque user tag.
    pub private: String,
    /// True once build and save both succeeded.
    pub is_ready: bool,
    /// Mount read-only.
    pub is_read_only: bool,
    /// Layer names/paths, top first.
    pub layers: Vec<String>,
    /// Place for default storage and the layer store.
    pub place: PathBuf,
    /// Whether the place was caller-supplied.
    pub custom_place: bool,
    /// Byte limit; 0 is unlimited.
    pub space_limit: u64,
    /// Byte guarantee; 0 is none.
    pub space_guarantee: u64,
    /// Inode limit; 0 is unlimited.
    pub inode_limit: u64,
    /// Inode guarantee; 0 is none.
    pub inode_guarantee: u64,
    /// Loop or rbd device index; -1 when none.
    pub loop_dev: i32,
    /// Names of containers linked to this volume.
    pub containers: Vec<String>,
}

impl VolumeSpec {
    fn new(config: Config, id: String) -> Self {
        let place = config.place.clone();
        Self {
            config,
            id,
            path: PathBuf::new(),
            is_auto_path: false,
            storage_path: None,
            backend_kind: None,
            owner_uid: 0,
            owner_gid: 0,
            perms: 0o775,
            creator: String::new(),
            creator_cred: Cred::root(),
            creator_root: PathBuf::from("/"),
            private: String::new(),
            is_ready: false,
            is_read_only: false,
            layers: Vec::new(),
            place,
            custom_place: false,
            space_limit: 0,
            space_guarantee: 0,
            inode_limit: 0,
            inode_guarantee: 0,
            loop_dev: -1,
            containers: Vec::new(),
        }
    }

    /// The layout rooted at this volume's place.
    #[must_use]
    pub fn paths(&self) -> SiloPaths {
        SiloPaths::with_place(&self.place)
    }

    /// The chosen backend (plain until configure decides otherwise).
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.backend_kind.unwrap_or(BackendKind::Plain)
    }

    /// `<place>/volumes/<id>/<name>`, or the volume directory itself
    /// for an empty name.
    #[must_use]
    pub fn internal(&self, name: &str) -> PathBuf {
        let dir = self.paths().volume_dir(&self.id);
        if name.is_empty() {
            dir
        } else {
            dir.join(name)
        }
    }

    /// `<root>/silo/<name>_<id>` for volumes created inside a chroot.
    pub fn chroot_internal(&self, root: &Path, name: &str) -> SiloResult<PathBuf> {
        let dir = root.join(CHROOT_DIR);
        if !dir.exists() {
            pathops::create_dir(&dir, 0o755).map_err(|_| SiloError::InvalidValue {
                message: "cannot choose automatic volume path".to_string(),
            })?;
        }
        Ok(dir.join(format!("{}_{}", name, self.id)))
    }

    /// The backing directory for the backend.
    #[must_use]
    pub fn storage(&self) -> PathBuf {
        match &self.storage_path {
            Some(path) => path.clone(),
            None => self.internal(self.kind().as_str()),
        }
    }

    /// Whether the runtime owns the storage directory.
    #[must_use]
    pub fn is_auto_storage(&self) -> bool {
        self.storage_path.is_none()
    }

    /// Flags every volume mount carries.
    #[must_use]
    pub fn mount_flags(&self) -> MountFlags {
        let mut flags = MountFlags::NODEV | MountFlags::NOSUID;
        if self.is_read_only {
            flags |= MountFlags::RDONLY;
        }
        flags
    }

    /// Whether any limit is set.
    #[must_use]
    pub fn have_quota(&self) -> bool {
        self.space_limit > 0 || self.inode_limit > 0
    }

    /// The (space, inode) limit pair.
    #[must_use]
    pub fn quota_limits(&self) -> (u64, u64) {
        (self.space_limit, self.inode_limit)
    }

    /// Resolve a configured layer to its source directory.
    ///
    /// Absolute layers were rebased under the creator root during
    /// configure; they are re-checked here because the tree may have
    /// changed since.
    pub fn resolve_layer(&self, name: &str) -> SiloResult<PathBuf> {
        if name.starts_with('/') {
            let path = PathBuf::from(name);
            if !pathops::is_inside(&self.creator_root, &path) {
                return Err(SiloError::Permission {
                    message: format!("layer path outside root: {}", name),
                });
            }
            if !path.exists() {
                return Err(SiloError::LayerNotFound {
                    name: name.to_string(),
                });
            }
            if !pathops::writable_by(&path, &self.creator_cred)? {
                return Err(SiloError::Permission {
                    message: format!("layer path not permitted: {}", name),
                });
            }
            return Ok(path);
        }

        let path = self.paths().layer(name);
        if !path.exists() {
            return Err(SiloError::LayerNotFound {
                name: name.to_string(),
            });
        }
        Ok(path)
    }
}

/// A volume and its backend.
pub struct Volume {
    spec: VolumeSpec,
    backend: Option<Box<dyn VolumeBackend>>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("spec", &self.spec)
            .field("backend", &self.backend.as_ref().map(|b| b.kind()))
            .finish()
    }
}

impl Volume {
    /// An unconfigured volume with an allocated id.
    #[must_use]
    pub fn new(config: Config, id: String) -> Self {
        Self {
            spec: VolumeSpec::new(config, id),
            backend: None,
        }
    }

    /// The volume's configuration.
    #[must_use]
    pub fn spec(&self) -> &VolumeSpec {
        &self.spec
    }

    /// The volume id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// The mount target.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.spec.path
    }

    /// Whether build and save both succeeded.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.spec.is_ready
    }

    /// Validate properties and decide every configuration detail.
    ///
    /// The volume is invalid until this returns success. No side
    /// effects are left behind on failure.
    pub fn configure(
        &mut self,
        path: Option<&Path>,
        creator_name: &str,
        creator_cred: &Cred,
        creator_root: &Path,
        properties: &BTreeMap<String, String>,
        holder: &VolumeHolder,
    ) -> SiloResult<()> {
        for name in properties.keys() {
            let known = PROPERTIES.iter().find(|p| p.name == name.as_str());
            match known {
                None => {
                    return Err(SiloError::InvalidProperty {
                        message: format!("unknown: {}", name),
                    })
                }
                Some(p) if p.read_only => {
                    return Err(SiloError::InvalidProperty {
                        message: format!("read-only: {}", name),
                    })
                }
                Some(_) => {}
            }
        }

        if let Some(place) = properties.get(prop::PLACE) {
            let place = PathBuf::from(place);
            super::recovery::check_place(&self.spec.config, &place, false)?;
            self.spec.place = place;
            self.spec.custom_place = true;
        }

        match path {
            Some(path) => {
                if !path.is_absolute() {
                    return Err(SiloError::InvalidValue {
                        message: "volume path must be absolute".to_string(),
                    });
                }
                if !pathops::is_normalized(path) {
                    return Err(SiloError::InvalidValue {
                        message: "volume path must be normalized".to_string(),
                    });
                }
                if !path.exists() {
                    return Err(SiloError::InvalidValue {
                        message: "volume path does not exist".to_string(),
                    });
                }
                if !path.is_dir() {
                    return Err(SiloError::InvalidValue {
                        message: "volume path must be a directory".to_string(),
                    });
                }
                if !pathops::writable_by(path, creator_cred)? {
                    return Err(SiloError::Permission {
                        message: "volume path usage not permitted".to_string(),
                    });
                }
                self.spec.path = path.to_path_buf();
            }
            None => {
                self.spec.path = if creator_root == Path::new("/") {
                    self.spec.internal("volume")
                } else {
                    self.spec.chroot_internal(creator_root, "volume")?
                };
                self.spec.is_auto_path = true;
            }
        }

        let backend_prop = properties.get(prop::BACKEND).map(String::as_str);
        if let Some(storage) = properties.get(prop::STORAGE) {
            if backend_prop != Some("rbd") && backend_prop != Some("tmpfs") {
                let storage = Path::new(storage);
                if !storage.is_absolute() {
                    return Err(SiloError::InvalidValue {
                        message: "storage path must be absolute".to_string(),
                    });
                }
                if !pathops::is_normalized(storage) {
                    return Err(SiloError::InvalidValue {
                        message: "storage path must be normalized".to_string(),
                    });
                }
                if !storage.exists() {
                    return Err(SiloError::InvalidValue {
                        message: "storage path does not exist".to_string(),
                    });
                }
                if !storage.is_dir() {
                    return Err(SiloError::InvalidValue {
                        message: "storage path must be a directory".to_string(),
                    });
                }
                if !pathops::writable_by(storage, creator_cred)? {
                    return Err(SiloError::Permission {
                        message: "storage path usage not permitted".to_string(),
                    });
                }
            }
        }

        self.spec.creator = format!(
            "{} {} {}",
            creator_name, creator_cred.uid, creator_cred.gid
        );
        self.spec.creator_cred = creator_cred.clone();
        self.spec.creator_root = creator_root.to_path_buf();
        self.spec.owner_uid = creator_cred.uid;
        self.spec.owner_gid = creator_cred.gid;

        for (name, value) in properties {
            self.apply_property(name, value)?;
        }

        if self.spec.owner_uid != creator_cred.uid && !creator_cred.is_root() {
            return Err(SiloError::Permission {
                message: "changing user is not permitted".to_string(),
            });
        }
        if self.spec.owner_gid != creator_cred.gid
            && !creator_cred.is_root()
            && !creator_cred.is_member_of(self.spec.owner_gid)
        {
            return Err(SiloError::Permission {
                message: "changing group is not permitted".to_string(),
            });
        }

        let mut layers = std::mem::take(&mut self.spec.layers);
        for name in layers.iter_mut() {
            let as_path = Path::new(name.as_str());
            if !pathops::is_normalized(as_path) {
                return Err(SiloError::InvalidValue {
                    message: "layer path must be normalized".to_string(),
                });
            }
            if as_path.is_absolute() {
                let rebased = pathops::rebase(creator_root, as_path);
                if !rebased.exists() {
                    return Err(SiloError::LayerNotFound { name: name.clone() });
                }
                if !pathops::writable_by(&rebased, creator_cred)? {
                    return Err(SiloError::Permission {
                        message: format!("layer path not permitted: {}", name),
                    });
                }
                if !rebased.is_dir() {
                    return Err(SiloError::InvalidValue {
                        message: "layer must be a directory".to_string(),
                    });
                }
                *name = rebased.display().to_string();
            } else {
                layer::validate_name(name)?;
                let path = self.spec.paths().layer(name);
                if !path.exists() {
                    return Err(SiloError::LayerNotFound { name: name.clone() });
                }
                if !path.is_dir() {
                    return Err(SiloError::InvalidValue {
                        message: "layer must be a directory".to_string(),
                    });
                }
            }
        }
        self.spec.layers = layers;

        if self.spec.space_guarantee > 0
            && self.spec.space_limit > 0
            && self.spec.space_limit < self.spec.space_guarantee
        {
            return Err(SiloError::InvalidValue {
                message: "space guarantee bigger than limit".to_string(),
            });
        }
        if self.spec.inode_guarantee > 0
            && self.spec.inode_limit > 0
            && self.spec.inode_limit < self.spec.inode_guarantee
        {
            return Err(SiloError::InvalidValue {
                message: "inode guarantee bigger than limit".to_string(),
            });
        }

        if self.spec.backend_kind.is_none() {
            self.spec.backend_kind = Some(self.autodetect_backend());
        }

        self.open_backend()?;
        let backend = self.backend.as_ref().expect("backend just opened");
        backend.configure(&self.spec)?;

        holder.check_guarantee(
            &self.spec,
            None,
            self.spec.space_guarantee,
            self.spec.inode_guarantee,
        )
    }

    fn autodetect_backend(&self) -> BackendKind {
        let native = backend::native_supported(&self.spec.config);

        if self.spec.have_quota() && !native {
            BackendKind::Loop
        } else if !self.spec.layers.is_empty() && backend::overlay_supported() {
            BackendKind::Overlay
        } else if native {
            BackendKind::Native
        } else {
            BackendKind::Plain
        }
    }

    fn open_backend(&mut self) -> SiloResult<()> {
        let kind = self.spec.backend_kind.ok_or_else(|| SiloError::Unknown {
            message: "volume has no backend".to_string(),
        })?;
        self.backend = Some(backend::open(kind));
        Ok(())
    }

    fn apply_property(&mut self, name: &str, value: &str) -> SiloResult<()> {
        match name {
            prop::BACKEND => self.spec.backend_kind = Some(value.parse()?),
            prop::STORAGE => self.spec.storage_path = Some(PathBuf::from(value)),
            prop::PRIVATE => self.spec.private = value.to_string(),
            prop::USER => {
                self.spec.owner_uid = value.parse().map_err(|_| SiloError::InvalidValue {
                    message: format!("bad uid '{}'", value),
                })?;
            }
            prop::GROUP => {
                self.spec.owner_gid = value.parse().map_err(|_| SiloError::InvalidValue {
                    message: format!("bad gid '{}'", value),
                })?;
            }
            prop::PERMISSIONS => self.spec.perms = size::parse_octal(value)?,
            prop::READ_ONLY => self.spec.is_read_only = parse_bool(value)?,
            prop::LAYERS => self.spec.layers = split_escaped(value, ';'),
            prop::PLACE => {
                self.spec.place = PathBuf::from(value);
                self.spec.custom_place = true;
            }
            prop::SPACE_LIMIT => self.spec.space_limit = size::parse_size(value)?,
            prop::INODE_LIMIT => self.spec.inode_limit = size::parse_size(value)?,
            prop::SPACE_GUARANTEE => self.spec.space_guarantee = size::parse_size(value)?,
            prop::INODE_GUARANTEE => self.spec.inode_guarantee = size::parse_size(value)?,
            _ => {
                return Err(SiloError::InvalidProperty {
                    message: format!("unknown: {}", name),
                })
            }
        }
        Ok(())
    }

    /// Materialize the volume. Every step rolls back on error.
    pub fn build(&mut self) -> SiloResult<()> {
        let path = self.spec.path.clone();
        let storage = self.spec.storage();
        let internal = self.spec.internal("");

        tracing::info!(
            path = %path.display(),
            backend = %self.spec.kind(),
            "Building volume"
        );

        pathops::create_dir(&internal, 0o755)?;

        let err: SiloError = 'fail: {
            if self.spec.is_auto_storage() {
                if let Err(e) = pathops::create_dir(&storage, 0o755) {
                    break 'fail e;
                }
            }
            if self.spec.is_auto_path && !path.exists() {
                if let Err(e) = pathops::create_dir(&path, 0o755) {
                    break 'fail e;
                }
            }

            let Some(mut backend) = self.backend.take() else {
                break 'fail SiloError::Unknown {
                    message: "volume has no backend".to_string(),
                };
            };

            if let Err(e) = backend.build(&self.spec) {
                self.backend = Some(backend);
                break 'fail e;
            }

            let mut finished = backend.save(&mut self.spec);
            if finished.is_ok()
                && !self.spec.layers.is_empty()
                && backend.kind() != BackendKind::Overlay
            {
                finished = self.merge_layers();
            }
            if finished.is_ok() {
                self.spec.is_ready = true;
                finished = self.save();
            }

            match finished {
                Ok(()) => {
                    self.backend = Some(backend);
                    return Ok(());
                }
                Err(e) => {
                    self.spec.is_ready = false;
                    let _ = backend.destroy(&self.spec);
                    self.backend = Some(backend);
                    break 'fail e;
                }
            }
        };

        if self.spec.is_auto_path {
            let _ = pathops::remove_all(&path);
        }
        if self.spec.is_auto_storage() {
            let _ = pathops::remove_all(&storage);
        }
        let _ = pathops::remove_all(&internal);
        Err(err)
    }

    /// Copy each layer onto the volume path, then sanitize whiteouts.
    ///
    /// Used by non-overlay backends; absolute layers are bind-staged
    /// read-only exactly like overlay lowers.
    fn merge_layers(&self) -> SiloResult<()> {
        tracing::info!(path = %self.spec.path.display(), "Merging layers into volume");

        for name in &self.spec.layers {
            let source = self.spec.resolve_layer(name)?;

            if name.starts_with('/') {
                let stage_dir = self.spec.internal("temp");
                layer::stage(&stage_dir, &source)?;
                let copied = pathops::copy_tree(&stage_dir, &self.spec.path);
                layer::unstage(&stage_dir);
                copied?;
            } else {
                pathops::copy_tree(&source, &self.spec.path)?;
            }
        }

        layer::sanitize(&self.spec.path, true)?;

        pathops::chown(&self.spec.path, self.spec.owner_uid, self.spec.owner_gid)?;
        pathops::chmod(&self.spec.path, self.spec.perms)
    }

    /// Empty the user-visible contents.
    pub fn clear(&self) -> SiloResult<()> {
        tracing::info!(path = %self.spec.path.display(), "Clearing volume");
        self.backend_ref()?.clear(&self.spec)
    }

    /// Tear everything down, best effort: every cleanup step runs, the
    /// first error is reported.
    pub fn destroy(&mut self, holder: &VolumeHolder) -> SiloResult<()> {
        let mut first: Option<SiloError> = None;

        tracing::info!(
            path = %self.spec.path.display(),
            backend = %self.spec.kind(),
            "Destroying volume"
        );

        if let Some(mut backend) = self.backend.take() {
            if let Err(err) = backend.destroy(&self.spec) {
                tracing::error!(%err, "Cannot destroy volume backend");
                first = first.or(Some(err));
            }
            self.backend = Some(backend);
        }

        let storage = self.spec.storage();
        if self.spec.is_auto_storage() && storage.exists() {
            if let Err(err) = pathops::remove_all(&storage) {
                tracing::error!(%err, "Cannot remove storage");
                first = first.or(Some(err));
            }
        }

        if self.spec.is_auto_path && self.spec.path.exists() {
            if let Err(err) = pathops::remove_all(&self.spec.path) {
                tracing::error!(%err, "Cannot remove volume path");
                first = first.or(Some(err));
            }
        }

        let internal = self.spec.internal("");
        if internal.exists() {
            if let Err(err) = pathops::remove_all(&internal) {
                tracing::error!(%err, "Cannot remove internal directory");
                first = first.or(Some(err));
            }
        }

        for name in std::mem::take(&mut self.spec.layers) {
            if !name.starts_with(layer::WEAK_PREFIX) {
                continue;
            }
            match holder.remove_layer(&name, &self.spec.place) {
                Ok(()) | Err(SiloError::Busy { .. }) => {}
                Err(err) => tracing::error!(layer = %name, %err, "Cannot remove layer"),
            }
        }

        if let Err(err) = VolumeRecord::unlink(&self.spec.config.state_dir, &self.spec.id) {
            first = first.or(Some(err));
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Space and inode usage of the volume.
    pub fn stat_fs(&self) -> SiloResult<FsUsage> {
        self.backend_ref()?.stat_fs(&self.spec)
    }

    /// Change the runtime-mutable properties.
    ///
    /// Only the four limits and guarantees may change after creation.
    /// Limits go to the backend; guarantees are re-checked against the
    /// holder's accounting before they stick.
    pub fn tune(
        &mut self,
        holder: &VolumeHolder,
        properties: &BTreeMap<String, String>,
    ) -> SiloResult<()> {
        for name in properties.keys() {
            if name != prop::SPACE_LIMIT
                && name != prop::INODE_LIMIT
                && name != prop::SPACE_GUARANTEE
                && name != prop::INODE_GUARANTEE
            {
                return Err(SiloError::InvalidProperty {
                    message: format!("volume property {} cannot be changed", name),
                });
            }
        }

        if properties.contains_key(prop::SPACE_LIMIT)
            || properties.contains_key(prop::INODE_LIMIT)
        {
            let mut space_limit = self.spec.space_limit;
            let mut inode_limit = self.spec.inode_limit;

            if let Some(value) = properties.get(prop::SPACE_LIMIT) {
                space_limit = size::parse_size(value)?;
            }
            if let Some(value) = properties.get(prop::INODE_LIMIT) {
                inode_limit = size::parse_size(value)?;
            }

            self.resize(space_limit, inode_limit)?;
        }

        if properties.contains_key(prop::SPACE_GUARANTEE)
            || properties.contains_key(prop::INODE_GUARANTEE)
        {
            let mut space_guarantee = self.spec.space_guarantee;
            let mut inode_guarantee = self.spec.inode_guarantee;

            if let Some(value) = properties.get(prop::SPACE_GUARANTEE) {
                space_guarantee = size::parse_size(value)?;
            }
            if let Some(value) = properties.get(prop::INODE_GUARANTEE) {
                inode_guarantee = size::parse_size(value)?;
            }

            let current = self.stat_fs().ok();
            holder.check_guarantee(&self.spec, current, space_guarantee, inode_guarantee)?;

            self.spec.space_guarantee = space_guarantee;
            self.spec.inode_guarantee = inode_guarantee;
        }

        self.save()
    }

    /// Change the limits through the backend and persist.
    pub fn resize(&mut self, space_limit: u64, inode_limit: u64) -> SiloResult<()> {
        tracing::info!(
            path = %self.spec.path.display(),
            space_limit,
            inode_limit,
            "Resizing volume"
        );

        let mut backend = self.backend.take().ok_or_else(|| SiloError::Unknown {
            message: "volume has no backend".to_string(),
        })?;
        let resized = backend.resize(&self.spec, space_limit, inode_limit);
        self.backend = Some(backend);
        resized?;

        self.spec.space_limit = space_limit;
        self.spec.inode_limit = inode_limit;

        self.save()
    }

    /// The writable top of the volume.
    #[must_use]
    pub fn upper_layer(&self) -> PathBuf {
        if self.spec.kind() == BackendKind::Overlay {
            self.spec.storage().join("upper")
        } else {
            self.spec.path.clone()
        }
    }

    /// Link a container to this volume and persist.
    pub fn link_container(&mut self, name: &str) -> SiloResult<()> {
        self.spec.containers.push(name.to_string());
        self.save()
    }

    /// Unlink a container; returns true when no links remain (the
    /// caller is then obligated to destroy the volume).
    pub fn unlink_container(&mut self, name: &str) -> bool {
        self.spec.containers.retain(|c| c != name);
        let _ = self.save();
        self.spec.containers.is_empty()
    }

    /// Linked container names.
    #[must_use]
    pub fn containers(&self) -> &[String] {
        &self.spec.containers
    }

    /// All properties, configured and reflected, for a client whose
    /// root is `container_root`.
    #[must_use]
    pub fn properties(&self, container_root: &Path) -> BTreeMap<String, String> {
        let mut ret = BTreeMap::new();

        if self.spec.is_ready {
            if let Ok(stat) = self.stat_fs() {
                ret.insert(prop::SPACE_USED.to_string(), stat.space_used.to_string());
                ret.insert(prop::INODE_USED.to_string(), stat.inode_used.to_string());
                ret.insert(
                    prop::SPACE_AVAILABLE.to_string(),
                    stat.space_avail.to_string(),
                );
                ret.insert(
                    prop::INODE_AVAILABLE.to_string(),
                    stat.inode_avail.to_string(),
                );
            }
        }

        ret.insert(
            prop::STORAGE.to_string(),
            self.spec
                .storage_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        ret.insert(prop::BACKEND.to_string(), self.spec.kind().to_string());
        ret.insert(prop::USER.to_string(), self.spec.owner_uid.to_string());
        ret.insert(prop::GROUP.to_string(), self.spec.owner_gid.to_string());
        ret.insert(
            prop::PERMISSIONS.to_string(),
            size::format_octal(self.spec.perms),
        );
        ret.insert(prop::CREATOR.to_string(), self.spec.creator.clone());
        ret.insert(prop::READY.to_string(), self.spec.is_ready.to_string());
        ret.insert(prop::PRIVATE.to_string(), self.spec.private.clone());
        ret.insert(
            prop::READ_ONLY.to_string(),
            self.spec.is_read_only.to_string(),
        );
        ret.insert(
            prop::SPACE_LIMIT.to_string(),
            self.spec.space_limit.to_string(),
        );
        ret.insert(
            prop::INODE_LIMIT.to_string(),
            self.spec.inode_limit.to_string(),
        );
        ret.insert(
            prop::SPACE_GUARANTEE.to_string(),
            self.spec.space_guarantee.to_string(),
        );
        ret.insert(
            prop::INODE_GUARANTEE.to_string(),
            self.spec.inode_guarantee.to_string(),
        );

        if !self.spec.layers.is_empty() {
            let layers: Vec<String> = self
                .spec
                .layers
                .iter()
                .map(|l| {
                    let as_path = Path::new(l.as_str());
                    if as_path.is_absolute() {
                        match as_path.strip_prefix(container_root) {
                            Ok(inner) => format!("/{}", inner.display()),
                            Err(_) => l.clone(),
                        }
                    } else {
                        l.clone()
                    }
                })
                .collect();
            ret.insert(prop::LAYERS.to_string(), join_escaped(&layers, ';'));
        }

        if self.spec.custom_place {
            ret.insert(
                prop::PLACE.to_string(),
                self.spec.place.display().to_string(),
            );
        }

        ret
    }

    /// Persist the record. Runs before the client sees success.
    pub fn save(&self) -> SiloResult<()> {
        self.to_record().save(&self.spec.config.state_dir)
    }

    /// The persisted projection of this volume.
    #[must_use]
    pub fn to_record(&self) -> VolumeRecord {
        VolumeRecord {
            id: self.spec.id.clone(),
            path: self.spec.path.display().to_string(),
            auto_path: self.spec.is_auto_path.to_string(),
            storage: self
                .spec
                .storage_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            backend: self.spec.kind().to_string(),
            user: self.spec.owner_uid.to_string(),
            group: self.spec.owner_gid.to_string(),
            permissions: size::format_octal(self.spec.perms),
            creator: self.spec.creator.clone(),
            ready: self.spec.is_ready.to_string(),
            private: self.spec.private.clone(),
            containers: join_escaped(&self.spec.containers, ';'),
            loop_dev: self.spec.loop_dev.to_string(),
            read_only: self.spec.is_read_only.to_string(),
            layers: join_escaped(&self.spec.layers, ';'),
            space_limit: self.spec.space_limit.to_string(),
            space_guarantee: self.spec.space_guarantee.to_string(),
            inode_limit: self.spec.inode_limit.to_string(),
            inode_guarantee: self.spec.inode_guarantee.to_string(),
            place: self
                .spec
                .custom_place
                .then(|| self.spec.place.display().to_string()),
        }
    }

    /// Rebuild in-memory state from a persisted record.
    ///
    /// Only ready volumes come back; a half-built record means the
    /// daemon died mid-build and the volume must be discarded.
    pub fn restore(&mut self, record: &VolumeRecord) -> SiloResult<()> {
        if record.id.is_empty() {
            return Err(SiloError::InvalidValue {
                message: "no volume id stored".to_string(),
            });
        }

        self.spec.id = record.id.clone();
        self.spec.path = PathBuf::from(&record.path);
        self.spec.is_auto_path = parse_bool(&record.auto_path)?;
        self.spec.storage_path = if record.storage.is_empty() {
            None
        } else {
            Some(PathBuf::from(&record.storage))
        };
        self.spec.backend_kind = Some(record.backend.parse()?);
        self.spec.owner_uid = record.user.parse().map_err(|_| SiloError::InvalidValue {
            message: format!("bad uid '{}'", record.user),
        })?;
        self.spec.owner_gid = record.group.parse().map_err(|_| SiloError::InvalidValue {
            message: format!("bad gid '{}'", record.group),
        })?;
        self.spec.perms = size::parse_octal(&record.permissions)?;
        self.spec.creator = record.creator.clone();
        self.spec.is_ready = parse_bool(&record.ready)?;
        self.spec.private = record.private.clone();
        self.spec.containers = split_escaped(&record.containers, ';');
        self.spec.loop_dev = record.loop_dev.parse().map_err(|_| SiloError::InvalidValue {
            message: format!("bad device index '{}'", record.loop_dev),
        })?;
        self.spec.is_read_only = parse_bool(&record.read_only)?;
        self.spec.layers = split_escaped(&record.layers, ';');
        self.spec.space_limit = size::parse_size(&record.space_limit)?;
        self.spec.space_guarantee = size::parse_size(&record.space_guarantee)?;
        self.spec.inode_limit = size::parse_size(&record.inode_limit)?;
        self.spec.inode_guarantee = size::parse_size(&record.inode_guarantee)?;
        match &record.place {
            Some(place) => {
                self.spec.place = PathBuf::from(place);
                self.spec.custom_place = true;
            }
            None => {
                self.spec.place = self.spec.config.place.clone();
                self.spec.custom_place = false;
            }
        }

        if !self.spec.is_ready {
            return Err(SiloError::Busy {
                message: "volume not ready".to_string(),
            });
        }

        self.open_backend()?;
        let mut backend = self.backend.take().expect("backend just opened");
        let restored = backend.restore(&self.spec);
        self.backend = Some(backend);
        restored
    }

    fn backend_ref(&self) -> SiloResult<&dyn VolumeBackend> {
        self.backend
            .as_deref()
            .ok_or_else(|| SiloError::Unknown {
                message: "volume has no backend".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_table_marks_reflection_read_only() {
        for name in [
            prop::READY,
            prop::CREATOR,
            prop::SPACE_USED,
            prop::INODE_USED,
            prop::SPACE_AVAILABLE,
            prop::INODE_AVAILABLE,
        ] {
            let p = PROPERTIES.iter().find(|p| p.name == name).unwrap();
            assert!(p.read_only, "{} must be read-only", name);
        }
        assert!(
            !PROPERTIES
                .iter()
                .find(|p| p.name == prop::SPACE_LIMIT)
                .unwrap()
                .read_only
        );
    }

    #[test]
    fn bool_values() {
        assert!(parse_bool("true").unwrap());
        assert!(!parse_bool("false").unwrap());
        assert!(parse_bool("yes").is_err());
    }

    #[test]
    fn mount_flags_follow_read_only() {
        let config = Config::default().with_place("/place");
        let mut spec = VolumeSpec::new(config, "1".to_string());
        assert_eq!(spec.mount_flags(), MountFlags::NODEV | MountFlags::NOSUID);

        spec.is_read_only = true;
        assert!(spec.mount_flags().contains(MountFlags::RDONLY));
    }

    #[test]
    fn storage_defaults_to_internal() {
        let config = Config::default().with_place("/place");
        let mut spec = VolumeSpec::new(config, "9".to_string());
        spec.backend_kind = Some(BackendKind::Native);
        assert_eq!(spec.storage(), PathBuf::from("/place/volumes/9/native"));
        assert!(spec.is_auto_storage());

        spec.storage_path = Some(PathBuf::from("/srv/data"));
        assert_eq!(spec.storage(), PathBuf::from("/srv/data"));
        assert!(!spec.is_auto_storage());
    }

    #[test]
    fn internal_paths() {
        let config = Config::default().with_place("/place");
        let spec = VolumeSpec::new(config, "3".to_string());
        assert_eq!(spec.internal(""), PathBuf::from("/place/volumes/3"));
        assert_eq!(
            spec.internal("layer_0"),
            PathBuf::from("/place/volumes/3/layer_0")
        );
    }
}

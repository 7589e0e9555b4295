//! Volume management: pluggable backends, quota guarantees, layered
//! filesystems, crash-safe persistence.

pub mod backend;
pub mod holder;
pub mod layer;
pub mod loopdev;
pub mod quota;
pub mod record;
pub mod recovery;
#[allow(clippy::module_inception)]
pub mod volume;

pub use backend::{BackendKind, VolumeBackend};
pub use holder::VolumeHolder;
pub use quota::ProjectQuota;
pub use record::VolumeRecord;
pub use recovery::{ContainerRegistry, NoContainers};
pub use volume::{Volume, VolumeSpec, PROPERTIES};

//! Startup recovery: record replay, link re-binding, orphan cleanup.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use silo::volume::recovery::{self, ContainerRegistry, NoContainers};
use silo::volume::{Volume, VolumeHolder, VolumeRecord};
use silo::Config;
use tempfile::TempDir;

fn setup() -> (TempDir, VolumeHolder) {
    let dir = TempDir::new().unwrap();
    let config = Config::default()
        .with_place(dir.path())
        .with_state_dir(dir.path().join("state"))
        .without_quota();
    (dir, VolumeHolder::new(config))
}

fn ready_record(id: &str, path: &Path) -> VolumeRecord {
    VolumeRecord {
        id: id.to_string(),
        path: path.display().to_string(),
        auto_path: "false".to_string(),
        storage: String::new(),
        backend: "plain".to_string(),
        user: "0".to_string(),
        group: "0".to_string(),
        permissions: "0775".to_string(),
        creator: "test 0 0".to_string(),
        ready: "true".to_string(),
        private: String::new(),
        containers: String::new(),
        loop_dev: "-1".to_string(),
        read_only: "false".to_string(),
        layers: String::new(),
        space_limit: "0".to_string(),
        space_guarantee: "0".to_string(),
        inode_limit: "0".to_string(),
        inode_guarantee: "0".to_string(),
        place: None,
    }
}

#[test]
fn ready_volumes_come_back() {
    let (dir, holder) = setup();
    let state = holder.config().state_dir.clone();
    let target = dir.path().join("mnt");
    std::fs::create_dir(&target).unwrap();

    ready_record("7", &target).save(&state).unwrap();

    recovery::restore(&holder, &NoContainers).unwrap();

    let arc = holder.find(&target).expect("volume registered");
    let volume = arc.lock().unwrap();
    assert_eq!(volume.id(), "7");
    assert!(volume.is_ready());

    // The record was re-saved during recovery and still reads back.
    let node = VolumeRecord::node_path(&state, "7");
    let record = VolumeRecord::load(&node).unwrap();
    assert_eq!(record.ready, "true");

    // Ids continue past the restored volume.
    assert_eq!(holder.create().id(), "8");
}

#[test]
fn half_built_volumes_are_discarded() {
    let (dir, holder) = setup();
    let state = holder.config().state_dir.clone();
    let target = dir.path().join("mnt");
    std::fs::create_dir(&target).unwrap();

    let mut record = ready_record("3", &target);
    record.ready = "false".to_string();
    record.save(&state).unwrap();

    recovery::restore(&holder, &NoContainers).unwrap();

    assert!(holder.find(&target).is_none());
    assert!(!VolumeRecord::node_path(&state, "3").exists());
}

#[test]
fn unparseable_records_are_unlinked() {
    let (_dir, holder) = setup();
    let state = holder.config().state_dir.clone();

    std::fs::create_dir_all(&state).unwrap();
    let node = state.join("11");
    std::fs::write(&node, b"not json at all").unwrap();

    recovery::restore(&holder, &NoContainers).unwrap();

    assert!(!node.exists());
    assert!(holder.list_paths().is_empty());
}

#[test]
fn orphan_volume_directories_are_removed() {
    let (dir, holder) = setup();
    let state = holder.config().state_dir.clone();
    let target = dir.path().join("mnt");
    std::fs::create_dir(&target).unwrap();

    ready_record("5", &target).save(&state).unwrap();

    let volumes = dir.path().join("volumes");
    let live_dir = volumes.join("5");
    let orphan = volumes.join("99999");
    std::fs::create_dir_all(live_dir.join("plain")).unwrap();
    std::fs::create_dir_all(orphan.join("volume")).unwrap();

    recovery::restore(&holder, &NoContainers).unwrap();

    assert!(live_dir.exists(), "live volume directory must survive");
    assert!(!orphan.exists(), "orphan directory must be removed");
}

#[test]
fn known_containers_are_rebound() {
    struct OneContainer {
        attached: Mutex<Vec<(String, PathBuf)>>,
    }
    impl ContainerRegistry for OneContainer {
        fn exists(&self, name: &str) -> bool {
            name == "web"
        }
        fn attach_volume(&self, name: &str, volume_path: &Path) {
            self.attached
                .lock()
                .unwrap()
                .push((name.to_string(), volume_path.to_path_buf()));
        }
    }

    let (dir, holder) = setup();
    let state = holder.config().state_dir.clone();
    let target = dir.path().join("mnt");
    std::fs::create_dir(&target).unwrap();

    let mut record = ready_record("2", &target);
    record.containers = "web".to_string();
    record.save(&state).unwrap();

    let containers = OneContainer {
        attached: Mutex::new(Vec::new()),
    };
    recovery::restore(&holder, &containers).unwrap();

    assert_eq!(
        containers.attached.lock().unwrap().as_slice(),
        &[("web".to_string(), target.clone())]
    );
    let arc = holder.find(&target).unwrap();
    assert_eq!(arc.lock().unwrap().containers(), &["web".to_string()]);
}

#[test]
fn volumes_with_only_dead_containers_are_destroyed() {
    let (dir, holder) = setup();
    let state = holder.config().state_dir.clone();
    let target = dir.path().join("mnt");
    std::fs::create_dir(&target).unwrap();

    let mut record = ready_record("4", &target);
    record.containers = "gone-container".to_string();
    record.save(&state).unwrap();

    recovery::restore(&holder, &NoContainers).unwrap();

    assert!(holder.find(&target).is_none());
    assert!(!VolumeRecord::node_path(&state, "4").exists());
}

#[test]
fn stale_layer_staging_is_cleared() {
    let (dir, holder) = setup();

    let staged = dir.path().join("layers/_tmp_/leftover");
    std::fs::create_dir_all(&staged).unwrap();
    std::fs::write(staged.join("f"), b"x").unwrap();

    recovery::restore(&holder, &NoContainers).unwrap();

    assert!(dir.path().join("layers/_tmp_").exists());
    assert!(!staged.exists());
}

#[test]
fn destroy_is_idempotent() {
    let (dir, holder) = setup();
    let state = holder.config().state_dir.clone();
    let target = dir.path().join("mnt");
    std::fs::create_dir(&target).unwrap();

    ready_record("6", &target).save(&state).unwrap();
    recovery::restore(&holder, &NoContainers).unwrap();

    holder.destroy_volume(&target).unwrap();
    assert!(!VolumeRecord::node_path(&state, "6").exists());

    // Destroying a never-registered volume again reports not-found,
    // but a fresh volume object over the same gone state succeeds.
    assert!(holder.destroy_volume(&target).is_err());
    let mut volume = Volume::new(holder.config().clone(), "6".to_string());
    let record = ready_record("6", &target);
    volume.restore(&record).unwrap();
    volume.destroy(&holder).unwrap();
}

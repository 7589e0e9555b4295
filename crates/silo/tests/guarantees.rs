//! Cross-volume guarantee accounting.

use std::collections::BTreeMap;
use std::path::Path;

use silo::volume::{VolumeHolder, VolumeRecord};
use silo::Config;
use silo_common::{Cred, SiloError};
use tempfile::TempDir;

fn setup() -> (TempDir, VolumeHolder, Cred) {
    let dir = TempDir::new().unwrap();
    let config = Config::default()
        .with_place(dir.path())
        .with_state_dir(dir.path().join("state"))
        .without_quota();
    std::fs::create_dir_all(dir.path().join("volumes")).unwrap();
    let holder = VolumeHolder::new(config);

    // Safety: geteuid/getegid never fail.
    let cred = Cred::new(unsafe { libc::geteuid() }, unsafe { libc::getegid() });
    (dir, holder, cred)
}

fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Park a ready loop-backend volume carrying a guarantee in the holder,
/// with no on-disk state behind it.
fn park_guaranteed_volume(holder: &VolumeHolder, path: &Path, guarantee: u64) {
    let mut volume = holder.create();
    let record = VolumeRecord {
        id: volume.id().to_string(),
        path: path.display().to_string(),
        auto_path: "false".to_string(),
        storage: String::new(),
        backend: "loop".to_string(),
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
        space_limit: guarantee.to_string(),
        space_guarantee: guarantee.to_string(),
        inode_limit: "0".to_string(),
        inode_guarantee: "0".to_string(),
        place: None,
    };
    volume.restore(&record).unwrap();
    holder.register(volume).unwrap();
}

#[test]
fn impossible_guarantee_is_rejected() {
    let (_dir, holder, cred) = setup();

    let mut volume = holder.create();
    let err = volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[
                ("space_limit", "0"),
                ("space_guarantee", &(u64::MAX / 4).to_string()),
            ]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::NoSpace { .. }), "got {:?}", err);
}

#[test]
fn modest_guarantee_is_accepted() {
    let (_dir, holder, cred) = setup();

    let mut volume = holder.create();
    volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[("space_limit", "8Mi"), ("space_guarantee", "4Ki")]),
            &holder,
        )
        .unwrap();
}

#[test]
fn existing_guarantees_reserve_their_share() {
    let (dir, holder, cred) = setup();

    // Another volume on the same device has guaranteed far more than
    // the filesystem can offer; its unconsumed share blocks newcomers.
    park_guaranteed_volume(&holder, &dir.path().join("other"), u64::MAX / 4);

    let mut volume = holder.create();
    let err = volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[("space_limit", "8Mi"), ("space_guarantee", "4Ki")]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::NoSpace { .. }), "got {:?}", err);
}

#[test]
fn volumes_without_guarantees_claim_nothing() {
    let (dir, holder, cred) = setup();

    // Same arithmetic as above, but the parked volume guarantees zero.
    park_guaranteed_volume(&holder, &dir.path().join("other"), 0);

    let mut volume = holder.create();
    volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[("space_limit", "8Mi"), ("space_guarantee", "4Ki")]),
            &holder,
        )
        .unwrap();
}

//! Configuration-time validation of volumes.

use std::collections::BTreeMap;
use std::path::Path;

use silo::volume::VolumeHolder;
use silo::Config;
use silo_common::{Cred, SiloError};
use tempfile::TempDir;

fn setup() -> (TempDir, VolumeHolder, Cred) {
    let dir = TempDir::new().unwrap();
    let config = Config::default()
        .with_place(dir.path())
        .with_state_dir(dir.path().join("state"))
        .without_quota();
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

#[test]
fn plain_volume_configures() {
    let (dir, holder, cred) = setup();
    let target = dir.path().join("mnt");
    std::fs::create_dir(&target).unwrap();

    let mut volume = holder.create();
    volume
        .configure(
            Some(&target),
            "test",
            &cred,
            Path::new("/"),
            &props(&[("backend", "plain"), ("private", "scratch")]),
            &holder,
        )
        .unwrap();

    assert_eq!(volume.path(), target);
    assert_eq!(volume.spec().private, "scratch");
    assert!(!volume.is_ready());
}

#[test]
fn auto_path_lands_under_the_place() {
    let (dir, holder, cred) = setup();

    let mut volume = holder.create();
    volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[("backend", "plain")]),
            &holder,
        )
        .unwrap();

    let expected = dir.path().join("volumes").join(volume.id()).join("volume");
    assert_eq!(volume.path(), expected);
    assert!(volume.spec().is_auto_path);
}

#[test]
fn unknown_property_is_rejected() {
    let (_dir, holder, cred) = setup();

    let mut volume = holder.create();
    let err = volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[("color", "red")]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::InvalidProperty { .. }));
}

#[test]
fn read_only_properties_are_rejected() {
    let (_dir, holder, cred) = setup();

    for name in ["ready", "creator", "space_used"] {
        let mut volume = holder.create();
        let err = volume
            .configure(
                None,
                "test",
                &cred,
                Path::new("/"),
                &props(&[(name, "1")]),
                &holder,
            )
            .unwrap_err();
        assert!(
            matches!(err, SiloError::InvalidProperty { .. }),
            "{} must be rejected",
            name
        );
    }
}

#[test]
fn missing_path_is_rejected() {
    let (dir, holder, cred) = setup();

    let mut volume = holder.create();
    let err = volume
        .configure(
            Some(&dir.path().join("nonexistent")),
            "test",
            &cred,
            Path::new("/"),
            &props(&[("backend", "plain")]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::InvalidValue { .. }));
}

#[test]
fn relative_and_unnormalized_paths_are_rejected() {
    let (dir, holder, cred) = setup();

    let mut volume = holder.create();
    let err = volume
        .configure(
            Some(Path::new("mnt/vol")),
            "test",
            &cred,
            Path::new("/"),
            &props(&[]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::InvalidValue { .. }));

    let dotted = dir.path().join("..").join("x");
    let mut volume = holder.create();
    let err = volume
        .configure(
            Some(&dotted),
            "test",
            &cred,
            Path::new("/"),
            &props(&[]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::InvalidValue { .. }));
}

#[test]
fn guarantee_above_limit_is_rejected() {
    let (_dir, holder, cred) = setup();

    let mut volume = holder.create();
    let err = volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[
                ("backend", "tmpfs"),
                ("space_limit", "64Mi"),
                ("space_guarantee", "128Mi"),
            ]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::InvalidValue { .. }));
}

#[test]
fn zero_limit_means_unlimited() {
    let (_dir, holder, cred) = setup();

    // A zero limit with a guarantee passes the cross-check.
    let mut volume = holder.create();
    volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[
                ("backend", "plain"),
                ("space_limit", "0"),
            ]),
            &holder,
        )
        .unwrap();
    assert_eq!(volume.spec().space_limit, 0);
    assert!(!volume.spec().have_quota());
}

#[test]
fn plain_backend_rejects_quota() {
    let (_dir, holder, cred) = setup();

    let mut volume = holder.create();
    let err = volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[("backend", "plain"), ("space_limit", "64Mi")]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::NotSupported { .. }));
}

#[test]
fn tmpfs_backend_requires_space_limit() {
    let (_dir, holder, cred) = setup();

    let mut volume = holder.create();
    let err = volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[("backend", "tmpfs")]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::NotSupported { .. }));
}

#[test]
fn quota_backend_requires_a_caller_path() {
    let (_dir, holder, cred) = setup();

    let mut volume = holder.create();
    let err = volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[("backend", "quota"), ("space_limit", "64Mi")]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::NotSupported { .. }));
}

#[test]
fn unknown_backend_is_rejected() {
    let (_dir, holder, cred) = setup();

    let mut volume = holder.create();
    let err = volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[("backend", "zfs")]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::InvalidValue { .. }));
}

#[test]
fn named_layer_must_exist() {
    let (_dir, holder, cred) = setup();

    let mut volume = holder.create();
    let err = volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[("backend", "plain"), ("layers", "missing-layer")]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::LayerNotFound { .. }));
}

#[test]
fn reserved_layer_names_are_rejected() {
    let (_dir, holder, cred) = setup();

    for name in [".", "..", "_tmp_"] {
        let mut volume = holder.create();
        let err = volume
            .configure(
                None,
                "test",
                &cred,
                Path::new("/"),
                &props(&[("backend", "plain"), ("layers", name)]),
                &holder,
            )
            .unwrap_err();
        assert!(
            matches!(err, SiloError::InvalidValue { .. }),
            "layer name '{}' must be rejected",
            name
        );
    }
}

#[test]
fn quota_disabled_autodetect_falls_back_to_loop() {
    let (_dir, holder, cred) = setup();

    // Quota requested, but quotas are globally disabled, so native is
    // out and loop is the only backend left that can enforce it.
    let mut volume = holder.create();
    volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[("space_limit", "64Mi")]),
            &holder,
        )
        .unwrap();
    assert_eq!(volume.spec().kind(), silo::volume::BackendKind::Loop);
}

#[test]
fn non_root_cannot_give_the_volume_away() {
    let (_dir, holder, cred) = setup();
    if cred.is_root() {
        return;
    }

    let other_uid = (cred.uid + 1).to_string();
    let mut volume = holder.create();
    let err = volume
        .configure(
            None,
            "test",
            &cred,
            Path::new("/"),
            &props(&[("backend", "plain"), ("user", &other_uid)]),
            &holder,
        )
        .unwrap_err();
    assert!(matches!(err, SiloError::Permission { .. }));
}

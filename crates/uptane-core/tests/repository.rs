//! Role state machine behaviour against signed fixtures.

mod common;

use chrono::Utc;
use serde_json::json;
use uptane_core::{RepoKind, Repository, VerifyError};

use common::{
    envelope, root_envelope, snapshot_envelope, target_entry, targets_envelope,
    timestamp_envelope, RoleSigners, EXPIRED, EXPIRES,
};

/// A self-consistent initial Root is accepted without expiry checks.
#[test]
fn init_root_accepts_self_signed_anchor() {
    let keys = RoleSigners::from_seed(10);
    let mut repo = Repository::new(RepoKind::Director);
    repo.init_root(&root_envelope(&keys, 1, EXPIRES, &[&keys.root]))
        .unwrap();
    assert_eq!(repo.root_version(), 1);

    // Even an expired anchor installs; the engine gates on expiry itself.
    let mut stale = Repository::new(RepoKind::Director);
    stale
        .init_root(&root_envelope(&keys, 1, EXPIRED, &[&keys.root]))
        .unwrap();
    assert!(stale.root_expired(Utc::now()));
}

/// A Root not signed by its own declared keys is rejected.
#[test]
fn init_root_rejects_foreign_signature() {
    let keys = RoleSigners::from_seed(10);
    let other = RoleSigners::from_seed(50);
    let mut repo = Repository::new(RepoKind::Director);
    let err = repo
        .init_root(&root_envelope(&keys, 1, EXPIRES, &[&other.root]))
        .unwrap_err();
    assert!(matches!(err, VerifyError::MissingSignatures { .. }));
}

/// A body declaring the wrong `_type` is rejected as a role mismatch.
#[test]
fn init_root_rejects_wrong_type() {
    let keys = RoleSigners::from_seed(10);
    let body = json!({"_type": "Targets", "version": 1, "expires": EXPIRES});
    let mut repo = Repository::new(RepoKind::Director);
    let err = repo
        .init_root(&envelope(body, &[&keys.root]))
        .unwrap_err();
    assert!(matches!(err, VerifyError::RoleMismatch { .. }));
}

/// Root v+1 cross-signed by both key sets rotates and bumps the version.
#[test]
fn root_rotation_requires_cross_signing() {
    let old_keys = RoleSigners::from_seed(10);
    let new_keys = RoleSigners::from_seed(50);
    let mut repo = Repository::new(RepoKind::Image);
    repo.init_root(&root_envelope(&old_keys, 1, EXPIRES, &[&old_keys.root]))
        .unwrap();

    // Signed only by the new key: the old root sees no authorized signature.
    let only_new = root_envelope(&new_keys, 2, EXPIRES, &[&new_keys.root]);
    let err = repo.verify_root(&only_new, Utc::now()).unwrap_err();
    assert!(matches!(err, VerifyError::MissingSignatures { .. }));
    assert_eq!(repo.root_version(), 1);

    // Signed by both: accepted.
    let cross_signed = root_envelope(&new_keys, 2, EXPIRES, &[&old_keys.root, &new_keys.root]);
    repo.verify_root(&cross_signed, Utc::now()).unwrap();
    assert_eq!(repo.root_version(), 2);
}

/// Rotation cannot skip versions.
#[test]
fn root_rotation_rejects_version_gap() {
    let keys = RoleSigners::from_seed(10);
    let mut repo = Repository::new(RepoKind::Image);
    repo.init_root(&root_envelope(&keys, 1, EXPIRES, &[&keys.root]))
        .unwrap();
    let err = repo
        .verify_root(&root_envelope(&keys, 3, EXPIRES, &[&keys.root]), Utc::now())
        .unwrap_err();
    assert!(matches!(
        err,
        VerifyError::VersionOutOfOrder { have: 1, got: 3, .. }
    ));
}

/// A rotated-in Root that is already expired is rejected at commit time.
#[test]
fn root_rotation_rejects_expired_candidate() {
    let keys = RoleSigners::from_seed(10);
    let mut repo = Repository::new(RepoKind::Image);
    repo.init_root(&root_envelope(&keys, 1, EXPIRES, &[&keys.root]))
        .unwrap();
    let err = repo
        .verify_root(&root_envelope(&keys, 2, EXPIRED, &[&keys.root]), Utc::now())
        .unwrap_err();
    assert!(matches!(err, VerifyError::ExpiredMetadata { .. }));
}

/// Accepting a new Root invalidates previously verified non-Root roles.
#[test]
fn root_rotation_drops_non_root_state() {
    let keys = RoleSigners::from_seed(10);
    let mut repo = Repository::new(RepoKind::Director);
    repo.init_root(&root_envelope(&keys, 1, EXPIRES, &[&keys.root]))
        .unwrap();
    let targets = targets_envelope(
        &keys,
        1,
        EXPIRES,
        json!({"app.bin": target_entry(b"payload", &[("ecu-1", "hw-1")], "BINARY")}),
    );
    repo.verify_targets(&targets, Utc::now()).unwrap();
    assert_eq!(repo.targets().len(), 1);

    repo.verify_root(
        &root_envelope(&keys, 2, EXPIRES, &[&keys.root]),
        Utc::now(),
    )
    .unwrap();
    assert!(repo.targets().is_empty());
}

/// The Image chain verifies in dependency order and surfaces the targets.
#[test]
fn image_chain_verifies_in_order() {
    let keys = RoleSigners::from_seed(20);
    let mut repo = Repository::new(RepoKind::Image);
    repo.init_root(&root_envelope(&keys, 1, EXPIRES, &[&keys.root]))
        .unwrap();

    let targets = targets_envelope(
        &keys,
        4,
        EXPIRES,
        json!({"rootfs": target_entry(b"image-bytes", &[], "OSTREE")}),
    );
    let snapshot = snapshot_envelope(&keys, 4, EXPIRES, 4);
    let timestamp = timestamp_envelope(&keys, 4, EXPIRES, &snapshot);

    repo.verify_timestamp(&timestamp, Utc::now()).unwrap();
    repo.verify_snapshot(&snapshot, Utc::now()).unwrap();
    repo.verify_targets(&targets, Utc::now()).unwrap();

    let trusted = repo.targets();
    assert_eq!(trusted.len(), 1);
    assert_eq!(trusted[0].filename, "rootfs");
    assert!(repo.target("rootfs").is_some());
    assert!(repo.target("missing").is_none());
}

/// Snapshot bytes must match the hash pinned by the Timestamp.
#[test]
fn snapshot_must_match_timestamp_hash() {
    let keys = RoleSigners::from_seed(20);
    let mut repo = Repository::new(RepoKind::Image);
    repo.init_root(&root_envelope(&keys, 1, EXPIRES, &[&keys.root]))
        .unwrap();

    let snapshot = snapshot_envelope(&keys, 2, EXPIRES, 2);
    let timestamp = timestamp_envelope(&keys, 2, EXPIRES, &snapshot);
    repo.verify_timestamp(&timestamp, Utc::now()).unwrap();

    // Same length, different bytes: the hash gate fires before signatures.
    let mut tampered = snapshot.clone();
    let idx = tampered.len() / 2;
    tampered[idx] = tampered[idx].wrapping_add(1);
    let err = repo.verify_snapshot(&tampered, Utc::now()).unwrap_err();
    assert!(matches!(err, VerifyError::HashMismatch { .. }));

    // Different length fails the length gate without being parsed.
    let mut padded = snapshot.clone();
    padded.push(b' ');
    let err = repo.verify_snapshot(&padded, Utc::now()).unwrap_err();
    assert!(matches!(err, VerifyError::LengthMismatch { .. }));

    repo.verify_snapshot(&snapshot, Utc::now()).unwrap();
}

/// Snapshot without a previously accepted Timestamp is a dependency error.
#[test]
fn snapshot_requires_timestamp() {
    let keys = RoleSigners::from_seed(20);
    let mut repo = Repository::new(RepoKind::Image);
    repo.init_root(&root_envelope(&keys, 1, EXPIRES, &[&keys.root]))
        .unwrap();
    let snapshot = snapshot_envelope(&keys, 1, EXPIRES, 1);
    let err = repo.verify_snapshot(&snapshot, Utc::now()).unwrap_err();
    assert!(matches!(err, VerifyError::NotFound { .. }));
}

/// Targets version must equal the Snapshot's expectation.
#[test]
fn targets_version_must_match_snapshot() {
    let keys = RoleSigners::from_seed(20);
    let mut repo = Repository::new(RepoKind::Image);
    repo.init_root(&root_envelope(&keys, 1, EXPIRES, &[&keys.root]))
        .unwrap();

    let snapshot = snapshot_envelope(&keys, 3, EXPIRES, 3);
    let timestamp = timestamp_envelope(&keys, 3, EXPIRES, &snapshot);
    repo.verify_timestamp(&timestamp, Utc::now()).unwrap();
    repo.verify_snapshot(&snapshot, Utc::now()).unwrap();

    let stale_targets = targets_envelope(&keys, 2, EXPIRES, json!({}));
    let err = repo.verify_targets(&stale_targets, Utc::now()).unwrap_err();
    assert!(matches!(
        err,
        VerifyError::VersionOutOfOrder { have: 3, got: 2, .. }
    ));
}

/// Expired non-Root roles are rejected.
#[test]
fn expired_targets_are_rejected() {
    let keys = RoleSigners::from_seed(20);
    let mut repo = Repository::new(RepoKind::Director);
    repo.init_root(&root_envelope(&keys, 1, EXPIRES, &[&keys.root]))
        .unwrap();
    let targets = targets_envelope(&keys, 1, EXPIRED, json!({}));
    let err = repo.verify_targets(&targets, Utc::now()).unwrap_err();
    assert!(matches!(err, VerifyError::ExpiredMetadata { .. }));
}

/// Within one repository lifetime, non-Root versions never regress.
#[test]
fn targets_version_never_regresses() {
    let keys = RoleSigners::from_seed(20);
    let mut repo = Repository::new(RepoKind::Director);
    repo.init_root(&root_envelope(&keys, 1, EXPIRES, &[&keys.root]))
        .unwrap();

    repo.verify_targets(&targets_envelope(&keys, 7, EXPIRES, json!({})), Utc::now())
        .unwrap();
    let err = repo
        .verify_targets(&targets_envelope(&keys, 6, EXPIRES, json!({})), Utc::now())
        .unwrap_err();
    assert!(matches!(
        err,
        VerifyError::VersionOutOfOrder { have: 7, got: 6, .. }
    ));
    assert_eq!(repo.targets_version(), 7);
}

/// A duplicated signature from one key counts once toward the threshold.
#[test]
fn duplicate_signatures_do_not_meet_threshold() {
    let keys = RoleSigners::from_seed(30);
    let body = keys.root_body(1, EXPIRES, 2);
    let doubled = envelope(body, &[&keys.root, &keys.root]);
    let mut repo = Repository::new(RepoKind::Director);
    let err = repo.init_root(&doubled).unwrap_err();
    assert!(matches!(
        err,
        VerifyError::BadThreshold { valid: 1, threshold: 2, .. }
    ));
}

/// A corrupted signature from an authorized key fails verification.
#[test]
fn corrupted_signature_is_rejected() {
    let keys = RoleSigners::from_seed(30);
    let bytes = root_envelope(&keys, 1, EXPIRES, &[&keys.root]);
    let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let sig = value["signatures"][0]["sig"].as_str().unwrap().to_string();
    value["signatures"][0]["sig"] = json!(common::corrupt_signature(&sig));
    let mut repo = Repository::new(RepoKind::Director);
    let err = repo
        .init_root(&serde_json::to_vec(&value).unwrap())
        .unwrap_err();
    assert!(matches!(err, VerifyError::BadSignature { .. }));
}

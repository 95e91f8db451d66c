//! End-to-end engine behaviour against a scripted backend.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ota_agent::{
    AgentConfig, BinaryDriver, Bootloader, Command, DriverKind, Event, MetaStore, OstreeDriver,
    PackageDriver, PendingInstall, ResultCode, Secondary, UpdateEngine, VirtualSecondary,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use uptane_core::{extract_version_untrusted, RepoKind, Role};

use common::{
    serve_director, serve_image, serve_registration, target_entry, MockTransport, RoleSigners,
    DIRECTOR_URL, GATEWAY_URL, IMAGE_URL, TREEHUB_URL,
};

fn agent_config(dir: &Path, driver: DriverKind) -> AgentConfig {
    AgentConfig {
        director_url: DIRECTOR_URL.to_string(),
        image_url: IMAGE_URL.to_string(),
        gateway_url: GATEWAY_URL.to_string(),
        treehub_url: TREEHUB_URL.to_string(),
        device_id: Some("device-1".to_string()),
        primary_serial: Some("primary-1".to_string()),
        primary_hardware_id: "hw-primary".to_string(),
        storage_path: dir.join("storage"),
        images_path: dir.join("images"),
        package_driver: driver,
        reboot_flag: dir.join("need_reboot"),
        ..AgentConfig::default()
    }
}

async fn recv_event(events: &mut broadcast::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an engine event")
        .expect("event channel closed")
}

/// Fetch, download, and install flow through the command loop, with the
/// firmware reaching both the Primary and a Virtual Secondary.
#[tokio::test]
async fn full_update_cycle_installs_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());
    serve_registration(&transport);

    let payload = b"firmware-payload";
    let director_keys = RoleSigners::from_seed(10);
    let image_keys = RoleSigners::from_seed(60);
    serve_director(
        &transport,
        &director_keys,
        1,
        json!({"app.bin": target_entry(payload, &[("primary-1", "hw-primary"), ("sec-1", "hw-sec")], "BINARY")}),
    );
    serve_image(
        &transport,
        &image_keys,
        1,
        json!({"app.bin": target_entry(payload, &[], "BINARY")}),
    );
    transport.route(&format!("{IMAGE_URL}/targets/app.bin"), payload.to_vec());

    let storage = MetaStore::open_ephemeral().unwrap();
    let driver = PackageDriver::Binary(
        BinaryDriver::new(dir.path().join("images"), IMAGE_URL).unwrap(),
    );
    let secondary_dir = dir.path().join("sec-1");
    let secondary = Secondary::Virtual(
        VirtualSecondary::new(&secondary_dir, "sec-1", "hw-sec").unwrap(),
    );

    let mut engine = UpdateEngine::new(
        agent_config(dir.path(), DriverKind::Binary),
        storage.clone(),
        Arc::clone(&transport),
        driver,
        vec![secondary],
    );
    let mut events = engine.subscribe();

    let (tx, rx) = mpsc::channel(8);
    let runner = tokio::spawn(async move { engine.run(rx).await });

    tx.send(Command::FetchMeta).await.unwrap();
    let updates = match recv_event(&mut events).await {
        Event::FetchMetaComplete { updates } => updates,
        other => panic!("expected FetchMetaComplete, got {other:?}"),
    };
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].filename, "app.bin");

    tx.send(Command::StartDownload(updates.clone())).await.unwrap();
    match recv_event(&mut events).await {
        Event::DownloadComplete { downloaded, failed } => {
            assert_eq!(downloaded.len(), 1);
            assert!(failed.is_empty());
        }
        other => panic!("expected DownloadComplete, got {other:?}"),
    }

    tx.send(Command::Install(updates)).await.unwrap();
    match recv_event(&mut events).await {
        Event::InstallComplete { results } => {
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].code, ResultCode::Ok);
        }
        other => panic!("expected InstallComplete, got {other:?}"),
    }

    tx.send(Command::Shutdown).await.unwrap();
    runner.await.unwrap().unwrap();

    // Manifest made it out, the secondary holds the image bytes and roots.
    assert!(!transport.puts_to("/manifest").is_empty());
    assert_eq!(
        std::fs::read(secondary_dir.join("firmware.bin")).unwrap(),
        payload
    );
    assert!(secondary_dir.join("director_roots/1.root.json").exists());
    assert!(secondary_dir.join("metadata/image_targets.json").exists());
    // The installed-version log recorded the primary's success.
    assert_eq!(
        storage.installed_filename("primary-1").unwrap().as_deref(),
        Some("app.bin")
    );
    // The download report was delivered at least once.
    assert!(!transport.puts_to("/events").is_empty());
}

/// Stored Director Targets newer than the repository's copy is a rollback:
/// the iteration fails and storage keeps the newer version.
#[tokio::test]
async fn remote_targets_older_than_stored_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());
    serve_registration(&transport);

    let director_keys = RoleSigners::from_seed(10);
    // Routed at an unknown ECU so no image-repo refresh is needed.
    let ghost = json!({"x.bin": target_entry(b"payload", &[("ghost", "hw-g")], "BINARY")});
    serve_director(&transport, &director_keys, 7, ghost.clone());

    let storage = MetaStore::open_ephemeral().unwrap();
    let driver = PackageDriver::Binary(
        BinaryDriver::new(dir.path().join("images"), IMAGE_URL).unwrap(),
    );
    let mut engine = UpdateEngine::new(
        agent_config(dir.path(), DriverKind::Binary),
        storage.clone(),
        Arc::clone(&transport),
        driver,
        Vec::new(),
    );
    let mut events = engine.subscribe();

    let (tx, rx) = mpsc::channel(8);
    let runner = tokio::spawn(async move { engine.run(rx).await });

    tx.send(Command::FetchMeta).await.unwrap();
    match recv_event(&mut events).await {
        // The unknown serial is skipped, so there is no work, but v7 lands
        // in storage.
        Event::FetchMetaComplete { updates } => assert!(updates.is_empty()),
        other => panic!("expected FetchMetaComplete, got {other:?}"),
    }

    // The repository now replays an older, validly signed Targets.
    transport.route(
        &format!("{DIRECTOR_URL}/targets.json"),
        common::targets_envelope(&director_keys, 6, ghost),
    );
    tx.send(Command::FetchMeta).await.unwrap();
    match recv_event(&mut events).await {
        Event::Error { command, message } => {
            assert_eq!(command, "FetchMeta");
            assert!(message.contains("rollback"), "unexpected message: {message}");
        }
        other => panic!("expected Error, got {other:?}"),
    }

    tx.send(Command::Shutdown).await.unwrap();
    runner.await.unwrap().unwrap();

    let stored = storage
        .load_non_root(RepoKind::Director, Role::Targets)
        .unwrap()
        .expect("targets stored");
    assert_eq!(extract_version_untrusted(&stored), 7);
}

/// After a reboot into the wrong image, finalization reports the rollback
/// and clears the reboot flag.
#[tokio::test]
async fn finalize_detects_wrong_version_booted() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());
    serve_registration(&transport);

    let expected_hash = "aa".repeat(32);
    let booted_hash = "bb".repeat(32);

    let ostree = OstreeDriver::new(dir.path().join("sysroot"), TREEHUB_URL).unwrap();
    ostree.set_booted("rootfs", &booted_hash).unwrap();

    let storage = MetaStore::open_ephemeral().unwrap();
    storage
        .set_pending_install(Some(&PendingInstall {
            filename: "rootfs".to_string(),
            sha256: expected_hash,
        }))
        .unwrap();

    let config = agent_config(dir.path(), DriverKind::Ostree);
    Bootloader::new(&config.reboot_flag).set_reboot_flag();

    let mut engine = UpdateEngine::new(
        config.clone(),
        storage.clone(),
        Arc::clone(&transport),
        PackageDriver::Ostree(ostree),
        Vec::new(),
    );
    let mut events = engine.subscribe();
    engine.initialize().await.unwrap();

    match recv_event(&mut events).await {
        Event::FinalizeComplete { result } => {
            assert_eq!(result.code, ResultCode::InstallFailed);
            assert_eq!(result.description, "Wrong version booted");
        }
        other => panic!("expected FinalizeComplete, got {other:?}"),
    }
    // Result persisted for the next manifest, marker and flag consumed.
    let stored = storage.load_installation_result().unwrap().unwrap();
    assert_eq!(stored.code, ResultCode::InstallFailed);
    assert_eq!(storage.pending_install().unwrap(), None);
    assert!(!config.reboot_flag.exists());
}

/// A refusing secondary is isolated: the primary still installs and the
/// refusal never fails the command.
#[tokio::test]
async fn refusing_secondary_does_not_poison_install() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());
    serve_registration(&transport);

    let payload = b"firmware-payload";
    let director_keys = RoleSigners::from_seed(10);
    let image_keys = RoleSigners::from_seed(60);
    serve_director(
        &transport,
        &director_keys,
        1,
        json!({"app.bin": target_entry(payload, &[("primary-1", "hw-primary"), ("sec-1", "hw-sec")], "BINARY")}),
    );
    serve_image(
        &transport,
        &image_keys,
        1,
        json!({"app.bin": target_entry(payload, &[], "BINARY")}),
    );
    transport.route(&format!("{IMAGE_URL}/targets/app.bin"), payload.to_vec());

    let storage = MetaStore::open_ephemeral().unwrap();
    let driver = PackageDriver::Binary(
        BinaryDriver::new(dir.path().join("images"), IMAGE_URL).unwrap(),
    );
    let secondary_dir = dir.path().join("sec-1");
    let mut refusing = VirtualSecondary::new(&secondary_dir, "sec-1", "hw-sec").unwrap();
    refusing.refuse_pushes(true);

    let mut engine = UpdateEngine::new(
        agent_config(dir.path(), DriverKind::Binary),
        storage.clone(),
        Arc::clone(&transport),
        driver,
        vec![Secondary::Virtual(refusing)],
    );
    let mut events = engine.subscribe();

    let (tx, rx) = mpsc::channel(8);
    let runner = tokio::spawn(async move { engine.run(rx).await });

    tx.send(Command::FetchMeta).await.unwrap();
    let updates = match recv_event(&mut events).await {
        Event::FetchMetaComplete { updates } => updates,
        other => panic!("expected FetchMetaComplete, got {other:?}"),
    };
    tx.send(Command::StartDownload(updates.clone())).await.unwrap();
    recv_event(&mut events).await;
    tx.send(Command::Install(updates)).await.unwrap();
    match recv_event(&mut events).await {
        Event::InstallComplete { results } => {
            assert_eq!(results[0].code, ResultCode::Ok);
        }
        other => panic!("expected InstallComplete, got {other:?}"),
    }
    tx.send(Command::Shutdown).await.unwrap();
    runner.await.unwrap().unwrap();

    // The refusal kept firmware away from the secondary but not the primary.
    assert!(!secondary_dir.join("firmware.bin").exists());
    assert_eq!(
        storage.installed_filename("primary-1").unwrap().as_deref(),
        Some("app.bin")
    );
}

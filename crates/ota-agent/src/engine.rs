//! The top-level update state machine.
//!
//! A single long-lived loop consumes commands from an mpsc channel and
//! drives each to completion before reading the next. Network I/O is
//! logically blocking from the engine's perspective; cancellation is
//! cooperative through the shared [`FlowControlToken`]. Events and reports
//! are queued outward and never block the loop.
//!
//! Failure policy: per-target and per-Secondary failures are isolated and
//! logged, whole-iteration failures surface as a single error event, and a
//! provisioning failure is fatal.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uptane_core::{
    extract_version_untrusted, Ed25519Signer, RepoKind, Repository, Role, Target,
};

use crate::bootloader::Bootloader;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::events::{Command, EngineState, Event};
use crate::fetcher::Fetcher;
use crate::flow::FlowControlToken;
use crate::manifest;
use crate::package::{InstallationResult, PackageDriver, ResultCode};
use crate::provision::{ensure_provisioned, DeviceIdentity};
use crate::report::ReportQueue;
use crate::resolver::{self, EcuInventory};
use crate::secondary::{RawMetaPack, Secondary};
use crate::storage::{
    EcuState, InstalledVersion, MetaStore, MisconfiguredEcu, PendingInstall,
};
use crate::transport::Transport;

/// Upper bound on Root versions walked in one iteration; stops infinite
/// rotation attacks from pinning the device in a fetch loop.
const ROOT_ROTATION_LIMIT: u64 = 1024;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The Uptane update engine for one Primary ECU.
pub struct UpdateEngine<T: Transport> {
    config: AgentConfig,
    storage: MetaStore,
    transport: Arc<T>,
    fetcher: Fetcher<T>,
    director: Repository,
    image: Repository,
    driver: PackageDriver,
    secondaries: BTreeMap<String, Secondary>,
    bootloader: Bootloader,
    reports: ReportQueue,
    token: FlowControlToken,
    events_tx: broadcast::Sender<Event>,
    state: EngineState,
    identity: Option<DeviceIdentity>,
    signer: Option<Ed25519Signer>,
    installed_images: BTreeMap<String, String>,
}

impl<T: Transport> UpdateEngine<T> {
    pub fn new(
        config: AgentConfig,
        storage: MetaStore,
        transport: Arc<T>,
        driver: PackageDriver,
        secondaries: Vec<Secondary>,
    ) -> Self {
        let fetcher = Fetcher::new(
            Arc::clone(&transport),
            &config.director_url,
            &config.image_url,
        );
        let bootloader = Bootloader::new(&config.reboot_flag);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut map = BTreeMap::new();
        for secondary in secondaries {
            let serial = secondary.serial().to_string();
            if map.insert(serial.clone(), secondary).is_some() {
                error!(%serial, "multiple secondaries share one serial, keeping the last");
            }
        }
        Self {
            config,
            storage,
            transport,
            fetcher,
            director: Repository::new(RepoKind::Director),
            image: Repository::new(RepoKind::Image),
            driver,
            secondaries: map,
            bootloader,
            reports: ReportQueue::new(),
            token: FlowControlToken::new(),
            events_tx,
            state: EngineState::Uninitialized,
            identity: None,
            signer: None,
            installed_images: BTreeMap::new(),
        }
    }

    /// Subscribes to the engine's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// The cancellation token shared with transport and drivers.
    pub fn token(&self) -> FlowControlToken {
        self.token.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// How long the outer driver should sleep between `FetchMeta` commands.
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.poll_interval_secs)
    }

    fn emit(&self, event: Event) {
        // No receivers is fine; events never block or fail the engine.
        let _ = self.events_tx.send(event);
    }

    fn signer(&self) -> Result<&Ed25519Signer, AgentError> {
        self.signer
            .as_ref()
            .ok_or_else(|| AgentError::Configuration("engine not provisioned".to_string()))
    }

    fn identity(&self) -> Result<&DeviceIdentity, AgentError> {
        self.identity
            .as_ref()
            .ok_or_else(|| AgentError::Configuration("engine not provisioned".to_string()))
    }

    /// Provisions the device and reconciles post-reboot state.
    ///
    /// Failure here is fatal; the engine must not serve commands without an
    /// identity and registered credentials.
    pub async fn initialize(&mut self) -> Result<(), AgentError> {
        let secondary_refs: Vec<&Secondary> = self.secondaries.values().collect();
        let (identity, signer) = ensure_provisioned(
            &self.config,
            &self.storage,
            self.transport.as_ref(),
            &secondary_refs,
        )
        .await?;
        info!(device_id = %identity.device_id, serial = %identity.primary_serial, "provisioned");
        self.identity = Some(identity);
        self.signer = Some(signer);
        self.state = EngineState::Provisioned;

        self.verify_secondaries()?;

        // Boot is considered successful as soon as we start; a missing
        // network or unreachable secondaries are not reasons to roll back.
        if self.driver.image_updated() {
            self.bootloader.set_boot_ok();
        }
        if self.bootloader.reboot_detected() {
            self.finalize_pending()?;
        }

        self.state = EngineState::Idle;
        Ok(())
    }

    /// Runs the command loop until `Shutdown` or channel closure.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<Command>) -> Result<(), AgentError> {
        self.initialize().await?;
        while let Some(command) = commands.recv().await {
            info!(command = command.name(), "got command");
            if matches!(command, Command::Shutdown) {
                break;
            }
            let name = command.name();
            if let Err(err) = self.dispatch(command).await {
                error!(command = name, %err, "command failed");
                self.emit(Event::Error {
                    command: name,
                    message: err.to_string(),
                });
                self.state = EngineState::Idle;
            }
            self.flush_reports().await;
        }
        self.storage.flush()?;
        Ok(())
    }

    async fn dispatch(&mut self, command: Command) -> Result<(), AgentError> {
        match command {
            Command::SendDeviceData => self.send_device_data().await,
            Command::PutManifest => {
                if self.put_manifest().await? {
                    self.emit(Event::PutManifestComplete);
                    Ok(())
                } else {
                    Err(AgentError::Configuration(
                        "could not put manifest".to_string(),
                    ))
                }
            }
            Command::FetchMeta => self.fetch_meta().await,
            Command::CheckUpdates => self.check_updates(),
            Command::StartDownload(targets) => self.download(&targets).await,
            Command::Install(targets) => self.install(&targets).await,
            Command::Shutdown => Ok(()),
        }
    }

    async fn flush_reports(&mut self) {
        if self.reports.is_empty() {
            return;
        }
        let url = format!("{}/events", self.config.gateway_url.trim_end_matches('/'));
        self.reports.flush(self.transport.as_ref(), &url).await;
    }

    /// Diffs the stored ECU registry against the live inventory and records
    /// every disagreement.
    fn verify_secondaries(&mut self) -> Result<(), AgentError> {
        let stored = self.storage.load_ecu_serials()?;
        if stored.is_empty() {
            return Err(AgentError::Configuration(
                "no ECU serials found in storage".to_string(),
            ));
        }
        let primary_serial = self.identity()?.primary_serial.clone();
        let mut misconfigured = Vec::new();
        let mut found: HashSet<&str> = HashSet::new();
        found.insert(primary_serial.as_str());

        for (serial, secondary) in &self.secondaries {
            if stored.iter().any(|ecu| &ecu.serial == serial) {
                found.insert(serial.as_str());
            } else {
                error!(%serial, "secondary not found in storage");
                misconfigured.push(MisconfiguredEcu {
                    serial: serial.clone(),
                    hardware_id: secondary.hw_id().to_string(),
                    state: EcuState::NotRegistered,
                });
            }
        }
        for ecu in &stored {
            if !found.contains(ecu.serial.as_str()) {
                warn!(serial = %ecu.serial, "stored ECU no longer reported by the device");
                misconfigured.push(MisconfiguredEcu {
                    serial: ecu.serial.clone(),
                    hardware_id: ecu.hardware_id.clone(),
                    state: EcuState::Old,
                });
            }
        }
        self.storage.store_misconfigured_ecus(&misconfigured)?;
        Ok(())
    }

    /// Rebuilds the hardware-id and installed-image view used by selection.
    fn refresh_inventory(&mut self) -> Result<EcuInventory, AgentError> {
        let primary_serial = self.identity()?.primary_serial.clone();
        if let Some(current) = self.driver.current() {
            self.installed_images
                .insert(primary_serial.clone(), current.filename);
        }
        for (serial, secondary) in &self.secondaries {
            let Ok(sec_manifest) = secondary.manifest() else {
                warn!(%serial, "secondary did not produce a manifest");
                continue;
            };
            if !manifest::verify_ecu_manifest(&sec_manifest, &secondary.public_key()) {
                error!(%serial, "secondary manifest verification failed");
                continue;
            }
            if let Some(filepath) = manifest::installed_filepath(&sec_manifest) {
                self.installed_images.insert(serial.clone(), filepath);
            }
        }

        let mut hw_ids = BTreeMap::new();
        for ecu in self.storage.load_ecu_serials()? {
            hw_ids.insert(ecu.serial, ecu.hardware_id);
        }
        Ok(EcuInventory {
            hw_ids,
            installed: self.installed_images.clone(),
        })
    }

    async fn send_device_data(&mut self) -> Result<(), AgentError> {
        let identity = self.identity()?;
        let gateway = self.config.gateway_url.trim_end_matches('/').to_string();

        let hardware_info = json!({
            "id": identity.device_id,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "primary_hardware_id": identity.primary_hw_id,
        });
        self.transport
            .put(&format!("{gateway}/system_info"), &hardware_info)
            .await?;

        let packages = serde_json::to_value(self.driver.installed_packages())
            .map_err(|err| AgentError::Parse(err.to_string()))?;
        self.transport
            .put(&format!("{gateway}/core/installed"), &packages)
            .await?;

        self.put_manifest().await?;
        self.emit(Event::SendDeviceDataComplete);
        Ok(())
    }

    /// Assembles, signs, and puts the device manifest.
    ///
    /// Returns `Ok(false)` when the PUT was skipped because an included ECU
    /// still reports an in-progress operation.
    async fn put_manifest(&mut self) -> Result<bool, AgentError> {
        let identity = self.identity()?.clone();
        let primary_report = manifest::primary_version_report(
            &identity.primary_serial,
            self.driver.current().as_ref(),
            self.storage.load_installation_result()?.as_ref(),
        );

        let mut secondary_entries = Vec::new();
        for (serial, secondary) in &self.secondaries {
            match secondary.manifest() {
                Ok(sec_manifest) => secondary_entries.push((
                    serial.clone(),
                    sec_manifest,
                    secondary.public_key(),
                )),
                Err(err) => error!(%serial, %err, "secondary manifest unavailable"),
            }
        }
        let manifests = manifest::assemble(
            &identity.primary_serial,
            primary_report,
            self.signer()?,
            secondary_entries,
        );

        // Remember what everything runs before deciding anything is new.
        for (serial, entry) in manifests.as_object().into_iter().flatten() {
            if let Some(filepath) = manifest::installed_filepath(entry) {
                self.installed_images.insert(serial.clone(), filepath);
            }
        }

        if manifest::has_pending_updates(&manifests) {
            warn!("an ECU reports an in-progress operation, skipping manifest PUT");
            return Ok(false);
        }

        let signed = self.signer()?.envelope(manifests);
        let url = format!(
            "{}/manifest",
            self.config.director_url.trim_end_matches('/')
        );
        self.transport.put(&url, &signed).await?;
        Ok(true)
    }

    /// Online metadata refresh: manifest first, then Director, then Image
    /// when the Director yields new work.
    async fn fetch_meta(&mut self) -> Result<(), AgentError> {
        self.state = EngineState::FetchingMeta;
        if !self.put_manifest().await? {
            return Err(AgentError::Configuration(
                "could not put manifest".to_string(),
            ));
        }

        self.update_director_meta().await?;
        let inventory = self.refresh_inventory()?;
        let pre_pass = resolver::select(&self.director.targets(), None, &inventory)
            .map_err(|err| AgentError::TargetMismatch(err.to_string()))?;

        let updates = if pre_pass.is_empty() {
            Vec::new()
        } else {
            info!(count = pre_pass.len(), "director yields new work");
            self.update_image_meta().await?;
            resolver::select(
                &self.director.targets(),
                Some(&self.image.targets()),
                &inventory,
            )
            .map_err(|err| AgentError::TargetMismatch(err.to_string()))?
        };

        self.state = if updates.is_empty() {
            EngineState::Idle
        } else {
            EngineState::UpdatesAvailable
        };
        self.emit(Event::FetchMetaComplete { updates });
        Ok(())
    }

    /// Walks Root versions from `current + 1` to the repository's latest.
    async fn walk_root_chain(&mut self, repo: RepoKind) -> Result<(), AgentError> {
        let latest_bytes = self
            .fetcher
            .fetch_latest_role(repo, Role::Root, &self.token)
            .await?;
        let remote_version = extract_version_untrusted(&latest_bytes);
        let local_version = self.repo(repo).root_version();
        if remote_version > local_version + ROOT_ROTATION_LIMIT {
            return Err(AgentError::MetadataRollback(format!(
                "{repo} root advanced from {local_version} to {remote_version}, beyond the rotation bound"
            )));
        }

        let now = Utc::now();
        for version in (local_version + 1)..=remote_version {
            let bytes = if version == remote_version {
                latest_bytes.clone()
            } else {
                self.fetcher
                    .fetch_role(repo, Role::Root, Some(version), &self.token)
                    .await?
            };
            self.repo_mut(repo).verify_root(&bytes, now)?;
            self.storage.store_root(repo, version, &bytes)?;
            self.storage.clear_non_root(repo)?;
        }
        self.repo(repo).check_root_expired(now)?;
        Ok(())
    }

    /// Ensures a trust anchor exists for the repository, fetching version 1
    /// when storage holds nothing yet.
    async fn ensure_root_anchor(&mut self, repo: RepoKind) -> Result<(), AgentError> {
        match self.storage.load_latest_root(repo)? {
            Some(bytes) => {
                self.repo_mut(repo).init_root(&bytes)?;
            }
            None => {
                let bytes = self
                    .fetcher
                    .fetch_role(repo, Role::Root, Some(1), &self.token)
                    .await?;
                self.repo_mut(repo).init_root(&bytes)?;
                self.storage.store_root(repo, 1, &bytes)?;
            }
        }
        Ok(())
    }

    /// Fetches, verifies, and stores one non-Root role, enforcing the
    /// cross-restart monotonicity rule against the stored copy.
    async fn refresh_non_root(&mut self, repo: RepoKind, role: Role) -> Result<(), AgentError> {
        let bytes = self
            .fetcher
            .fetch_latest_role(repo, role, &self.token)
            .await?;
        let remote_version = extract_version_untrusted(&bytes);
        let local_version = self
            .storage
            .load_non_root(repo, role)?
            .map(|stored| extract_version_untrusted(&stored));

        let now = Utc::now();
        match role {
            Role::Timestamp => self.repo_mut(repo).verify_timestamp(&bytes, now)?,
            Role::Snapshot => self.repo_mut(repo).verify_snapshot(&bytes, now)?,
            Role::Targets => self.repo_mut(repo).verify_targets(&bytes, now)?,
            Role::Root => unreachable!("roots go through the rotation walk"),
        }

        match local_version {
            Some(local) if local > remote_version => {
                // Stored metadata is newer than what the repository serves:
                // rollback. Storage stays untouched.
                return Err(AgentError::MetadataRollback(format!(
                    "{repo} {role} regressed from stored version {local} to {remote_version}"
                )));
            }
            Some(local) if local == remote_version => {}
            _ => self.storage.store_non_root(repo, role, &bytes)?,
        }
        Ok(())
    }

    async fn update_director_meta(&mut self) -> Result<(), AgentError> {
        self.director.reset_meta();
        self.ensure_root_anchor(RepoKind::Director).await?;
        self.walk_root_chain(RepoKind::Director).await?;
        self.refresh_non_root(RepoKind::Director, Role::Targets)
            .await
    }

    async fn update_image_meta(&mut self) -> Result<(), AgentError> {
        self.image.reset_meta();
        self.ensure_root_anchor(RepoKind::Image).await?;
        self.walk_root_chain(RepoKind::Image).await?;
        self.refresh_non_root(RepoKind::Image, Role::Timestamp)
            .await?;
        self.refresh_non_root(RepoKind::Image, Role::Snapshot)
            .await?;
        self.refresh_non_root(RepoKind::Image, Role::Targets).await
    }

    /// Loads and verifies one non-Root role from storage only.
    fn check_non_root_offline(&mut self, repo: RepoKind, role: Role) -> Result<(), AgentError> {
        let bytes = self
            .storage
            .load_non_root(repo, role)?
            .ok_or(AgentError::MetadataInvalid(
                uptane_core::VerifyError::NotFound { repo, role },
            ))?;
        let now = Utc::now();
        match role {
            Role::Timestamp => self.repo_mut(repo).verify_timestamp(&bytes, now)?,
            Role::Snapshot => self.repo_mut(repo).verify_snapshot(&bytes, now)?,
            Role::Targets => self.repo_mut(repo).verify_targets(&bytes, now)?,
            Role::Root => unreachable!("roots go through init_root"),
        }
        Ok(())
    }

    /// Rebuilds the trusted view from storage without touching the network.
    fn check_repo_offline(&mut self, repo: RepoKind) -> Result<(), AgentError> {
        self.repo_mut(repo).reset_meta();
        let root = self
            .storage
            .load_latest_root(repo)?
            .ok_or(AgentError::MetadataInvalid(
                uptane_core::VerifyError::NotFound {
                    repo,
                    role: Role::Root,
                },
            ))?;
        self.repo_mut(repo).init_root(&root)?;
        self.repo(repo).check_root_expired(Utc::now())?;

        if repo == RepoKind::Image {
            self.check_non_root_offline(repo, Role::Timestamp)?;
            self.check_non_root_offline(repo, Role::Snapshot)?;
        }
        self.check_non_root_offline(repo, Role::Targets)
    }

    /// Offline update decision against stored metadata only.
    fn check_updates(&mut self) -> Result<(), AgentError> {
        let inventory = self.refresh_inventory()?;
        self.check_repo_offline(RepoKind::Director)?;
        let pre_pass = resolver::select(&self.director.targets(), None, &inventory)
            .map_err(|err| AgentError::TargetMismatch(err.to_string()))?;

        let updates = if pre_pass.is_empty() {
            Vec::new()
        } else {
            self.check_repo_offline(RepoKind::Image)?;
            resolver::select(
                &self.director.targets(),
                Some(&self.image.targets()),
                &inventory,
            )
            .map_err(|err| AgentError::TargetMismatch(err.to_string()))?
        };

        self.state = if updates.is_empty() {
            EngineState::Idle
        } else {
            EngineState::UpdatesAvailable
        };
        self.emit(Event::CheckUpdatesComplete { updates });
        Ok(())
    }

    /// Downloads approved targets; partial failure reports the subset and
    /// never proceeds toward installation.
    async fn download(&mut self, targets: &[Target]) -> Result<(), AgentError> {
        self.state = EngineState::Downloading;
        let mut downloaded = Vec::new();
        let mut failed = Vec::new();
        for target in targets {
            match self
                .driver
                .fetch(target, self.transport.as_ref(), &self.token, None)
                .await
            {
                Ok(()) => downloaded.push(target.clone()),
                Err(err) => {
                    error!(target = %target.filename, %err, "download failed");
                    failed.push(target.filename.clone());
                }
            }
        }

        if failed.is_empty() && !downloaded.is_empty() {
            // The download report carries the Director targets that
            // authorized the batch.
            if let Some(director_targets) =
                self.storage.load_non_root(RepoKind::Director, Role::Targets)?
            {
                self.reports.enqueue(
                    "DownloadComplete",
                    json!(String::from_utf8_lossy(&director_targets)),
                );
            }
        } else if !failed.is_empty() {
            error!(
                downloaded = downloaded.len(),
                total = targets.len(),
                "only part of the batch downloaded, install will not proceed"
            );
        }

        self.state = if failed.is_empty() {
            EngineState::UpdatesAvailable
        } else {
            EngineState::Idle
        };
        self.emit(Event::DownloadComplete { downloaded, failed });
        Ok(())
    }

    /// Installs the Primary's slice and distributes metadata and firmware
    /// to Secondaries, in strict per-Secondary order.
    async fn install(&mut self, targets: &[Target]) -> Result<(), AgentError> {
        self.state = EngineState::Installing;
        let primary_serial = self.identity()?.primary_serial.clone();
        let mut results = Vec::new();

        let unreachable = self.send_metadata_to_secondaries(targets).await;

        let primary_updates: Vec<&Target> = targets
            .iter()
            .filter(|target| target.ecus.contains_key(&primary_serial))
            .collect();
        let mut pending: Option<PendingInstall> = None;
        if let Some(target) = primary_updates.first().copied() {
            let result = self.install_on_primary(target, &mut pending)?;
            results.push(result);
        } else {
            info!("no update to install on primary");
        }

        self.send_firmware_to_secondaries(targets, &unreachable)
            .await?;

        // Installed-version records land in storage before the terminal
        // event so a restart cannot lose them.
        self.state = if pending.is_some() {
            EngineState::NeedsReboot
        } else {
            EngineState::Idle
        };
        self.emit(Event::InstallComplete { results });
        Ok(())
    }

    fn install_on_primary(
        &mut self,
        target: &Target,
        pending: &mut Option<PendingInstall>,
    ) -> Result<InstallationResult, AgentError> {
        let primary_serial = self.identity()?.primary_serial.clone();
        let already_installed = self
            .driver
            .current()
            .map(|current| current.filename == target.filename)
            .unwrap_or(false);

        let result = if already_installed {
            InstallationResult::new(
                &target.filename,
                ResultCode::AlreadyProcessed,
                "Package already installed",
            )
        } else if self.driver.is_ostree() != (target.format == uptane_core::TargetFormat::Ostree) {
            InstallationResult::new(
                &target.filename,
                ResultCode::ValidationFailed,
                format!(
                    "Target format does not match the {} package driver",
                    self.driver.name()
                ),
            )
        } else {
            // Installation is not atomic; a spurious notification is
            // cheaper than a missed one.
            self.bootloader.update_notify();
            info!(driver = self.driver.name(), target = %target.filename, "installing package");
            self.driver.install(target)
        };

        self.storage.store_installation_result(&result)?;
        self.storage.append_installed_version(&InstalledVersion {
            ecu_serial: primary_serial.clone(),
            filename: target.filename.clone(),
            sha256: target.sha256().unwrap_or_default().to_string(),
            length: target.length,
            recorded_at: Utc::now().to_rfc3339(),
            outcome: result.code.log_outcome().to_string(),
        })?;

        match result.code {
            ResultCode::Ok => {
                self.installed_images
                    .insert(primary_serial, target.filename.clone());
            }
            ResultCode::NeedCompletion => {
                let marker = PendingInstall {
                    filename: target.filename.clone(),
                    sha256: target.sha256().unwrap_or_default().to_string(),
                };
                self.storage.set_pending_install(Some(&marker))?;
                self.bootloader.set_reboot_flag();
                *pending = Some(marker);
            }
            _ => {}
        }
        Ok(result)
    }

    /// Assembles the metadata pack and pushes it to every targeted
    /// Secondary, rotating Roots first. Returns the serials whose push
    /// failed; firmware must not flow to them.
    async fn send_metadata_to_secondaries(&mut self, targets: &[Target]) -> HashSet<String> {
        let mut unreachable = HashSet::new();
        let pack = match self.load_meta_pack() {
            Ok(pack) => pack,
            Err(err) => {
                error!(%err, "no complete metadata set to send to secondaries");
                for target in targets {
                    for serial in target.ecus.keys() {
                        unreachable.insert(serial.clone());
                    }
                }
                return unreachable;
            }
        };

        for target in targets {
            for serial in target.ecus.keys() {
                let Some(secondary) = self.secondaries.get(serial) else {
                    continue;
                };
                if unreachable.contains(serial) {
                    continue;
                }
                let mut rotated = self
                    .rotate_secondary_root(RepoKind::Director, secondary)
                    .await;
                if rotated.is_ok() {
                    rotated = self.rotate_secondary_root(RepoKind::Image, secondary).await;
                }
                if let Err(err) = rotated {
                    error!(%serial, %err, "root rotation failed, skipping secondary");
                    unreachable.insert(serial.clone());
                    continue;
                }
                if let Err(err) = secondary.put_metadata(&pack) {
                    error!(%serial, %err, "sending metadata failed");
                    unreachable.insert(serial.clone());
                }
            }
        }
        unreachable
    }

    /// Pushes every Root from the Secondary's version + 1 to the latest.
    async fn rotate_secondary_root(
        &self,
        repo: RepoKind,
        secondary: &Secondary,
    ) -> Result<(), AgentError> {
        let latest = self.storage.latest_root_version(repo)?;
        let held = secondary
            .root_version(repo)
            .map_err(|err| AgentError::SecondaryUnreachable(err.to_string()))?;
        for version in (held + 1)..=latest {
            let bytes = match self.storage.load_root(repo, version)? {
                Some(bytes) => bytes,
                None => {
                    warn!(%repo, version, "root missing from storage, trying the repository");
                    self.fetcher
                        .fetch_role(repo, Role::Root, Some(version), &self.token)
                        .await?
                }
            };
            secondary
                .put_root(repo, &bytes)
                .map_err(|err| AgentError::SecondaryUnreachable(err.to_string()))?;
        }
        Ok(())
    }

    async fn send_firmware_to_secondaries(
        &mut self,
        targets: &[Target],
        unreachable: &HashSet<String>,
    ) -> Result<(), AgentError> {
        for target in targets {
            for serial in target.ecus.keys() {
                if unreachable.contains(serial) {
                    continue;
                }
                let Some(secondary) = self.secondaries.get(serial) else {
                    continue;
                };
                let payload = if target.format == uptane_core::TargetFormat::Ostree {
                    // OSTree secondaries pull for themselves; they get
                    // credentials and the server URL instead of image bytes.
                    match self.treehub_credentials()? {
                        Some(bundle) => bundle,
                        None => continue,
                    }
                } else {
                    match self.driver.staged_image(target) {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            error!(%serial, target = %target.filename, %err, "staged image unavailable");
                            continue;
                        }
                    }
                };
                if let Err(err) = secondary.send_firmware(&payload) {
                    error!(%serial, %err, "sending firmware failed");
                    continue;
                }
                self.installed_images
                    .insert(serial.clone(), target.filename.clone());
            }
        }
        Ok(())
    }

    /// Bundles TLS credentials and the OSTree server URL for a Secondary.
    fn treehub_credentials(&self) -> Result<Option<Vec<u8>>, AgentError> {
        let Some(creds) = self.storage.load_tls_creds()? else {
            error!("no TLS credentials stored, cannot hand out treehub access");
            return Ok(None);
        };
        let bundle = json!({
            "ca": creds.ca,
            "cert": creds.cert,
            "pkey": creds.pkey,
            "server": self.config.treehub_url,
        });
        serde_json::to_vec(&bundle)
            .map(Some)
            .map_err(|err| AgentError::Parse(err.to_string()))
    }

    /// Completes a pending installation after an observed reboot.
    fn finalize_pending(&mut self) -> Result<(), AgentError> {
        self.state = EngineState::Finalizing;
        let pending = self.storage.pending_install()?;
        let Some(pending) = pending else {
            debug!("reboot flag raised without a pending installation");
            self.bootloader.clear_reboot_flag();
            self.state = EngineState::Idle;
            return Ok(());
        };

        let expected = Target {
            filename: pending.filename.clone(),
            length: 0,
            hashes: vec![uptane_core::Hash::new(
                uptane_core::HashAlgorithm::Sha256,
                &pending.sha256,
            )],
            ecus: BTreeMap::new(),
            uri: None,
            format: if self.driver.is_ostree() {
                uptane_core::TargetFormat::Ostree
            } else {
                uptane_core::TargetFormat::Binary
            },
        };

        let result = if self.driver.current_hash() == pending.sha256 {
            let result = self.driver.finalize(&expected);
            if result.code == ResultCode::Ok {
                self.bootloader.set_boot_ok();
            }
            result
        } else {
            // Booted into something else: presume rollback.
            let _ = self.driver.finalize(&expected);
            InstallationResult::new(
                &pending.filename,
                ResultCode::InstallFailed,
                "Wrong version booted",
            )
        };

        let primary_serial = self.identity()?.primary_serial.clone();
        self.storage.store_installation_result(&result)?;
        self.storage.append_installed_version(&InstalledVersion {
            ecu_serial: primary_serial,
            filename: pending.filename.clone(),
            sha256: pending.sha256.clone(),
            length: 0,
            recorded_at: Utc::now().to_rfc3339(),
            outcome: result.code.log_outcome().to_string(),
        })?;
        self.storage.set_pending_install(None)?;
        self.bootloader.clear_reboot_flag();

        self.emit(Event::FinalizeComplete { result });
        self.state = EngineState::Idle;
        Ok(())
    }

    fn load_meta_pack(&self) -> Result<RawMetaPack, AgentError> {
        let load_root = |repo| -> Result<Vec<u8>, AgentError> {
            self.storage
                .load_latest_root(repo)?
                .ok_or(AgentError::MetadataInvalid(
                    uptane_core::VerifyError::NotFound {
                        repo,
                        role: Role::Root,
                    },
                ))
        };
        let load_non_root = |repo, role| -> Result<Vec<u8>, AgentError> {
            self.storage
                .load_non_root(repo, role)?
                .ok_or(AgentError::MetadataInvalid(
                    uptane_core::VerifyError::NotFound { repo, role },
                ))
        };
        Ok(RawMetaPack {
            director_root: load_root(RepoKind::Director)?,
            director_targets: load_non_root(RepoKind::Director, Role::Targets)?,
            image_root: load_root(RepoKind::Image)?,
            image_timestamp: load_non_root(RepoKind::Image, Role::Timestamp)?,
            image_snapshot: load_non_root(RepoKind::Image, Role::Snapshot)?,
            image_targets: load_non_root(RepoKind::Image, Role::Targets)?,
        })
    }

    fn repo(&self, repo: RepoKind) -> &Repository {
        match repo {
            RepoKind::Director => &self.director,
            RepoKind::Image => &self.image,
        }
    }

    fn repo_mut(&mut self, repo: RepoKind) -> &mut Repository {
        match repo {
            RepoKind::Director => &mut self.director,
            RepoKind::Image => &mut self.image,
        }
    }
}

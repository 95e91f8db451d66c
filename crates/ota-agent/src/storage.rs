//! Sled-backed persistent store for Uptane metadata and device state.
//!
//! Layout, tree per concern:
//!
//! - `director_repo` / `image_repo`: `root.json` (latest), `root/<N>.json`
//!   (every accepted version), plus the latest `timestamp.json`,
//!   `snapshot.json`, and `targets.json`.
//! - `device`: key seed, ECU serial inventory, TLS credentials, pending
//!   installation marker, last installation result, misconfigured ECUs.
//! - `installed_versions`: append-only log of installation outcomes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::{Batch, Config as SledConfig, Db, Tree};
use thiserror::Error;
use uptane_core::{extract_version_untrusted, RepoKind, Role};

use crate::package::InstallationResult;

/// Tree storing Director repository metadata.
const TREE_DIRECTOR_REPO: &str = "director_repo";
/// Tree storing Image repository metadata.
const TREE_IMAGE_REPO: &str = "image_repo";
/// Tree storing device identity and installation state.
const TREE_DEVICE: &str = "device";
/// Tree storing the append-only installed-version log.
const TREE_INSTALLED: &str = "installed_versions";

const KEY_LATEST_ROOT: &[u8] = b"root.json";
const KEY_UPTANE_SEED: &[u8] = b"uptane_key_seed";
const KEY_ECU_SERIALS: &[u8] = b"ecu_serials";
const KEY_TLS_CREDS: &[u8] = b"tls_creds";
const KEY_MISCONFIGURED: &[u8] = b"misconfigured_ecus";
const KEY_PENDING_INSTALL: &[u8] = b"pending_install";
const KEY_INSTALL_RESULT: &[u8] = b"installation_result";

/// Errors emitted by the [`MetaStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt record under key '{0}'")]
    Corrupt(String),
}

/// One registered ECU (serial plus hardware id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuInfo {
    pub serial: String,
    pub hardware_id: String,
}

/// Why an ECU in storage disagrees with the live inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcuState {
    /// Present in storage but no longer reported by the device.
    Old,
    /// Reported by the device but never registered.
    NotRegistered,
}

/// A stored record of an inventory mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MisconfiguredEcu {
    pub serial: String,
    pub hardware_id: String,
    pub state: EcuState,
}

/// TLS client credentials issued at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsCreds {
    pub ca: String,
    pub cert: String,
    pub pkey: String,
}

/// The Primary installation awaiting a reboot to complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInstall {
    pub filename: String,
    pub sha256: String,
}

/// One record of the append-only installed-version log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub ecu_serial: String,
    pub filename: String,
    pub sha256: String,
    pub length: u64,
    /// RFC3339 device time of the record.
    pub recorded_at: String,
    pub outcome: String,
}

/// Wrapper around a sled database providing tree-oriented access.
#[derive(Debug, Clone)]
pub struct MetaStore {
    db: Db,
}

impl MetaStore {
    /// Opens (or creates) a store at the provided path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories automatically.
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = SledConfig::new().path(path).open()?;
        Ok(Self { db })
    }

    /// Opens an in-memory store (ephemeral across restarts).
    pub fn open_ephemeral() -> Result<Self, StoreError> {
        let db = SledConfig::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn repo_tree(&self, repo: RepoKind) -> Result<Tree, StoreError> {
        let name = match repo {
            RepoKind::Director => TREE_DIRECTOR_REPO,
            RepoKind::Image => TREE_IMAGE_REPO,
        };
        Ok(self.db.open_tree(name)?)
    }

    fn device_tree(&self) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(TREE_DEVICE)?)
    }

    fn installed_tree(&self) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(TREE_INSTALLED)?)
    }

    /// Stores an accepted Root under its version and as the latest copy.
    pub fn store_root(&self, repo: RepoKind, version: u64, bytes: &[u8]) -> Result<(), StoreError> {
        let tree = self.repo_tree(repo)?;
        let mut batch = Batch::default();
        batch.insert(root_version_key(version).as_bytes(), bytes);
        batch.insert(KEY_LATEST_ROOT, bytes);
        tree.apply_batch(batch)?;
        Ok(())
    }

    /// Loads the latest stored Root.
    pub fn load_latest_root(&self, repo: RepoKind) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .repo_tree(repo)?
            .get(KEY_LATEST_ROOT)?
            .map(|ivec| ivec.to_vec()))
    }

    /// Loads a specific Root version.
    pub fn load_root(&self, repo: RepoKind, version: u64) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .repo_tree(repo)?
            .get(root_version_key(version).as_bytes())?
            .map(|ivec| ivec.to_vec()))
    }

    /// Version of the latest stored Root, zero when none.
    pub fn latest_root_version(&self, repo: RepoKind) -> Result<u64, StoreError> {
        Ok(self
            .load_latest_root(repo)?
            .map(|bytes| extract_version_untrusted(&bytes))
            .unwrap_or(0))
    }

    /// Stores the latest copy of a non-Root role.
    pub fn store_non_root(&self, repo: RepoKind, role: Role, bytes: &[u8]) -> Result<(), StoreError> {
        self.repo_tree(repo)?
            .insert(role.file_name().as_bytes(), bytes)?;
        Ok(())
    }

    /// Loads the latest copy of a non-Root role.
    pub fn load_non_root(&self, repo: RepoKind, role: Role) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .repo_tree(repo)?
            .get(role.file_name().as_bytes())?
            .map(|ivec| ivec.to_vec()))
    }

    /// Drops all non-Root metadata of a repository; used when a Root advances.
    pub fn clear_non_root(&self, repo: RepoKind) -> Result<(), StoreError> {
        let tree = self.repo_tree(repo)?;
        let mut batch = Batch::default();
        for role in [Role::Timestamp, Role::Snapshot, Role::Targets] {
            batch.remove(role.file_name().as_bytes());
        }
        tree.apply_batch(batch)?;
        Ok(())
    }

    /// Persists the device Uptane key seed.
    pub fn store_key_seed(&self, seed: &[u8; 32]) -> Result<(), StoreError> {
        self.device_tree()?.insert(KEY_UPTANE_SEED, &seed[..])?;
        Ok(())
    }

    /// Loads the device Uptane key seed when present.
    pub fn load_key_seed(&self) -> Result<Option<[u8; 32]>, StoreError> {
        let Some(raw) = self.device_tree()?.get(KEY_UPTANE_SEED)? else {
            return Ok(None);
        };
        <[u8; 32]>::try_from(raw.as_ref())
            .map(Some)
            .map_err(|_| StoreError::Corrupt("uptane_key_seed".to_string()))
    }

    /// Stores the ECU inventory; index zero is the Primary.
    pub fn store_ecu_serials(&self, ecus: &[EcuInfo]) -> Result<(), StoreError> {
        self.put_json(KEY_ECU_SERIALS, ecus)
    }

    /// Loads the ECU inventory.
    pub fn load_ecu_serials(&self) -> Result<Vec<EcuInfo>, StoreError> {
        self.get_json(KEY_ECU_SERIALS).map(Option::unwrap_or_default)
    }

    pub fn store_tls_creds(&self, creds: &TlsCreds) -> Result<(), StoreError> {
        self.put_json(KEY_TLS_CREDS, creds)
    }

    pub fn load_tls_creds(&self) -> Result<Option<TlsCreds>, StoreError> {
        self.get_json(KEY_TLS_CREDS)
    }

    pub fn store_misconfigured_ecus(&self, ecus: &[MisconfiguredEcu]) -> Result<(), StoreError> {
        self.put_json(KEY_MISCONFIGURED, ecus)
    }

    pub fn load_misconfigured_ecus(&self) -> Result<Vec<MisconfiguredEcu>, StoreError> {
        self.get_json(KEY_MISCONFIGURED).map(Option::unwrap_or_default)
    }

    /// Sets or clears the pending-installation marker. This is the only
    /// engine state that survives a process restart.
    pub fn set_pending_install(&self, pending: Option<&PendingInstall>) -> Result<(), StoreError> {
        match pending {
            Some(record) => self.put_json(KEY_PENDING_INSTALL, record),
            None => {
                self.device_tree()?.remove(KEY_PENDING_INSTALL)?;
                Ok(())
            }
        }
    }

    pub fn pending_install(&self) -> Result<Option<PendingInstall>, StoreError> {
        self.get_json(KEY_PENDING_INSTALL)
    }

    /// Persists the latest installation result for the next manifest.
    pub fn store_installation_result(&self, result: &InstallationResult) -> Result<(), StoreError> {
        self.put_json(KEY_INSTALL_RESULT, result)
    }

    pub fn load_installation_result(&self) -> Result<Option<InstallationResult>, StoreError> {
        self.get_json(KEY_INSTALL_RESULT)
    }

    /// Appends one record to the installed-version log.
    pub fn append_installed_version(&self, record: &InstalledVersion) -> Result<(), StoreError> {
        let tree = self.installed_tree()?;
        let seq = self.db.generate_id()?;
        let key = format!("{seq:020}");
        tree.insert(key.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    /// Returns the whole installed-version log in append order.
    pub fn installed_versions(&self) -> Result<Vec<InstalledVersion>, StoreError> {
        let mut records = Vec::new();
        for entry in self.installed_tree()?.iter() {
            let (key, value) = entry?;
            let record: InstalledVersion = serde_json::from_slice(&value).map_err(|_| {
                StoreError::Corrupt(String::from_utf8_lossy(&key).into_owned())
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// The most recent successfully installed filename for one ECU.
    pub fn installed_filename(&self, serial: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .installed_versions()?
            .into_iter()
            .rev()
            .find(|record| record.ecu_serial == serial && record.outcome == "ok")
            .map(|record| record.filename))
    }

    /// Flushes pending writes to disk, useful during shutdown.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn put_json<V: Serialize + ?Sized>(&self, key: &[u8], value: &V) -> Result<(), StoreError> {
        self.device_tree()?.insert(key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn get_json<V: for<'de> Deserialize<'de>>(&self, key: &[u8]) -> Result<Option<V>, StoreError> {
        let Some(raw) = self.device_tree()?.get(key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|_| StoreError::Corrupt(String::from_utf8_lossy(key).into_owned()))
    }
}

/// Key used to store a versioned Root copy.
fn root_version_key(version: u64) -> String {
    format!("root/{version}.json")
}

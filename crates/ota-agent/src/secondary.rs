//! Secondary ECU protocol.
//!
//! The Primary mediates everything a Secondary sees: first the Root
//! rotation chain, then the full metadata pack, then firmware. A Secondary
//! may reject any step with a typed error; the engine logs and moves on to
//! the next Secondary, never letting one refusal poison the batch.

use std::fs;
use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uptane_core::{extract_version_untrusted, sha256_hex, Ed25519Signer, PublicKey, RepoKind};

/// The five metadata blobs dispatched to Secondaries, plus the Director
/// Root they chain from.
#[derive(Debug, Clone)]
pub struct RawMetaPack {
    pub director_root: Vec<u8>,
    pub director_targets: Vec<u8>,
    pub image_root: Vec<u8>,
    pub image_timestamp: Vec<u8>,
    pub image_snapshot: Vec<u8>,
    pub image_targets: Vec<u8>,
}

/// Failures a Secondary may answer with.
#[derive(Debug, Error)]
pub enum SecondaryError {
    #[error("secondary rejected the operation: {0}")]
    Rejected(String),
    #[error("secondary storage failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("secondary state corrupt: {0}")]
    Corrupt(String),
}

/// A subordinate ECU reachable from this Primary; dispatch is by tag.
#[derive(Debug)]
pub enum Secondary {
    Virtual(VirtualSecondary),
}

impl Secondary {
    pub fn serial(&self) -> &str {
        match self {
            Secondary::Virtual(sec) => &sec.serial,
        }
    }

    pub fn hw_id(&self) -> &str {
        match self {
            Secondary::Virtual(sec) => &sec.hw_id,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Secondary::Virtual(sec) => sec.signer.public_key(),
        }
    }

    /// The Secondary's signed version manifest.
    pub fn manifest(&self) -> Result<Value, SecondaryError> {
        match self {
            Secondary::Virtual(sec) => sec.manifest(),
        }
    }

    /// Highest Root version the Secondary holds for one repository.
    pub fn root_version(&self, repo: RepoKind) -> Result<u64, SecondaryError> {
        match self {
            Secondary::Virtual(sec) => sec.root_version(repo),
        }
    }

    /// Pushes one Root of the rotation chain.
    pub fn put_root(&self, repo: RepoKind, bytes: &[u8]) -> Result<(), SecondaryError> {
        match self {
            Secondary::Virtual(sec) => sec.put_root(repo, bytes),
        }
    }

    /// Pushes the full metadata pack; always after root rotation.
    pub fn put_metadata(&self, pack: &RawMetaPack) -> Result<(), SecondaryError> {
        match self {
            Secondary::Virtual(sec) => sec.put_metadata(pack),
        }
    }

    /// Streams firmware (or an OSTree credentials bundle) to the Secondary.
    pub fn send_firmware(&self, image: &[u8]) -> Result<(), SecondaryError> {
        match self {
            Secondary::Virtual(sec) => sec.send_firmware(image),
        }
    }
}

/// A file-backed Secondary living alongside the Primary.
///
/// Useful both as the in-process implementation for bench setups and as the
/// reference behaviour for the wire-attached kinds: it persists metadata,
/// tracks its Root versions per repository, signs its own version manifest,
/// and treats received firmware bytes as its installed image.
#[derive(Debug)]
pub struct VirtualSecondary {
    serial: String,
    hw_id: String,
    dir: PathBuf,
    signer: Ed25519Signer,
    /// Test hook: refuse metadata/firmware pushes when set.
    refuse_pushes: bool,
}

impl VirtualSecondary {
    pub fn new(
        dir: impl Into<PathBuf>,
        serial: &str,
        hw_id: &str,
    ) -> Result<Self, SecondaryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let seed_path = dir.join("key.seed");
        let signer = match fs::read(&seed_path) {
            Ok(raw) => {
                let seed = <[u8; 32]>::try_from(raw.as_slice())
                    .map_err(|_| SecondaryError::Corrupt("key.seed".to_string()))?;
                Ed25519Signer::from_seed(seed)
            }
            Err(_) => {
                let signer = Ed25519Signer::generate();
                fs::write(&seed_path, signer.seed())?;
                signer
            }
        };
        Ok(Self {
            serial: serial.to_string(),
            hw_id: hw_id.to_string(),
            dir,
            signer,
            refuse_pushes: false,
        })
    }

    /// Makes every subsequent push fail; exercises failure isolation.
    pub fn refuse_pushes(&mut self, refuse: bool) {
        self.refuse_pushes = refuse;
    }

    fn root_dir(&self, repo: RepoKind) -> PathBuf {
        self.dir.join(format!("{repo}_roots"))
    }

    fn manifest(&self) -> Result<Value, SecondaryError> {
        let (filename, sha256, length) = match fs::read(self.dir.join("firmware.bin")) {
            Ok(image) => (
                self.installed_name(),
                sha256_hex(&image),
                image.len() as u64,
            ),
            Err(_) => ("noimage".to_string(), sha256_hex(b""), 0),
        };
        let body = serde_json::json!({
            "ecu_serial": self.serial,
            "attacks_detected": "",
            "installed_image": {
                "filepath": filename,
                "fileinfo": {
                    "hashes": { "sha256": sha256 },
                    "length": length
                }
            }
        });
        Ok(self.signer.envelope(body))
    }

    fn installed_name(&self) -> String {
        fs::read_to_string(self.dir.join("installed_name"))
            .unwrap_or_else(|_| "unnamed".to_string())
    }

    fn root_version(&self, repo: RepoKind) -> Result<u64, SecondaryError> {
        let mut highest = 0u64;
        let Ok(entries) = fs::read_dir(self.root_dir(repo)) else {
            return Ok(0);
        };
        for entry in entries.flatten() {
            if let Ok(bytes) = fs::read(entry.path()) {
                highest = highest.max(extract_version_untrusted(&bytes));
            }
        }
        Ok(highest)
    }

    fn put_root(&self, repo: RepoKind, bytes: &[u8]) -> Result<(), SecondaryError> {
        if self.refuse_pushes {
            return Err(SecondaryError::Rejected("root push refused".to_string()));
        }
        let version = extract_version_untrusted(bytes);
        if version == 0 {
            return Err(SecondaryError::Rejected("unversioned root".to_string()));
        }
        let dir = self.root_dir(repo);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(format!("{version}.root.json")), bytes)?;
        debug!(serial = %self.serial, %repo, version, "secondary stored root");
        Ok(())
    }

    fn put_metadata(&self, pack: &RawMetaPack) -> Result<(), SecondaryError> {
        if self.refuse_pushes {
            return Err(SecondaryError::Rejected("metadata push refused".to_string()));
        }
        let meta_dir = self.dir.join("metadata");
        fs::create_dir_all(&meta_dir)?;
        for (name, bytes) in [
            ("director_root.json", &pack.director_root),
            ("director_targets.json", &pack.director_targets),
            ("image_root.json", &pack.image_root),
            ("image_timestamp.json", &pack.image_timestamp),
            ("image_snapshot.json", &pack.image_snapshot),
            ("image_targets.json", &pack.image_targets),
        ] {
            fs::write(meta_dir.join(name), bytes)?;
        }

        // Remember which image the Director routed at this serial so the
        // manifest reports the right file name after the firmware arrives.
        if let Ok(targets) = serde_json::from_slice::<Value>(&pack.director_targets) {
            if let Some(map) = targets.pointer("/signed/targets").and_then(Value::as_object) {
                for (filename, desc) in map {
                    let routed = desc
                        .pointer("/custom/ecuIdentifiers")
                        .and_then(Value::as_object)
                        .map(|ecus| ecus.contains_key(&self.serial))
                        .unwrap_or(false);
                    if routed {
                        fs::write(self.dir.join("installed_name"), filename)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn send_firmware(&self, image: &[u8]) -> Result<(), SecondaryError> {
        if self.refuse_pushes {
            return Err(SecondaryError::Rejected("firmware push refused".to_string()));
        }
        fs::write(self.dir.join("firmware.bin"), image)?;
        debug!(serial = %self.serial, bytes = image.len(), "secondary accepted firmware");
        Ok(())
    }
}

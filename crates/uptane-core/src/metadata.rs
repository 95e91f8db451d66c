//! Typed views over the Uptane role bodies.
//!
//! Raw metadata arrives as `{signed, signatures}` JSON envelopes. This
//! module parses the envelope and each role body into owned types while
//! keeping the original `signed` value around, because signatures only ever
//! verify over its canonical byte form.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};

use crate::crypto::{PublicKey, SignatureBlock};
use crate::error::VerifyError;

/// The four top-level Uptane roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Root,
    Timestamp,
    Snapshot,
    Targets,
}

impl Role {
    /// The `_type` value carried in the signed body.
    pub fn name(self) -> &'static str {
        match self {
            Role::Root => "Root",
            Role::Timestamp => "Timestamp",
            Role::Snapshot => "Snapshot",
            Role::Targets => "Targets",
        }
    }

    /// The lowercase role key used in Root's `roles` map.
    pub fn key_name(self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Timestamp => "timestamp",
            Role::Snapshot => "snapshot",
            Role::Targets => "targets",
        }
    }

    /// The repository file name of the role.
    pub fn file_name(self) -> &'static str {
        match self {
            Role::Root => "root.json",
            Role::Timestamp => "timestamp.json",
            Role::Snapshot => "snapshot.json",
            Role::Targets => "targets.json",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which of the two repositories a piece of metadata belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RepoKind {
    Director,
    Image,
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoKind::Director => f.write_str("director"),
            RepoKind::Image => f.write_str("image"),
        }
    }
}

/// A parsed `{signed, signatures}` envelope.
#[derive(Debug, Clone)]
pub struct SignedObject {
    pub signed: Value,
    pub signatures: Vec<SignatureBlock>,
}

impl SignedObject {
    /// Parses raw bytes; `role` only provides error context.
    pub fn parse(bytes: &[u8], role: Role) -> Result<Self, VerifyError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|err| VerifyError::ParseError {
            role,
            detail: err.to_string(),
        })?;
        let signed = value
            .get("signed")
            .cloned()
            .ok_or_else(|| VerifyError::ParseError {
                role,
                detail: "missing 'signed' section".to_string(),
            })?;
        let signatures: Vec<SignatureBlock> = value
            .get("signatures")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| VerifyError::ParseError {
                role,
                detail: format!("bad 'signatures' section: {err}"),
            })?
            .unwrap_or_default();
        Ok(Self { signed, signatures })
    }

    /// Ensures the signed body declares the expected `_type`.
    pub fn check_type(&self, expected: Role) -> Result<(), VerifyError> {
        let found = self
            .signed
            .get("_type")
            .and_then(Value::as_str)
            .unwrap_or("");
        if found.eq_ignore_ascii_case(expected.name()) {
            Ok(())
        } else {
            Err(VerifyError::RoleMismatch {
                expected,
                found: found.to_string(),
            })
        }
    }

    /// Returns the body version, defaulting to zero when absent.
    pub fn version(&self) -> u64 {
        self.signed
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or_default()
    }

    /// Parses the body expiry timestamp.
    pub fn expires(&self, role: Role) -> Result<DateTime<Utc>, VerifyError> {
        let raw = self
            .signed
            .get("expires")
            .and_then(Value::as_str)
            .ok_or_else(|| VerifyError::ParseError {
                role,
                detail: "missing 'expires'".to_string(),
            })?;
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| VerifyError::ParseError {
                role,
                detail: format!("bad 'expires' timestamp: {err}"),
            })
    }
}

/// Extracts `/signed/version` from raw bytes without any verification.
///
/// Used to decide how far a root walk has to go before the chain itself is
/// validated; never a trust decision on its own.
pub fn extract_version_untrusted(bytes: &[u8]) -> u64 {
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .and_then(|value| value.pointer("/signed/version").and_then(Value::as_u64))
        .unwrap_or_default()
}

/// The key ids and threshold authorized for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: u32,
}

/// A fully parsed and internally consistent Root body.
#[derive(Debug, Clone)]
pub struct TrustedRoot {
    pub version: u64,
    pub expires: DateTime<Utc>,
    keys: BTreeMap<String, PublicKey>,
    roles: BTreeMap<Role, RoleKeys>,
}

impl TrustedRoot {
    /// Parses the signed Root body, enforcing the structural invariants:
    /// all four roles present, thresholds at least one, and every
    /// authorized key id backed by an entry in `keys`.
    pub fn from_signed(signed: &Value, expires: DateTime<Utc>) -> Result<Self, VerifyError> {
        let parse_err = |detail: &str| VerifyError::ParseError {
            role: Role::Root,
            detail: detail.to_string(),
        };
        let version = signed
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| parse_err("missing 'version'"))?;

        let mut keys = BTreeMap::new();
        let raw_keys = signed
            .get("keys")
            .and_then(Value::as_object)
            .ok_or_else(|| parse_err("missing 'keys'"))?;
        for (keyid, raw) in raw_keys {
            keys.insert(keyid.clone(), PublicKey::from_uptane(raw));
        }

        let raw_roles = signed
            .get("roles")
            .and_then(Value::as_object)
            .ok_or_else(|| parse_err("missing 'roles'"))?;
        let mut roles = BTreeMap::new();
        for role in [Role::Root, Role::Timestamp, Role::Snapshot, Role::Targets] {
            let entry = raw_roles
                .get(role.key_name())
                .ok_or_else(|| parse_err(&format!("missing role entry '{}'", role.key_name())))?;
            let threshold = entry
                .get("threshold")
                .and_then(Value::as_u64)
                .unwrap_or_default();
            if threshold < 1 {
                return Err(VerifyError::BadThreshold {
                    role,
                    valid: 0,
                    threshold: threshold as u32,
                });
            }
            let keyids: Vec<String> = entry
                .get("keyids")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            for keyid in &keyids {
                if !keys.contains_key(keyid) {
                    return Err(VerifyError::BadKeyId {
                        role,
                        keyid: keyid.clone(),
                    });
                }
            }
            roles.insert(
                role,
                RoleKeys {
                    keyids,
                    threshold: threshold as u32,
                },
            );
        }

        Ok(Self {
            version,
            expires,
            keys,
            roles,
        })
    }

    /// Returns the key set authorized for a role.
    pub fn role_keys(&self, role: Role) -> &RoleKeys {
        // Presence of all four roles is enforced in `from_signed`.
        &self.roles[&role]
    }

    /// Looks up a public key by id.
    pub fn key(&self, keyid: &str) -> Option<&PublicKey> {
        self.keys.get(keyid)
    }

    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }
}

/// Hash algorithms understood by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// One declared digest; stored lowercase, compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Hash {
    pub algorithm: HashAlgorithm,
    pub digest: String,
}

impl Hash {
    pub fn new(algorithm: HashAlgorithm, digest: &str) -> Self {
        Self {
            algorithm,
            digest: digest.to_ascii_lowercase(),
        }
    }

    /// Checks the digest against raw bytes.
    pub fn matches(&self, data: &[u8]) -> bool {
        let computed = match self.algorithm {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
        };
        computed == self.digest
    }
}

/// Parses a `hashes` object, silently dropping unknown algorithms.
fn parse_hashes(value: Option<&Value>) -> Vec<Hash> {
    let mut hashes = Vec::new();
    if let Some(map) = value.and_then(Value::as_object) {
        for (name, digest) in map {
            let (Some(algorithm), Some(digest)) = (HashAlgorithm::from_wire(name), digest.as_str())
            else {
                continue;
            };
            hashes.push(Hash::new(algorithm, digest));
        }
    }
    hashes.sort();
    hashes
}

/// Payload format of a target image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Ostree,
    Binary,
}

impl TargetFormat {
    pub fn from_wire(name: &str) -> Self {
        if name.eq_ignore_ascii_case("ostree") {
            TargetFormat::Ostree
        } else {
            TargetFormat::Binary
        }
    }
}

/// A described firmware image plus its ECU routing information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub filename: String,
    pub length: u64,
    pub hashes: Vec<Hash>,
    /// ECU serial to hardware id, from `custom.ecuIdentifiers`.
    pub ecus: BTreeMap<String, String>,
    pub uri: Option<String>,
    pub format: TargetFormat,
}

impl Target {
    /// Parses one entry of a `targets` map.
    fn from_wire(filename: &str, value: &Value) -> Result<Self, String> {
        let length = value
            .get("length")
            .and_then(Value::as_u64)
            .ok_or_else(|| format!("target '{filename}' missing length"))?;
        let hashes = parse_hashes(value.get("hashes"));
        if hashes.is_empty() {
            return Err(format!("target '{filename}' carries no known hashes"));
        }

        let custom = value.get("custom");
        let mut ecus = BTreeMap::new();
        if let Some(map) = custom
            .and_then(|c| c.get("ecuIdentifiers"))
            .and_then(Value::as_object)
        {
            for (serial, entry) in map {
                let hw_id = entry
                    .get("hardwareId")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                ecus.insert(serial.clone(), hw_id.to_string());
            }
        }
        let uri = custom
            .and_then(|c| c.get("uri"))
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let format = custom
            .and_then(|c| c.get("targetFormat"))
            .and_then(Value::as_str)
            .map(TargetFormat::from_wire)
            .unwrap_or(TargetFormat::Binary);

        Ok(Self {
            filename: filename.to_string(),
            length,
            hashes,
            ecus,
            uri,
            format,
        })
    }

    /// Returns the SHA-256 digest when one is declared.
    pub fn sha256(&self) -> Option<&str> {
        self.hashes
            .iter()
            .find(|h| h.algorithm == HashAlgorithm::Sha256)
            .map(|h| h.digest.as_str())
    }

    /// Checks every declared hash against the payload bytes.
    pub fn payload_matches(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.length && self.hashes.iter().all(|h| h.matches(data))
    }

    /// True when another description names the identical payload: equal
    /// length and an identical declared hash set.
    pub fn same_payload(&self, other: &Target) -> bool {
        self.length == other.length && self.hashes == other.hashes
    }
}

/// Parsed Timestamp body.
#[derive(Debug, Clone)]
pub struct TimestampMeta {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub snapshot_version: u64,
    pub snapshot_length: Option<u64>,
    pub snapshot_hashes: Vec<Hash>,
}

impl TimestampMeta {
    pub fn from_signed(signed: &Value, expires: DateTime<Utc>) -> Result<Self, VerifyError> {
        let entry = signed
            .pointer("/meta/snapshot.json")
            .ok_or_else(|| VerifyError::ParseError {
                role: Role::Timestamp,
                detail: "missing meta entry for snapshot.json".to_string(),
            })?;
        Ok(Self {
            version: signed.get("version").and_then(Value::as_u64).unwrap_or(0),
            expires,
            snapshot_version: entry.get("version").and_then(Value::as_u64).unwrap_or(0),
            snapshot_length: entry.get("length").and_then(Value::as_u64),
            snapshot_hashes: parse_hashes(entry.get("hashes")),
        })
    }
}

/// One `meta` entry of a Snapshot body.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub version: u64,
    pub length: Option<u64>,
}

/// Parsed Snapshot body.
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, SnapshotEntry>,
}

impl SnapshotMeta {
    pub fn from_signed(signed: &Value, expires: DateTime<Utc>) -> Result<Self, VerifyError> {
        let raw = signed
            .get("meta")
            .and_then(Value::as_object)
            .ok_or_else(|| VerifyError::ParseError {
                role: Role::Snapshot,
                detail: "missing 'meta'".to_string(),
            })?;
        let mut meta = BTreeMap::new();
        for (name, entry) in raw {
            meta.insert(
                name.clone(),
                SnapshotEntry {
                    version: entry.get("version").and_then(Value::as_u64).unwrap_or(0),
                    length: entry.get("length").and_then(Value::as_u64),
                },
            );
        }
        Ok(Self {
            version: signed.get("version").and_then(Value::as_u64).unwrap_or(0),
            expires,
            meta,
        })
    }

    /// The expected description of the top-level targets metadata.
    pub fn targets_entry(&self) -> Option<&SnapshotEntry> {
        self.meta.get(Role::Targets.file_name())
    }
}

/// Parsed Targets body.
#[derive(Debug, Clone)]
pub struct TargetsMeta {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub targets: Vec<Target>,
}

impl TargetsMeta {
    pub fn from_signed(signed: &Value, expires: DateTime<Utc>) -> Result<Self, VerifyError> {
        let raw = signed
            .get("targets")
            .and_then(Value::as_object)
            .ok_or_else(|| VerifyError::ParseError {
                role: Role::Targets,
                detail: "missing 'targets'".to_string(),
            })?;
        let mut targets = Vec::with_capacity(raw.len());
        for (filename, value) in raw {
            let target =
                Target::from_wire(filename, value).map_err(|detail| VerifyError::ParseError {
                    role: Role::Targets,
                    detail,
                })?;
            targets.push(target);
        }
        Ok(Self {
            version: signed.get("version").and_then(Value::as_u64).unwrap_or(0),
            expires,
            targets,
        })
    }
}

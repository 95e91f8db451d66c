//! The Uptane role state machine for one repository.
//!
//! A [`Repository`] holds the verified metadata tree of either the Director
//! or the Image repository and is the only place raw role bytes become
//! trusted state. Roles are strictly ordered: Root (as a cross-signed
//! chain), then Timestamp, Snapshot, and Targets, each validated against the
//! current Root's key authorizations and against the expectations published
//! by the role above it.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::canonical::canonical_bytes;
use crate::crypto::SignatureMethod;
use crate::error::VerifyError;
use crate::metadata::{
    RepoKind, Role, SignedObject, SnapshotMeta, Target, TargetsMeta, TimestampMeta, TrustedRoot,
};

/// Verified metadata state for one repository.
#[derive(Debug, Clone)]
pub struct Repository {
    kind: RepoKind,
    root: Option<TrustedRoot>,
    timestamp: Option<TimestampMeta>,
    snapshot: Option<SnapshotMeta>,
    targets: Option<TargetsMeta>,
}

impl Repository {
    pub fn new(kind: RepoKind) -> Self {
        Self {
            kind,
            root: None,
            timestamp: None,
            snapshot: None,
            targets: None,
        }
    }

    pub fn kind(&self) -> RepoKind {
        self.kind
    }

    /// Version of the trusted Root, or zero when none is held.
    pub fn root_version(&self) -> u64 {
        self.root.as_ref().map(|r| r.version).unwrap_or(0)
    }

    /// Version of the trusted Targets, or zero when none is held.
    pub fn targets_version(&self) -> u64 {
        self.targets.as_ref().map(|t| t.version).unwrap_or(0)
    }

    /// Drops all non-Root state; called before every online iteration and
    /// whenever a newer Root is accepted.
    pub fn reset_meta(&mut self) {
        self.timestamp = None;
        self.snapshot = None;
        self.targets = None;
    }

    /// Installs an initial trust anchor.
    ///
    /// The bytes must be a Root envelope signed by the key set it itself
    /// declares, at its declared threshold. Expiry is deliberately not
    /// checked here; the caller decides whether a stale anchor is usable.
    pub fn init_root(&mut self, bytes: &[u8]) -> Result<(), VerifyError> {
        let object = SignedObject::parse(bytes, Role::Root)?;
        object.check_type(Role::Root)?;
        let expires = object.expires(Role::Root)?;
        let candidate = TrustedRoot::from_signed(&object.signed, expires)?;
        verify_signatures(&object, Role::Root, &candidate)?;
        debug!(repo = %self.kind, version = candidate.version, "trusted initial root");
        self.root = Some(candidate);
        self.reset_meta();
        Ok(())
    }

    /// Validates and commits the next Root in the rotation chain.
    ///
    /// Version `v+1` must be signed by the old key set at the old threshold
    /// and by its own key set at its own threshold, and must not be expired
    /// at commit time. Acceptance invalidates all non-Root metadata.
    pub fn verify_root(&mut self, bytes: &[u8], now: DateTime<Utc>) -> Result<(), VerifyError> {
        let current = self.root.as_ref().ok_or(VerifyError::NotFound {
            repo: self.kind,
            role: Role::Root,
        })?;
        let object = SignedObject::parse(bytes, Role::Root)?;
        object.check_type(Role::Root)?;
        let expires = object.expires(Role::Root)?;
        let candidate = TrustedRoot::from_signed(&object.signed, expires)?;

        if candidate.version != current.version + 1 {
            return Err(VerifyError::VersionOutOfOrder {
                role: Role::Root,
                have: current.version,
                got: candidate.version,
            });
        }
        verify_signatures(&object, Role::Root, current)?;
        verify_signatures(&object, Role::Root, &candidate)?;
        if candidate.expired_at(now) {
            return Err(VerifyError::ExpiredMetadata {
                repo: self.kind,
                role: Role::Root,
                expires: candidate.expires.to_rfc3339(),
            });
        }

        debug!(repo = %self.kind, version = candidate.version, "root rotated");
        self.root = Some(candidate);
        self.reset_meta();
        Ok(())
    }

    /// True when the trusted Root has expired relative to `now`.
    pub fn root_expired(&self, now: DateTime<Utc>) -> bool {
        self.root.as_ref().map(|r| r.expired_at(now)).unwrap_or(true)
    }

    /// Errors when the trusted Root is missing or expired; dependent roles
    /// must not be consulted past an expired Root.
    pub fn check_root_expired(&self, now: DateTime<Utc>) -> Result<(), VerifyError> {
        let root = self.require_root()?;
        if root.expired_at(now) {
            return Err(VerifyError::ExpiredMetadata {
                repo: self.kind,
                role: Role::Root,
                expires: root.expires.to_rfc3339(),
            });
        }
        Ok(())
    }

    /// Validates Timestamp metadata against the current Root.
    pub fn verify_timestamp(
        &mut self,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), VerifyError> {
        let root = self.require_root()?;
        let object = SignedObject::parse(bytes, Role::Timestamp)?;
        object.check_type(Role::Timestamp)?;
        verify_signatures(&object, Role::Timestamp, root)?;
        let expires = object.expires(Role::Timestamp)?;
        if expires <= now {
            return Err(VerifyError::ExpiredMetadata {
                repo: self.kind,
                role: Role::Timestamp,
                expires: expires.to_rfc3339(),
            });
        }
        let meta = TimestampMeta::from_signed(&object.signed, expires)?;
        if let Some(previous) = &self.timestamp {
            if meta.version < previous.version {
                return Err(VerifyError::VersionOutOfOrder {
                    role: Role::Timestamp,
                    have: previous.version,
                    got: meta.version,
                });
            }
        }
        self.timestamp = Some(meta);
        Ok(())
    }

    /// Validates Snapshot metadata.
    ///
    /// The previously accepted Timestamp is authoritative for the Snapshot's
    /// exact length, hashes, and version; the raw bytes must match all of
    /// them before the signatures are even relevant to trust.
    pub fn verify_snapshot(&mut self, bytes: &[u8], now: DateTime<Utc>) -> Result<(), VerifyError> {
        let root = self.require_root()?;
        let timestamp = self.timestamp.as_ref().ok_or(VerifyError::NotFound {
            repo: self.kind,
            role: Role::Timestamp,
        })?;

        if let Some(expected) = timestamp.snapshot_length {
            if bytes.len() as u64 != expected {
                return Err(VerifyError::LengthMismatch {
                    role: Role::Snapshot,
                    actual: bytes.len(),
                    expected,
                    declared_by: Role::Timestamp,
                });
            }
        }
        for hash in &timestamp.snapshot_hashes {
            if !hash.matches(bytes) {
                return Err(VerifyError::HashMismatch {
                    role: Role::Snapshot,
                    algorithm: hash.algorithm.to_string(),
                    declared_by: Role::Timestamp,
                });
            }
        }

        let object = SignedObject::parse(bytes, Role::Snapshot)?;
        object.check_type(Role::Snapshot)?;
        verify_signatures(&object, Role::Snapshot, root)?;
        let expires = object.expires(Role::Snapshot)?;
        if expires <= now {
            return Err(VerifyError::ExpiredMetadata {
                repo: self.kind,
                role: Role::Snapshot,
                expires: expires.to_rfc3339(),
            });
        }
        let meta = SnapshotMeta::from_signed(&object.signed, expires)?;
        if meta.version != timestamp.snapshot_version {
            return Err(VerifyError::VersionOutOfOrder {
                role: Role::Snapshot,
                have: timestamp.snapshot_version,
                got: meta.version,
            });
        }
        if let Some(previous) = &self.snapshot {
            if meta.version < previous.version {
                return Err(VerifyError::VersionOutOfOrder {
                    role: Role::Snapshot,
                    have: previous.version,
                    got: meta.version,
                });
            }
        }
        self.snapshot = Some(meta);
        Ok(())
    }

    /// Validates Targets metadata.
    ///
    /// When a Snapshot is held (Image repository), the Targets version must
    /// equal the Snapshot's expectation and the bytes must fit its declared
    /// length. The Director repository carries no Snapshot, so its Targets
    /// verify directly against Root.
    pub fn verify_targets(&mut self, bytes: &[u8], now: DateTime<Utc>) -> Result<(), VerifyError> {
        let root = self.require_root()?;
        let object = SignedObject::parse(bytes, Role::Targets)?;
        object.check_type(Role::Targets)?;
        verify_signatures(&object, Role::Targets, root)?;
        let expires = object.expires(Role::Targets)?;
        if expires <= now {
            return Err(VerifyError::ExpiredMetadata {
                repo: self.kind,
                role: Role::Targets,
                expires: expires.to_rfc3339(),
            });
        }
        let meta = TargetsMeta::from_signed(&object.signed, expires)?;

        if let Some(snapshot) = &self.snapshot {
            if let Some(entry) = snapshot.targets_entry() {
                if meta.version != entry.version {
                    return Err(VerifyError::VersionOutOfOrder {
                        role: Role::Targets,
                        have: entry.version,
                        got: meta.version,
                    });
                }
                if let Some(length) = entry.length {
                    if bytes.len() as u64 > length {
                        return Err(VerifyError::LengthMismatch {
                            role: Role::Targets,
                            actual: bytes.len(),
                            expected: length,
                            declared_by: Role::Snapshot,
                        });
                    }
                }
            }
        }
        if let Some(previous) = &self.targets {
            if meta.version < previous.version {
                return Err(VerifyError::VersionOutOfOrder {
                    role: Role::Targets,
                    have: previous.version,
                    got: meta.version,
                });
            }
        }
        self.targets = Some(meta);
        Ok(())
    }

    /// Returns the currently trusted targets, empty when none are trusted.
    pub fn targets(&self) -> Vec<Target> {
        self.targets
            .as_ref()
            .map(|t| t.targets.clone())
            .unwrap_or_default()
    }

    /// Looks up a trusted target by file name.
    pub fn target(&self, filename: &str) -> Option<&Target> {
        self.targets
            .as_ref()
            .and_then(|t| t.targets.iter().find(|target| target.filename == filename))
    }

    fn require_root(&self) -> Result<&TrustedRoot, VerifyError> {
        self.root.as_ref().ok_or(VerifyError::NotFound {
            repo: self.kind,
            role: Role::Root,
        })
    }
}

/// Counts signatures toward the role's threshold.
///
/// A signature counts only when its key id is authorized for the role, it is
/// the first signature from that key id, its method matches the key, and it
/// verifies over the exact canonical bytes. Signatures from unauthorized
/// keys are ignored rather than rejected so that third-party countersigning
/// cannot invalidate otherwise good metadata.
fn verify_signatures(
    object: &SignedObject,
    role: Role,
    root: &TrustedRoot,
) -> Result<(), VerifyError> {
    let role_keys = root.role_keys(role);
    let canonical = canonical_bytes(&object.signed);

    let mut seen: HashSet<&str> = HashSet::new();
    let mut authorized = 0usize;
    let mut valid = 0usize;
    for block in &object.signatures {
        if !role_keys.keyids.iter().any(|id| id == &block.keyid) {
            continue;
        }
        if !seen.insert(block.keyid.as_str()) {
            continue;
        }
        authorized += 1;
        let Some(key) = root.key(&block.keyid) else {
            continue;
        };
        let Some(method) = SignatureMethod::from_wire(&block.method) else {
            continue;
        };
        if key.verify(method, &block.sig, &canonical) {
            valid += 1;
        }
    }

    if authorized == 0 {
        return Err(VerifyError::MissingSignatures { role });
    }
    if valid == 0 {
        return Err(VerifyError::BadSignature { role });
    }
    if (valid as u32) < role_keys.threshold {
        return Err(VerifyError::BadThreshold {
            role,
            valid,
            threshold: role_keys.threshold,
        });
    }
    Ok(())
}

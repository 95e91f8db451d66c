//! Uptane metadata model and role verification.
//!
//! This crate owns everything between raw metadata bytes and a trusted
//! `Targets` list: the canonical JSON serialization every signature is
//! computed over, the key/signature primitives, the typed role bodies, and
//! the [`Repository`] state machine that enforces root rotation, threshold
//! signing, expiry, and cross-role consistency for one repository.
//!
//! The crate performs no I/O. Fetching, storage, and the update decision
//! loop live in the `ota-agent` crate and feed bytes in here.

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod metadata;
pub mod repository;

pub use canonical::{canonical_bytes, canonical_string};
pub use crypto::{
    sha256_hex, sha512_hex, Ed25519Signer, KeyType, PublicKey, SignatureBlock, SignatureMethod,
};
pub use error::VerifyError;
pub use metadata::{
    extract_version_untrusted, Hash, HashAlgorithm, RepoKind, Role, RoleKeys, SignedObject,
    SnapshotMeta, Target, TargetFormat, TargetsMeta, TimestampMeta, TrustedRoot,
};
pub use repository::Repository;

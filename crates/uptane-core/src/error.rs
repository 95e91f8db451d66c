//! Error taxonomy for metadata verification.

use thiserror::Error;

use crate::metadata::{RepoKind, Role};

/// Everything that can go wrong while verifying a role.
///
/// Every kind is recoverable in principle; the update engine decides whether
/// a failure aborts the iteration or only the affected role.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{repo} {role} metadata not found")]
    NotFound { repo: RepoKind, role: Role },
    #[error("failed to parse {role} metadata: {detail}")]
    ParseError { role: Role, detail: String },
    #[error("{role} metadata carries no signatures from authorized keys")]
    MissingSignatures { role: Role },
    #[error("{role} signatures below threshold: {valid} valid of {threshold} required")]
    BadThreshold {
        role: Role,
        valid: usize,
        threshold: u32,
    },
    #[error("{role} metadata references key id {keyid} absent from the root key set")]
    BadKeyId { role: Role, keyid: String },
    #[error("all authorized signatures on {role} metadata failed verification")]
    BadSignature { role: Role },
    #[error("{role} version regressed: have {have}, got {got}")]
    VersionOutOfOrder { role: Role, have: u64, got: u64 },
    #[error("{repo} {role} metadata expired at {expires}")]
    ExpiredMetadata {
        repo: RepoKind,
        role: Role,
        expires: String,
    },
    #[error("{role} bytes do not match the {algorithm} hash declared by {declared_by}")]
    HashMismatch {
        role: Role,
        algorithm: String,
        declared_by: Role,
    },
    #[error("{role} length {actual} violates the {expected} bytes declared by {declared_by}")]
    LengthMismatch {
        role: Role,
        actual: usize,
        expected: u64,
        declared_by: Role,
    },
    #[error("metadata declares type {found:?} where {expected} was required")]
    RoleMismatch { expected: Role, found: String },
}

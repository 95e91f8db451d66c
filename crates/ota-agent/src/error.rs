//! Agent-level error taxonomy.
//!
//! Verification failures from `uptane-core` fold into three agent kinds so
//! the engine's command loop can decide retry behaviour without matching on
//! every verifier detail: expiry, rollback, and everything else invalid.

use thiserror::Error;
use uptane_core::VerifyError;

use crate::storage::StoreError;
use crate::transport::TransportError;

/// Top-level failure kinds surfaced as error events.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("parse: {0}")]
    Parse(String),
    #[error("crypto: {0}")]
    Crypto(String),
    #[error("metadata expired: {0}")]
    MetadataExpired(VerifyError),
    #[error("metadata rollback: {0}")]
    MetadataRollback(String),
    #[error("metadata invalid: {0}")]
    MetadataInvalid(VerifyError),
    #[error("target mismatch: {0}")]
    TargetMismatch(String),
    #[error("storage: {0}")]
    StorageFailure(#[from] StoreError),
    #[error("package install failed: {0}")]
    PackageInstallFailed(String),
    #[error("secondary unreachable: {0}")]
    SecondaryUnreachable(String),
    #[error("configuration: {0}")]
    Configuration(String),
}

impl From<VerifyError> for AgentError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::ExpiredMetadata { .. } => AgentError::MetadataExpired(err),
            VerifyError::VersionOutOfOrder { .. } => AgentError::MetadataRollback(err.to_string()),
            other => AgentError::MetadataInvalid(other),
        }
    }
}

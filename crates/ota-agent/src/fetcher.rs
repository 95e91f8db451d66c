//! Bounded-size role downloads.
//!
//! Every role has a hard byte cap so a malicious or broken repository can
//! never exhaust memory: oversized responses fail with a transport error
//! before any parsing happens. Transient (5xx) failures get a short bounded
//! retry; everything else is reported verbatim and left to the next poll.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uptane_core::{RepoKind, Role};

use crate::flow::FlowControlToken;
use crate::transport::{Transport, TransportError};

/// Hard byte cap for Root metadata.
pub const MAX_ROOT_SIZE: u64 = 64 * 1024;
/// Hard byte cap for Timestamp metadata.
pub const MAX_TIMESTAMP_SIZE: u64 = 64 * 1024;
/// Hard byte cap for Snapshot metadata.
pub const MAX_SNAPSHOT_SIZE: u64 = 2 * 1024 * 1024;
/// Hard byte cap for Image-repository Targets metadata.
pub const MAX_IMAGE_TARGETS_SIZE: u64 = 8 * 1024 * 1024;
/// Hard byte cap for Director Targets metadata.
pub const MAX_DIRECTOR_TARGETS_SIZE: u64 = 1024 * 1024;

/// Extra attempts after a transient failure.
const RETRYABLE_ATTEMPTS: u32 = 2;
/// Pause between transient-failure attempts.
const RETRY_PAUSE: Duration = Duration::from_millis(250);

/// Downloads role metadata from the Director and Image repositories.
#[derive(Debug, Clone)]
pub struct Fetcher<T> {
    transport: Arc<T>,
    director_url: String,
    image_url: String,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: Arc<T>, director_url: &str, image_url: &str) -> Self {
        Self {
            transport,
            director_url: director_url.trim_end_matches('/').to_string(),
            image_url: image_url.trim_end_matches('/').to_string(),
        }
    }

    /// The byte cap applied to one role of one repository.
    pub fn role_limit(repo: RepoKind, role: Role) -> u64 {
        match role {
            Role::Root => MAX_ROOT_SIZE,
            Role::Timestamp => MAX_TIMESTAMP_SIZE,
            Role::Snapshot => MAX_SNAPSHOT_SIZE,
            Role::Targets => match repo {
                RepoKind::Director => MAX_DIRECTOR_TARGETS_SIZE,
                RepoKind::Image => MAX_IMAGE_TARGETS_SIZE,
            },
        }
    }

    /// Fetches a specific version of a role (only Roots are versioned).
    pub async fn fetch_role(
        &self,
        repo: RepoKind,
        role: Role,
        version: Option<u64>,
        token: &FlowControlToken,
    ) -> Result<Vec<u8>, TransportError> {
        let base = self.base_url(repo);
        let url = match version {
            Some(version) => format!("{base}/{version}.{}", role.file_name()),
            None => format!("{base}/{}", role.file_name()),
        };
        self.get_with_retry(&url, Self::role_limit(repo, role), token)
            .await
    }

    /// Fetches the latest copy of a role.
    pub async fn fetch_latest_role(
        &self,
        repo: RepoKind,
        role: Role,
        token: &FlowControlToken,
    ) -> Result<Vec<u8>, TransportError> {
        self.fetch_role(repo, role, None, token).await
    }

    fn base_url(&self, repo: RepoKind) -> &str {
        match repo {
            RepoKind::Director => &self.director_url,
            RepoKind::Image => &self.image_url,
        }
    }

    async fn get_with_retry(
        &self,
        url: &str,
        limit: u64,
        token: &FlowControlToken,
    ) -> Result<Vec<u8>, TransportError> {
        let mut attempt = 0u32;
        loop {
            match self.transport.get(url, limit, token).await {
                Ok(bytes) => {
                    debug!(url, bytes = bytes.len(), "role fetched");
                    return Ok(bytes);
                }
                Err(err) if err.is_retryable() && attempt < RETRYABLE_ATTEMPTS => {
                    attempt += 1;
                    warn!(url, %err, attempt, "transient fetch failure, retrying");
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

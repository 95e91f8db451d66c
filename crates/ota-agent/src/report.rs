//! Event reports to the backend.
//!
//! Delivery is at-least-once: every report carries a UUID so the backend
//! can deduplicate, and reports survive transport failures by staying in
//! the queue until a flush succeeds. Order is preserved.

use std::collections::VecDeque;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::transport::Transport;

/// Queue of undelivered report payloads.
#[derive(Debug, Default)]
pub struct ReportQueue {
    pending: VecDeque<Value>,
}

impl ReportQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues one event wrapped in the standard report envelope.
    pub fn enqueue(&mut self, event_type: &str, event: Value) {
        self.pending.push_back(json!({
            "id": Uuid::new_v4().to_string(),
            "deviceTime": Utc::now().to_rfc3339(),
            "eventType": { "id": event_type, "version": 1 },
            "event": event,
        }));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Delivers queued reports in order; stops at the first failure and
    /// keeps the remainder (including the failed one) for the next flush.
    pub async fn flush<T: Transport>(&mut self, transport: &T, url: &str) {
        while let Some(report) = self.pending.front() {
            match transport.put(url, report).await {
                Ok(()) => {
                    debug!(url, "report delivered");
                    self.pending.pop_front();
                }
                Err(err) => {
                    warn!(url, %err, queued = self.pending.len(), "report delivery failed, retaining queue");
                    break;
                }
            }
        }
    }
}

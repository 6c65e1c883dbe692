use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication/authorization failure; retrying without fresh
    /// credentials will not help.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the server.
    RateLimited,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload crossing the sync-core boundary.
///
/// `code` is machine-readable and stable; `message` is for humans only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    /// Construct a new sync error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// The push channel could not be opened (authentication or transport).
    pub fn connection_failed(message: impl Into<String>, auth_failure: bool) -> Self {
        let category = if auth_failure {
            SyncErrorCategory::Auth
        } else {
            SyncErrorCategory::Network
        };
        Self::new(category, "connection_failed", message)
    }

    /// The REST history fetch failed; the timeline stays empty.
    pub fn history_load_failed(source: SyncError) -> Self {
        Self {
            category: source.category,
            code: "history_load_failed".to_owned(),
            message: format!("history fetch failed: {}", source.message),
            retry_after_ms: source.retry_after_ms,
        }
    }

    /// The send REST call failed; the optimistic entry stays visible.
    pub fn send_failed(source: SyncError) -> Self {
        Self {
            category: source.category,
            code: "send_failed".to_owned(),
            message: format!("send failed: {}", source.message),
            retry_after_ms: source.retry_after_ms,
        }
    }

    /// An inbound frame failed shape validation.
    pub fn malformed_event(message: impl Into<String>) -> Self {
        Self::new(
            SyncErrorCategory::Serialization,
            "malformed_event",
            message,
        )
    }

    /// Build a standard invalid-transition error for the channel machine.
    pub fn invalid_transition(current: ConnectionState, signal: impl Into<String>) -> Self {
        let signal = signal.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_connection_transition",
            format!("cannot apply '{signal}' while the channel is {current:?}"),
        )
    }
}

/// Map an HTTP status code from the REST collaborator to an error category.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        401 | 403 => SyncErrorCategory::Auth,
        429 => SyncErrorCategory::RateLimited,
        408 => SyncErrorCategory::Network,
        400..=499 => SyncErrorCategory::Config,
        500..=599 => SyncErrorCategory::Network,
        _ => SyncErrorCategory::Internal,
    }
}

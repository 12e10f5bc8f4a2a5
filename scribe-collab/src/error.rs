//! Error kinds surfaced by a collaborative session.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::protocol::ProtocolError;
use crate::replica::ReplicaError;

/// Failures a sync channel can report, sorted by whether retrying helps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The connection dropped or could not be established; retried.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    /// The relay refused the room. Not retried.
    #[error("room rejected: {0}")]
    RoomRejected(String),
    /// A remote operation could not be decoded or applied; it was dropped.
    #[error("malformed operation: {0}")]
    MalformedOperation(String),
    /// An awareness payload could not be decoded; it was dropped.
    #[error("undecodable presence update: {0}")]
    PresenceDecode(String),
    /// The reconnect policy ran out of attempts.
    #[error("retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },
}

impl SyncError {
    /// Whether the channel stops for good after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RoomRejected(_) | Self::RetryBudgetExhausted { .. }
        )
    }

    /// Classify a WebSocket failure. An HTTP client error on the upgrade
    /// means the relay refused this room; everything else is worth a retry.
    pub fn from_transport(err: &tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) if response.status().is_client_error() => {
                let reason = response
                    .body()
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .filter(|body| !body.is_empty())
                    .map(|body| format!("HTTP {}: {}", response.status(), body))
                    .unwrap_or_else(|| format!("HTTP {}", response.status()));
                Self::RoomRejected(reason)
            }
            other => Self::TransientNetwork(other.to_string()),
        }
    }
}

impl From<ReplicaError> for SyncError {
    fn from(err: ReplicaError) -> Self {
        Self::MalformedOperation(err.to_string())
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        Self::MalformedOperation(err.to_string())
    }
}

//! Session configuration.

use std::time::Duration;

use crate::backoff::ReconnectPolicy;
use crate::presence::DEFAULT_PRESENCE_TIMEOUT;
use crate::protocol::PeerMetadata;

/// Relay endpoint used when nothing is configured.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:1234";

/// Environment variable holding the relay endpoint.
pub const ENDPOINT_ENV: &str = "SCRIBE_SYNC_URL";

/// Shortest heartbeat or autosave period a session will run.
pub const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Configuration for one [`SessionManager`](crate::session::SessionManager).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base WebSocket URL; the room is `{endpoint}/{document_id}`
    pub endpoint: String,
    pub reconnect: ReconnectPolicy,
    /// Remote peers silent for longer than this disappear
    pub presence_timeout: Duration,
    /// How often the local peer re-announces itself
    pub heartbeat_interval: Duration,
    /// Push dirty content to the snapshot sink this often; `None` disables
    pub autosave_interval: Option<Duration>,
    /// Local display metadata; `None` derives a color from the peer id
    pub local_peer: Option<PeerMetadata>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            reconnect: ReconnectPolicy::default(),
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
            heartbeat_interval: DEFAULT_PRESENCE_TIMEOUT / 3,
            autosave_interval: Some(Duration::from_secs(2)),
            local_peer: None,
        }
    }
}

impl SessionConfig {
    /// Defaults, with the endpoint taken from `SCRIBE_SYNC_URL` if set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(endpoint) = lookup(ENDPOINT_ENV).filter(|v| !v.trim().is_empty()) {
            config.endpoint = endpoint.trim().to_string();
        }
        config
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_local_peer(mut self, metadata: PeerMetadata) -> Self {
        self.local_peer = Some(metadata);
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the presence timeout; the heartbeat follows at a third of it.
    pub fn with_presence_timeout(mut self, timeout: Duration) -> Self {
        self.presence_timeout = timeout;
        self.heartbeat_interval = (timeout / 3).max(MIN_TIMER_PERIOD);
        self
    }

    /// Set the autosave period, raised to at least [`MIN_TIMER_PERIOD`].
    pub fn with_autosave(mut self, interval: Option<Duration>) -> Self {
        self.autosave_interval = interval.map(|period| period.max(MIN_TIMER_PERIOD));
        self
    }
}

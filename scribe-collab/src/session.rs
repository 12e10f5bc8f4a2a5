//! The lifetime of "editing document D" from one client.
//!
//! ## State machine
//!
//! ```text
//!            open()
//!   Idle ───────────▶ Connecting ──(fatal / budget spent)──▶ Failed
//!                         │
//!                     connected
//!                         ▼
//!                     Connected ◀──────── connected ───────┐
//!                         │                                │
//!                   transport drop                         │
//!                         ▼                                │
//!                    Reconnecting ─────────────────────────┘
//!                         │
//!                  budget spent ──▶ Failed
//!
//!   any ── close() ──▶ Closed
//! ```
//!
//! A session is driven cooperatively: the owner calls [`SessionManager::pump`]
//! on its event loop and every callback fires from inside `pump` (or from
//! `set_presence`). Nothing here is shared across threads.
//!
//! Until the first handshake completes, local edits land in a private draft
//! replica. When the relay first answers with its state, the draft text is
//! appended once to the collaborative replica and the draft is discarded.

use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::channel::{ChannelEvent, SyncChannel};
use crate::config::{SessionConfig, MIN_TIMER_PERIOD};
use crate::error::SyncError;
use crate::presence::{AwarenessUpdate, PeerPresence, PresenceDirectory};
use crate::protocol::{MessageType, PeerMetadata, SyncMessage};
use crate::replica::{ReplicaError, ReplicaStore, TextEdit};
use crate::surface::SnapshotSink;

/// Connection lifecycle of a [`SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
    Failed,
}

impl SessionState {
    /// Whether the session has stopped for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

type ChangeFn = Box<dyn FnMut(&str) + Send>;
type PresenceFn = Box<dyn FnMut(&[PeerPresence]) + Send>;
type StateFn = Box<dyn FnMut(SessionState, Option<&SyncError>) + Send>;

/// Observers for a session. Each is optional.
#[derive(Default)]
pub struct SessionCallbacks {
    on_change: Option<ChangeFn>,
    on_presence: Option<PresenceFn>,
    on_state: Option<StateFn>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content changed for a reason other than a local edit.
    pub fn on_change(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_change = Some(Box::new(f));
        self
    }

    /// The visible peer list changed.
    pub fn on_presence(mut self, f: impl FnMut(&[PeerPresence]) + Send + 'static) -> Self {
        self.on_presence = Some(Box::new(f));
        self
    }

    /// The session moved to a new state, with the error that caused it.
    pub fn on_state(
        mut self,
        f: impl FnMut(SessionState, Option<&SyncError>) + Send + 'static,
    ) -> Self {
        self.on_state = Some(Box::new(f));
        self
    }

    fn change(&mut self, content: &str) {
        if let Some(f) = self.on_change.as_mut() {
            f(content);
        }
    }

    fn presence(&mut self, peers: &[PeerPresence]) {
        if let Some(f) = self.on_presence.as_mut() {
            f(peers);
        }
    }

    fn state(&mut self, state: SessionState, cause: Option<&SyncError>) {
        if let Some(f) = self.on_state.as_mut() {
            f(state, cause);
        }
    }
}

struct Autosave {
    sink: Box<dyn SnapshotSink>,
    interval: Interval,
    dirty: bool,
}

/// One collaborative editing session for one document.
pub struct SessionManager {
    document_id: String,
    peer_id: Uuid,
    state: SessionState,
    replica: ReplicaStore,
    /// Local-only replica used until the first handshake completes
    draft: Option<ReplicaStore>,
    presence: PresenceDirectory,
    channel: Option<SyncChannel>,
    callbacks: SessionCallbacks,
    heartbeat: Interval,
    autosave_interval: Option<Duration>,
    autosave: Option<Autosave>,
    last_error: Option<SyncError>,
}

impl SessionManager {
    /// Open a session for `document_id` and start connecting.
    ///
    /// Returns at once in [`SessionState::Connecting`]. Must be called inside
    /// a tokio runtime.
    pub fn open(
        config: SessionConfig,
        document_id: impl Into<String>,
        callbacks: SessionCallbacks,
    ) -> Result<Self, ReplicaError> {
        let document_id = document_id.into();
        let peer_id = Uuid::new_v4();
        let local = config
            .local_peer
            .clone()
            .unwrap_or_else(|| PeerMetadata::for_peer(peer_id, PeerMetadata::generated_name()));

        let heartbeat = ticker(config.heartbeat_interval);
        let mut session = Self {
            replica: ReplicaStore::with_replica_id(peer_id)?,
            draft: Some(ReplicaStore::new()?),
            presence: PresenceDirectory::with_timeout(peer_id, local, config.presence_timeout),
            channel: None,
            callbacks,
            heartbeat,
            autosave_interval: config.autosave_interval,
            autosave: None,
            last_error: None,
            document_id,
            peer_id,
            state: SessionState::Idle,
        };

        log::info!("Opening session for {} as {}", session.document_id, peer_id);
        session.channel = Some(SyncChannel::open(
            &config.endpoint,
            &session.document_id,
            config.reconnect.clone(),
        ));
        session.set_state(SessionState::Connecting, None);
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Random id this session publishes under, fresh on every open.
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Error behind the most recent non-connected state, if any.
    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    /// Whether the draft has been merged into the shared document.
    pub fn is_bound(&self) -> bool {
        self.draft.is_none()
    }

    /// Current content. No side effects.
    pub fn snapshot(&self) -> String {
        match &self.draft {
            Some(draft) => draft.snapshot(),
            None => self.replica.snapshot(),
        }
    }

    /// Present peers, local peer included.
    pub fn peers(&mut self) -> Vec<PeerPresence> {
        self.presence.list(std::time::Instant::now())
    }

    /// Push dirty content to `sink` on the configured autosave interval and
    /// once more on close.
    pub fn set_snapshot_sink(&mut self, sink: impl SnapshotSink + 'static) {
        let Some(period) = self.autosave_interval else {
            log::debug!("Autosave disabled; snapshot sink for {} ignored", self.document_id);
            return;
        };
        self.autosave = Some(Autosave {
            sink: Box::new(sink),
            interval: ticker(period),
            dirty: false,
        });
    }

    /// Apply an edit from the surface. Takes effect immediately and never
    /// waits for the network.
    pub fn apply_local_edit(&mut self, edit: TextEdit) {
        if self.state == SessionState::Closed {
            log::debug!("Ignoring edit on closed session {}", self.document_id);
            return;
        }

        if let Some(draft) = self.draft.as_mut() {
            if !draft.apply_local(edit).is_empty() {
                self.mark_dirty();
            }
            return;
        }

        let ops = self.replica.apply_local(edit);
        if ops.is_empty() {
            return;
        }
        self.mark_dirty();
        if let Some(channel) = &self.channel {
            channel.send(SyncMessage::update(self.peer_id, &ops));
        }
    }

    /// Change the local display metadata and announce it.
    pub fn set_presence(&mut self, metadata: PeerMetadata) {
        if self.state == SessionState::Closed {
            return;
        }
        let update = self.presence.set_local(metadata);
        self.send_awareness(&update);
        self.notify_presence();
    }

    /// Drop the live transport and reconnect under the configured policy.
    /// Hook for network-change notifications.
    pub fn drop_connection(&self) {
        if let Some(channel) = &self.channel {
            channel.drop_connection();
        }
    }

    /// Process the next channel event or timer tick.
    ///
    /// Returns false without waiting once the session is closed or failed.
    pub async fn pump(&mut self) -> bool {
        if self.state.is_terminal() {
            tokio::task::yield_now().await;
            return false;
        }
        let Some(channel) = self.channel.as_mut() else {
            tokio::task::yield_now().await;
            return false;
        };

        tokio::select! {
            event = channel.next_event() => match event {
                Some(event) => self.handle_event(event),
                None => self.fail(SyncError::TransientNetwork("channel task exited".into())),
            },
            _ = self.heartbeat.tick() => self.on_heartbeat(),
            _ = autosave_tick(self.autosave.as_mut()) => self.flush_autosave(),
        }
        true
    }

    /// Tear the session down: announce departure, stop the channel, flush
    /// autosave. Idempotent; no callback fires after this returns.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(mut channel) = self.channel.take() {
            if self.state == SessionState::Connected {
                channel.send(self.presence.leave().to_message());
            }
            channel.close().await;
        }
        self.flush_autosave();
        self.presence.clear_remote();

        log::info!("Closed session for {}", self.document_id);
        self.state = SessionState::Closed;
        self.callbacks.state(SessionState::Closed, None);
        self.callbacks = SessionCallbacks::default();
        self.autosave = None;
    }

    // ── Event handling ──

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { resumed } => {
                self.last_error = None;
                self.set_state(SessionState::Connected, None);
                let step1 = SyncMessage::sync_step1(self.peer_id, &self.replica.state_vector());
                let hello = self.presence.rejoin();
                if let Some(channel) = &self.channel {
                    channel.send(step1);
                }
                self.send_awareness(&hello);
                log::debug!("Handshake sent for {} (resumed: {resumed})", self.document_id);
            }
            ChannelEvent::Message(msg) => self.handle_message(msg),
            ChannelEvent::Disconnected(err) => {
                self.set_state(SessionState::Reconnecting, Some(err));
            }
            ChannelEvent::Retrying {
                attempt,
                delay,
                cause,
            } => {
                log::debug!(
                    "{} retry {attempt} in {delay:?} after: {cause}",
                    self.document_id
                );
                self.last_error = Some(cause);
            }
            ChannelEvent::Failed(err) => self.fail(err),
        }
    }

    fn handle_message(&mut self, msg: SyncMessage) {
        if msg.peer_id == self.peer_id {
            return;
        }

        match msg.msg_type {
            MessageType::SyncStep1 => match msg.state_vector() {
                Ok(sv) => {
                    let missing = self.replica.missing_since(&sv);
                    if let Some(channel) = &self.channel {
                        channel.send(SyncMessage::sync_step2(self.peer_id, &missing));
                    }
                }
                Err(e) => log::warn!("Dropping bad state vector from {}: {e}", msg.peer_id),
            },
            MessageType::SyncStep2 | MessageType::Update => {
                let before = self.snapshot();
                let applied = msg
                    .operations()
                    .map_err(SyncError::from)
                    .and_then(|batch| self.replica.apply_remote_batch(batch).map_err(SyncError::from));
                if let Err(e) = applied {
                    log::warn!("Dropping operations from {}: {e}", msg.peer_id);
                }
                if msg.msg_type == MessageType::SyncStep2 {
                    self.bind_draft();
                }
                let after = self.snapshot();
                if after != before {
                    self.mark_dirty();
                    self.callbacks.change(&after);
                }
            }
            MessageType::Awareness => match AwarenessUpdate::from_message(&msg) {
                Ok(update) => {
                    let change = self.presence.observe(update, std::time::Instant::now());
                    if change.is_visible() {
                        self.notify_presence();
                    }
                }
                Err(e) => {
                    let err = SyncError::PresenceDecode(e.to_string());
                    log::trace!("Dropping awareness from {}: {err}", msg.peer_id);
                }
            },
        }
    }

    /// Fold the draft into the collaborative replica, once.
    fn bind_draft(&mut self) {
        let Some(draft) = self.draft.take() else {
            return;
        };
        let text = draft.snapshot();
        if text.is_empty() {
            log::debug!("Bound {} with an empty draft", self.document_id);
            return;
        }

        let end = self.replica.len();
        let ops = self.replica.apply_local(TextEdit::insert(end, text));
        log::info!(
            "Bound {} and merged {} chars of draft",
            self.document_id,
            draft.len()
        );
        if let Some(channel) = &self.channel {
            channel.send(SyncMessage::update(self.peer_id, &ops));
        }
    }

    fn on_heartbeat(&mut self) {
        if self.state == SessionState::Connected {
            let update = self.presence.heartbeat();
            self.send_awareness(&update);
        }
        let expired = self.presence.expire(std::time::Instant::now());
        if !expired.is_empty() {
            log::debug!("{} peers timed out in {}", expired.len(), self.document_id);
            self.notify_presence();
        }
    }

    fn fail(&mut self, err: SyncError) {
        log::warn!("Session for {} failed: {err}", self.document_id);
        if self.presence.clear_remote() {
            self.notify_presence();
        }
        self.set_state(SessionState::Failed, Some(err));
    }

    fn set_state(&mut self, state: SessionState, cause: Option<SyncError>) {
        if self.state == state {
            return;
        }
        log::debug!("{}: {:?} -> {:?}", self.document_id, self.state, state);
        self.state = state;
        if cause.is_some() {
            self.last_error = cause;
        }
        let cause = if state == SessionState::Connected {
            None
        } else {
            self.last_error.as_ref()
        };
        self.callbacks.state(state, cause);
    }

    fn send_awareness(&self, update: &AwarenessUpdate) {
        if self.state != SessionState::Connected {
            return;
        }
        if let Some(channel) = &self.channel {
            channel.send(update.to_message());
        }
    }

    fn notify_presence(&mut self) {
        let peers = self.presence.list(std::time::Instant::now());
        self.callbacks.presence(&peers);
    }

    fn mark_dirty(&mut self) {
        if let Some(autosave) = self.autosave.as_mut() {
            autosave.dirty = true;
        }
    }

    fn flush_autosave(&mut self) {
        let content = self.snapshot();
        let Some(autosave) = self.autosave.as_mut() else {
            return;
        };
        if !autosave.dirty {
            return;
        }
        match autosave.sink.store_snapshot(&self.document_id, &content) {
            Ok(()) => autosave.dirty = false,
            Err(e) => log::warn!("Autosave of {} failed: {e}", self.document_id),
        }
    }
}

/// Interval whose first tick is one period away. Periods below
/// [`MIN_TIMER_PERIOD`] are raised to it.
fn ticker(period: Duration) -> Interval {
    let period = period.max(MIN_TIMER_PERIOD);
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn autosave_tick(autosave: Option<&mut Autosave>) {
    match autosave {
        Some(autosave) => {
            autosave.interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectPolicy;
    use crate::surface::MemorySnapshotSink;
    use std::sync::{Arc, Mutex};

    async fn dead_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("ws://127.0.0.1:{port}")
    }

    fn quick_policy(max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
            max_retries: Some(max_retries),
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Reconnecting.is_terminal());
    }

    #[tokio::test]
    async fn test_open_starts_connecting_and_edits_locally() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = states.clone();
        let callbacks = SessionCallbacks::new()
            .on_state(move |state, _| seen.lock().unwrap().push(state));
        let config = SessionConfig::default()
            .with_endpoint(dead_endpoint().await)
            .with_reconnect(quick_policy(50));

        let mut session = SessionManager::open(config, "draft-doc", callbacks).unwrap();
        assert_eq!(session.state(), SessionState::Connecting);

        session.apply_local_edit(TextEdit::insert(0, "offline draft"));
        assert_eq!(session.snapshot(), "offline draft");
        assert!(!session.is_bound());

        session.close().await;
        assert_eq!(
            *states.lock().unwrap(),
            vec![SessionState::Connecting, SessionState::Closed]
        );
    }

    #[tokio::test]
    async fn test_budget_exhaustion_fails_session() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = errors.clone();
        let callbacks = SessionCallbacks::new().on_state(move |state, err| {
            seen.lock().unwrap().push((state, err.cloned()));
        });
        let config = SessionConfig::default()
            .with_endpoint(dead_endpoint().await)
            .with_reconnect(quick_policy(1));

        let mut session = SessionManager::open(config, "doc", callbacks).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.pump().await {}
        })
        .await
        .unwrap();

        assert_eq!(session.state(), SessionState::Failed);
        let last = errors.lock().unwrap().last().cloned().unwrap();
        assert_eq!(
            last,
            (
                SessionState::Failed,
                Some(SyncError::RetryBudgetExhausted { attempts: 1 })
            )
        );

        // Local edits still apply after failure.
        session.apply_local_edit(TextEdit::insert(0, "kept"));
        assert_eq!(session.snapshot(), "kept");
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silences_callbacks() {
        let count = Arc::new(Mutex::new(0));
        let seen = count.clone();
        let callbacks = SessionCallbacks::new().on_state(move |_, _| *seen.lock().unwrap() += 1);
        let config = SessionConfig::default()
            .with_endpoint(dead_endpoint().await)
            .with_reconnect(quick_policy(50));
        let mut session = SessionManager::open(config, "doc", callbacks).unwrap();

        session.close().await;
        let after_first = *count.lock().unwrap();
        session.close().await;
        session.set_presence(PeerMetadata::default());
        assert!(!session.pump().await);

        assert_eq!(*count.lock().unwrap(), after_first);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_flushes_autosave() {
        let sink = MemorySnapshotSink::new();
        let config = SessionConfig::default()
            .with_endpoint(dead_endpoint().await)
            .with_reconnect(quick_policy(50))
            .with_autosave(Some(Duration::from_secs(3600)));
        let mut session = SessionManager::open(config, "saved-doc", SessionCallbacks::new()).unwrap();
        session.set_snapshot_sink(sink.clone());

        session.apply_local_edit(TextEdit::insert(0, "persist me"));
        session.close().await;

        assert_eq!(sink.latest("saved-doc").as_deref(), Some("persist me"));
    }

    #[tokio::test]
    async fn test_clean_session_does_not_autosave() {
        let sink = MemorySnapshotSink::new();
        let config = SessionConfig::default()
            .with_endpoint(dead_endpoint().await)
            .with_reconnect(quick_policy(50));
        let mut session = SessionManager::open(config, "doc", SessionCallbacks::new()).unwrap();
        session.set_snapshot_sink(sink.clone());
        session.close().await;
        assert!(sink.snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_zero_timer_periods_do_not_panic() {
        let sink = MemorySnapshotSink::new();
        let mut config = SessionConfig::default()
            .with_endpoint(dead_endpoint().await)
            .with_reconnect(quick_policy(50));
        config.heartbeat_interval = Duration::ZERO;
        config.autosave_interval = Some(Duration::ZERO);

        let mut session = SessionManager::open(config, "doc", SessionCallbacks::new()).unwrap();
        session.set_snapshot_sink(sink.clone());
        session.apply_local_edit(TextEdit::insert(0, "tick"));
        for _ in 0..5 {
            assert!(session.pump().await);
        }
        session.close().await;
        assert_eq!(sink.latest("doc").as_deref(), Some("tick"));
    }

    #[tokio::test]
    async fn test_unnamed_peer_gets_generated_name() {
        let config = SessionConfig::default().with_endpoint(dead_endpoint().await);
        let mut session = SessionManager::open(config, "doc", SessionCallbacks::new()).unwrap();

        let local = session.peers().remove(0);
        assert!(local.display_name.starts_with("User "), "{}", local.display_name);
        assert_eq!(
            local.display_color,
            PeerMetadata::for_peer(session.peer_id(), "x").display_color
        );
        session.close().await;
    }

    #[tokio::test]
    async fn test_local_peer_listed() {
        let config = SessionConfig::default()
            .with_endpoint(dead_endpoint().await)
            .with_local_peer(PeerMetadata::new("User 3", "#123456"));
        let mut session = SessionManager::open(config, "doc", SessionCallbacks::new()).unwrap();

        let peers = session.peers();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].is_local);
        assert_eq!(peers[0].display_name, "User 3");
        assert_eq!(peers[0].peer_id, session.peer_id());
        session.close().await;
    }
}

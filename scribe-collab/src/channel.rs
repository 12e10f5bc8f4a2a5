//! One realtime connection to the room of one document.
//!
//! A `SyncChannel` owns a background task that holds the WebSocket and the
//! reconnect loop. The owner talks to it through two queues:
//!
//! ```text
//!   owner ── Command::{Send, DropConnection, Close} ──▶ task ──▶ WebSocket
//!   owner ◀── ChannelEvent::{Connected, Message, ...} ── task ◀── WebSocket
//! ```
//!
//! Sending never blocks. Updates sent while the transport is down are held
//! in an [`OfflineQueue`] and flushed after the next successful connect.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::backoff::{Backoff, ReconnectPolicy};
use crate::error::SyncError;
use crate::protocol::{MessageType, SyncMessage};

/// Updates held while offline before new ones are refused.
pub const DEFAULT_OFFLINE_CAPACITY: usize = 10_000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Progress reported by the channel task.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Transport is up. `resumed` is false only for the first connection.
    Connected { resumed: bool },
    /// A frame from the room, in transport order.
    Message(SyncMessage),
    /// An established transport dropped; reconnecting.
    Disconnected(SyncError),
    /// Waiting `delay` before reconnect attempt `attempt`.
    Retrying {
        attempt: u32,
        delay: Duration,
        cause: SyncError,
    },
    /// Terminal. The task has released the transport and exited.
    Failed(SyncError),
}

enum Command {
    Send(SyncMessage),
    DropConnection,
    Close,
}

// ───────────────────────── Offline queue ─────────────────────────

/// Updates produced while disconnected, replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<SyncMessage>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a queue holding at most `max_size` messages.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a message for later replay. Returns false when full.
    pub fn enqueue(&mut self, msg: SyncMessage) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(msg);
        true
    }

    /// Put messages that were not delivered back ahead of anything queued
    /// since.
    fn restore(&mut self, mut pending: VecDeque<SyncMessage>) {
        pending.append(&mut self.queue);
        self.queue = pending;
    }

    /// Take every queued message, oldest first.
    pub fn drain(&mut self) -> Vec<SyncMessage> {
        self.queue.drain(..).collect()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Discard everything queued.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total payload bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|m| m.payload.len()).sum()
    }
}

// ───────────────────────── Channel handle ─────────────────────────

/// Handle to the connection task for one room.
pub struct SyncChannel {
    url: String,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    task: Option<JoinHandle<()>>,
}

impl SyncChannel {
    /// Start connecting to `{endpoint}/{document_id}`.
    ///
    /// Returns immediately; connection progress arrives through
    /// [`next_event`](Self::next_event). Must be called inside a tokio
    /// runtime.
    pub fn open(endpoint: &str, document_id: &str, policy: ReconnectPolicy) -> Self {
        let url = room_url(endpoint, document_id);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task = ChannelTask {
            url: url.clone(),
            commands: command_rx,
            events: event_tx,
            backoff: Backoff::new(policy),
            offline: OfflineQueue::new(DEFAULT_OFFLINE_CAPACITY),
            connected_before: false,
        };
        let handle = tokio::spawn(task.run());

        Self {
            url,
            commands: command_tx,
            events: event_rx,
            task: Some(handle),
        }
    }

    /// Full room URL, `{endpoint}/{document_id}`.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queue a message for the room. Never blocks.
    pub fn send(&self, msg: SyncMessage) {
        if self.commands.send(Command::Send(msg)).is_err() {
            log::debug!("Dropping outgoing message for {}: channel task has exited", self.url);
        }
    }

    /// Drop the live transport and let the reconnect policy take over.
    pub fn drop_connection(&self) {
        let _ = self.commands.send(Command::DropConnection);
    }

    /// Next event from the task, or `None` once it has exited and every
    /// event has been delivered.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Stop the task, cancelling any pending reconnect timer, and wait for
    /// it to release the transport. Idempotent.
    pub async fn close(&mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Channel task for {} ended abnormally: {e}", self.url);
            }
        }
        self.events.close();
    }

    /// Whether `close` has run or the connection task has exited.
    pub fn is_closed(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn room_url(endpoint: &str, document_id: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), document_id)
}

// ───────────────────────── Connection task ─────────────────────────

enum Exit {
    Closed,
    Dropped(SyncError),
}

struct ChannelTask {
    url: String,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    backoff: Backoff,
    offline: OfflineQueue,
    connected_before: bool,
}

impl ChannelTask {
    async fn run(mut self) {
        loop {
            let cause = match self.connect().await {
                Err(Exit::Closed) => return,
                Err(Exit::Dropped(err)) if err.is_fatal() => {
                    log::warn!("Room {} rejected: {err}", self.url);
                    self.emit(ChannelEvent::Failed(err));
                    return;
                }
                Err(Exit::Dropped(err)) => {
                    log::debug!("Connect to {} failed: {err}", self.url);
                    err
                }
                Ok(ws) => {
                    self.backoff.reset();
                    let resumed = self.connected_before;
                    self.connected_before = true;
                    log::info!("Connected to {} (resumed: {resumed})", self.url);
                    if !self.emit(ChannelEvent::Connected { resumed }) {
                        return;
                    }
                    match self.serve(ws).await {
                        Exit::Closed => return,
                        Exit::Dropped(err) => {
                            log::info!("Connection to {} lost: {err}", self.url);
                            if !self.emit(ChannelEvent::Disconnected(err.clone())) {
                                return;
                            }
                            err
                        }
                    }
                }
            };

            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempt();
                log::warn!("Giving up on {} after {attempts} attempts", self.url);
                self.emit(ChannelEvent::Failed(SyncError::RetryBudgetExhausted { attempts }));
                return;
            };
            let attempt = self.backoff.attempt();
            log::debug!("Reconnecting to {} in {delay:?} (attempt {attempt})", self.url);
            if !self.emit(ChannelEvent::Retrying { attempt, delay, cause }) {
                return;
            }
            if !self.wait(delay).await {
                return;
            }
        }
    }

    /// Attempt one connection while still honoring commands.
    async fn connect(&mut self) -> Result<WsStream, Exit> {
        let connecting = tokio_tungstenite::connect_async(self.url.clone());
        tokio::pin!(connecting);
        loop {
            tokio::select! {
                result = &mut connecting => {
                    return result
                        .map(|(ws, _)| ws)
                        .map_err(|e| Exit::Dropped(SyncError::from_transport(&e)));
                }
                cmd = self.commands.recv() => {
                    if !self.offline_command(cmd) {
                        return Err(Exit::Closed);
                    }
                }
            }
        }
    }

    /// Sleep out a backoff delay. Returns false if closed meanwhile; close
    /// cancels the timer.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => {
                    if !self.offline_command(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    /// Handle a command while no transport is up. Returns false on close.
    fn offline_command(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            None | Some(Command::Close) => false,
            Some(Command::Send(msg)) => {
                self.hold(msg);
                true
            }
            Some(Command::DropConnection) => true,
        }
    }

    /// Keep an update for replay. Handshake and awareness frames are
    /// regenerated on reconnect, so they are not held.
    fn hold(&mut self, msg: SyncMessage) {
        if msg.msg_type != MessageType::Update {
            log::trace!("Dropping {:?} while offline", msg.msg_type);
            return;
        }
        if !self.offline.enqueue(msg) {
            log::warn!(
                "Offline queue for {} full ({} updates); later edits sync via handshake",
                self.url,
                self.offline.len()
            );
        }
    }

    /// Pump one established connection until it drops or the owner closes.
    async fn serve(&mut self, ws: WsStream) -> Exit {
        let (mut sink, mut stream) = ws.split();

        let mut pending: VecDeque<SyncMessage> = self.offline.queue.drain(..).collect();
        if !pending.is_empty() {
            log::info!("Replaying {} queued updates to {}", pending.len(), self.url);
        }
        while let Some(msg) = pending.pop_front() {
            if let Err(err) = write(&mut sink, &msg).await {
                pending.push_front(msg);
                self.offline.restore(pending);
                return Exit::Dropped(err);
            }
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Close) => {
                        let _ = sink.close().await;
                        return Exit::Closed;
                    }
                    Some(Command::Send(msg)) => {
                        if let Err(err) = write(&mut sink, &msg).await {
                            self.hold(msg);
                            return Exit::Dropped(err);
                        }
                    }
                    Some(Command::DropConnection) => {
                        return Exit::Dropped(SyncError::TransientNetwork(
                            "connection dropped locally".into(),
                        ));
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                        Ok(msg) => {
                            if !self.emit(ChannelEvent::Message(msg)) {
                                return Exit::Closed;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from {}: {e}", self.url),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Exit::Dropped(SyncError::TransientNetwork(
                            "connection closed by peer".into(),
                        ));
                    }
                    Some(Err(e)) => return Exit::Dropped(SyncError::from_transport(&e)),
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    /// Deliver an event. Returns false if the owner is gone.
    fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

async fn write<S>(sink: &mut S, msg: &SyncMessage) -> Result<(), SyncError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| SyncError::from_transport(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerMetadata;
    use uuid::Uuid;

    fn update(payload: Vec<u8>) -> SyncMessage {
        SyncMessage {
            msg_type: MessageType::Update,
            peer_id: Uuid::new_v4(),
            clock: 0,
            payload,
        }
    }

    #[test]
    fn test_room_url() {
        assert_eq!(room_url("ws://localhost:1234", "doc-42"), "ws://localhost:1234/doc-42");
        assert_eq!(room_url("ws://localhost:1234/", "doc-42"), "ws://localhost:1234/doc-42");
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(update(vec![1, 2, 3]));
        queue.enqueue(update(vec![4, 5, 6, 7]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained[0].payload, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(update(vec![1])));
        assert!(queue.enqueue(update(vec![2])));
        assert!(!queue.enqueue(update(vec![3])));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_restore_keeps_order() {
        let mut queue = OfflineQueue::new(10);
        queue.enqueue(update(vec![3]));
        queue.restore(VecDeque::from(vec![update(vec![1]), update(vec![2])]));
        let order: Vec<u8> = queue.drain().iter().map(|m| m.payload[0]).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    fn unreachable_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
            max_retries: Some(2),
        }
    }

    /// Endpoint on a port nothing listens on.
    async fn dead_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("ws://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let mut channel = SyncChannel::open(&dead_endpoint().await, "doc", unreachable_policy());

        let mut retries = Vec::new();
        let failure = loop {
            match tokio::time::timeout(Duration::from_secs(5), channel.next_event())
                .await
                .unwrap()
            {
                Some(ChannelEvent::Retrying { attempt, .. }) => retries.push(attempt),
                Some(ChannelEvent::Failed(err)) => break err,
                other => panic!("unexpected event {other:?}"),
            }
        };

        assert_eq!(retries, vec![1, 2]);
        assert_eq!(failure, SyncError::RetryBudgetExhausted { attempts: 2 });
        assert!(channel.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_close_cancels_backoff() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(120),
            ..unreachable_policy()
        };
        let mut channel = SyncChannel::open(&dead_endpoint().await, "doc", policy);

        match tokio::time::timeout(Duration::from_secs(5), channel.next_event())
            .await
            .unwrap()
        {
            Some(ChannelEvent::Retrying { delay, .. }) => assert_eq!(delay, Duration::from_secs(60)),
            other => panic!("unexpected event {other:?}"),
        }

        // Offline sends are accepted without blocking.
        channel.send(SyncMessage::awareness(Uuid::new_v4(), 1, Some(&PeerMetadata::default())));

        tokio::time::timeout(Duration::from_secs(1), channel.close())
            .await
            .expect("close must not wait for the backoff timer");
        assert!(channel.is_closed());
        channel.close().await;
    }
}

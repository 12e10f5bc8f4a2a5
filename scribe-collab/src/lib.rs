//! # scribe-collab: Collaborative editing sessions for scribe documents
//!
//! Keeps a locally replicated text document consistent with remote peers
//! over a WebSocket room, tracks who else is present, and hands an
//! always-renderable content view to an editing surface.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   TextEdit    ┌──────────────────┐
//! │ EditingSurface │ ────────────► │  SessionManager  │ ── on_change / on_presence / on_state
//! └────────────────┘               └──┬─────┬──────┬──┘
//!                                     │     │      │
//!                          ┌──────────┘     │      └──────────┐
//!                          ▼                ▼                 ▼
//!                   ┌─────────────┐ ┌───────────────┐ ┌──────────────┐
//!                   │ReplicaStore │ │PresenceDirect.│ │ SyncChannel  │
//!                   │ (automerge) │ │  (awareness)  │ │ (ws + retry) │
//!                   └─────────────┘ └───────────────┘ └──────┬───────┘
//!                                                            │ ws://host/{document_id}
//!                                                            ▼
//!                                                    ┌──────────────┐
//!                                                    │ RelayServer  │
//!                                                    │ room replica │
//!                                                    │ + fan-out    │
//!                                                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`replica`]: CRDT text replica, operations, state vectors
//! - [`presence`]: Peer awareness with clock gating and expiry
//! - [`backoff`]: Reconnect policy with exponential backoff and jitter
//! - [`channel`]: One realtime connection per room, with offline queue
//! - [`session`]: Session state machine tying the above together
//! - [`surface`]: Editing surface and snapshot sink seams
//! - [`config`]: Session configuration
//! - [`broadcast`]: Room fan-out for the relay
//! - [`server`]: WebSocket room relay

pub mod backoff;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod session;
pub mod surface;

// Re-exports for convenience
pub use backoff::{Backoff, ReconnectPolicy};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use channel::{ChannelEvent, OfflineQueue, SyncChannel};
pub use config::SessionConfig;
pub use error::SyncError;
pub use presence::{
    AwarenessUpdate, CursorColor, PeerPresence, PresenceChange, PresenceDirectory,
};
pub use protocol::{MessageType, PeerMetadata, ProtocolError, SyncMessage};
pub use replica::{Operation, ReplicaError, ReplicaStore, StateVector, TextEdit};
pub use server::{RelayConfig, RelayError, RelayServer, RelayStats, RoomRejection};
pub use session::{SessionCallbacks, SessionManager, SessionState};
pub use surface::{
    EditingSurface, MemorySnapshotSink, PlainTextSurface, SnapshotError, SnapshotSink,
};

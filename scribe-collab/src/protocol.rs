//! Binary protocol for room synchronization.
//!
//! Wire format (bincode-encoded, one frame per WebSocket binary message):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Two logical channels share a room connection: `sync` (step 1, step 2,
//! update) carries document operations, `awareness` carries presence.

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::replica::{Operation, StateVector};

/// Message types for the room protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Heads of the sender's replica, asking for what it is missing
    SyncStep1 = 1,
    /// Operations the requester was missing
    SyncStep2 = 2,
    /// Incremental operations produced by an edit
    Update = 3,
    /// Presence metadata for one peer (`None` payload means the peer left)
    Awareness = 4,
}

impl MessageType {
    /// Whether this message belongs to the document `sync` channel.
    pub fn is_sync(self) -> bool {
        !matches!(self, Self::Awareness)
    }
}

/// Display metadata a peer publishes over the awareness channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerMetadata {
    pub display_name: String,
    /// CSS hex color, e.g. `#ffb61e`
    pub display_color: String,
}

impl PeerMetadata {
    /// Name shown for a peer that published no metadata.
    pub const DEFAULT_NAME: &'static str = "Anonymous";
    /// Color shown for a peer that published no metadata.
    pub const DEFAULT_COLOR: &'static str = "#ffb61e";

    pub fn new(display_name: impl Into<String>, display_color: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            display_color: display_color.into(),
        }
    }

    /// Placeholder name for a peer that did not pick one, `User 0` to `User 999`.
    pub fn generated_name() -> String {
        format!("User {}", rand::thread_rng().gen_range(0..1000))
    }

    /// Metadata with a color derived from the peer id, stable across sessions.
    pub fn for_peer(peer_id: Uuid, display_name: impl Into<String>) -> Self {
        Self::new(display_name, crate::presence::CursorColor::from_uuid(peer_id).to_hex())
    }
}

impl Default for PeerMetadata {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAME, Self::DEFAULT_COLOR)
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Awareness clock of `peer_id` (0 on the sync channel)
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a sync step 1 carrying the sender's state vector.
    pub fn sync_step1(peer_id: Uuid, state_vector: &StateVector) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            clock: 0,
            payload: encode_payload(state_vector),
        }
    }

    /// Create a sync step 2 answering a state vector with the missing operations.
    pub fn sync_step2(peer_id: Uuid, operations: &[Operation]) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            clock: 0,
            payload: encode_payload(&operation_batch(operations)),
        }
    }

    /// Create an incremental update message.
    pub fn update(peer_id: Uuid, operations: &[Operation]) -> Self {
        Self {
            msg_type: MessageType::Update,
            peer_id,
            clock: 0,
            payload: encode_payload(&operation_batch(operations)),
        }
    }

    /// Create an awareness message. `None` announces that the peer left.
    pub fn awareness(peer_id: Uuid, clock: u64, state: Option<&PeerMetadata>) -> Self {
        Self {
            msg_type: MessageType::Awareness,
            peer_id,
            clock,
            payload: encode_payload(&state),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a sync step 1 payload.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        self.expect_type(&[MessageType::SyncStep1])?;
        decode_payload(&self.payload)
    }

    /// Parse the raw operation batch of a step 2 or update message.
    ///
    /// Individual operations are still unverified bytes; the replica
    /// decodes them.
    pub fn operations(&self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        self.expect_type(&[MessageType::SyncStep2, MessageType::Update])?;
        decode_payload(&self.payload)
    }

    /// Parse an awareness payload.
    pub fn awareness_state(&self) -> Result<Option<PeerMetadata>, ProtocolError> {
        self.expect_type(&[MessageType::Awareness])?;
        decode_payload(&self.payload)
    }

    fn expect_type(&self, allowed: &[MessageType]) -> Result<(), ProtocolError> {
        if allowed.contains(&self.msg_type) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessageType(self.msg_type))
        }
    }
}

fn operation_batch(operations: &[Operation]) -> Vec<&[u8]> {
    operations.iter().map(Operation::as_bytes).collect()
}

/// Payloads are plain data; an encoding failure leaves the payload empty,
/// which every receiver rejects on decode.
fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    match bincode::serde::encode_to_vec(value, bincode::config::standard()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("Failed to encode {} payload: {e}", std::any::type_name::<T>());
            Vec::new()
        }
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{ReplicaStore, TextEdit};

    #[test]
    fn test_update_roundtrip_preserves_operations() {
        let mut replica = ReplicaStore::new().unwrap();
        let ops = replica.apply_local(TextEdit::insert(0, "hello"));
        let peer = Uuid::new_v4();

        let msg = SyncMessage::update(peer, &ops);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.peer_id, peer);
        let batch = decoded.operations().unwrap();
        assert_eq!(batch.len(), ops.len());
        assert_eq!(batch[0], ops[0].as_bytes());
    }

    #[test]
    fn test_sync_step1_carries_state_vector() {
        let mut replica = ReplicaStore::new().unwrap();
        replica.apply_local(TextEdit::insert(0, "abc"));
        let sv = replica.state_vector();

        let msg = SyncMessage::sync_step1(Uuid::new_v4(), &sv);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.state_vector().unwrap(), sv);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let peer = Uuid::new_v4();
        let meta = PeerMetadata::new("User 7", "#112233");

        let msg = SyncMessage::awareness(peer, 9, Some(&meta));
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.clock, 9);
        assert_eq!(decoded.awareness_state().unwrap(), Some(meta));
    }

    #[test]
    fn test_awareness_leave_has_no_state() {
        let msg = SyncMessage::awareness(Uuid::new_v4(), 3, None);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_state().unwrap(), None);
    }

    #[test]
    fn test_payload_accessors_check_type() {
        let msg = SyncMessage::awareness(Uuid::new_v4(), 1, None);
        assert_eq!(
            msg.operations(),
            Err(ProtocolError::InvalidMessageType(MessageType::Awareness))
        );
        assert!(msg.state_vector().is_err());

        let update = SyncMessage::update(Uuid::new_v4(), &[]);
        assert!(update.awareness_state().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_corrupt_awareness_payload_is_error() {
        let mut msg = SyncMessage::awareness(Uuid::new_v4(), 1, Some(&PeerMetadata::default()));
        msg.payload.truncate(3);
        assert!(matches!(
            msg.awareness_state(),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        let peer = Uuid::new_v4();
        for msg_type in [
            MessageType::SyncStep1,
            MessageType::SyncStep2,
            MessageType::Update,
            MessageType::Awareness,
        ] {
            let msg = SyncMessage {
                msg_type,
                peer_id: peer,
                clock: 0,
                payload: Vec::new(),
            };
            let rejected = match msg_type {
                MessageType::SyncStep1 => msg.state_vector().is_err(),
                MessageType::Awareness => msg.awareness_state().is_err(),
                _ => msg.operations().is_err(),
            };
            assert!(rejected, "{msg_type:?} accepted an empty payload");
        }
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::SyncStep2 as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Awareness as u8, 4);
        assert!(MessageType::Update.is_sync());
        assert!(!MessageType::Awareness.is_sync());
    }

    #[test]
    fn test_default_metadata() {
        let meta = PeerMetadata::default();
        assert_eq!(meta.display_name, "Anonymous");
        assert_eq!(meta.display_color, "#ffb61e");
    }

    #[test]
    fn test_generated_name() {
        for _ in 0..50 {
            let name = PeerMetadata::generated_name();
            let n: u32 = name.strip_prefix("User ").unwrap().parse().unwrap();
            assert!(n < 1000);
        }
    }

    #[test]
    fn test_peer_color_is_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = PeerMetadata::for_peer(id, "A");
        let b = PeerMetadata::for_peer(id, "B");
        assert_eq!(a.display_color, b.display_color);
        assert!(a.display_color.starts_with('#'));
        assert_eq!(a.display_color.len(), 7);
    }
}

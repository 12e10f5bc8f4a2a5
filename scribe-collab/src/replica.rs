//! Replicated text document backed by an automerge CRDT.
//!
//! Every replica starts from the same genesis change (fixed actor, fixed
//! timestamp) that creates the `content` text object. Because that change
//! hashes identically everywhere, independently created replicas share one
//! text object and merge into a single sequence instead of shadowing each
//! other's root key.
//!
//! ```text
//!  local edit ──▶ apply_local ──▶ Operation(s) ──▶ wire
//!  wire ──▶ Operation::decode ──▶ apply_remote ──▶ snapshot()
//! ```

use automerge::transaction::{CommitOptions, Transactable};
use automerge::{
    ActorId, AutoCommit, AutomergeError, Change, ChangeHash, ObjId, ObjType, ReadDoc,
    TextEncoding, ROOT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Root key of the shared text object.
pub const CONTENT_KEY: &str = "content";

/// Actor that authors the genesis change on every replica.
const GENESIS_ACTOR: [u8; 16] = *b"scribe::genesis\0";

// ───────────────────────── Errors ─────────────────────────

/// Errors raised while creating a replica or merging remote state.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// Bytes on the wire did not decode to a valid operation.
    #[error("malformed operation: {0}")]
    Malformed(String),
    /// The CRDT engine refused a well-formed operation.
    #[error("operation rejected: {0}")]
    Rejected(#[from] AutomergeError),
    /// A full replica export could not be merged.
    #[error("import failed: {0}")]
    Import(String),
}

// ───────────────────────── Operation ─────────────────────────

/// An immutable, causally ordered unit of change.
///
/// Tagged with the replica that produced it and that replica's sequence
/// number; identified by a content hash, so re-applying it is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    change: Change,
}

impl Operation {
    /// Decode an operation received from the network.
    pub fn decode(bytes: Vec<u8>) -> Result<Self, ReplicaError> {
        Change::from_bytes(bytes)
            .map(|change| Self { change })
            .map_err(|e| ReplicaError::Malformed(e.to_string()))
    }

    /// Encoded form, as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        self.change.raw_bytes()
    }

    /// Replica that produced this operation.
    pub fn origin(&self) -> &ActorId {
        self.change.actor_id()
    }

    /// Per-origin logical clock.
    pub fn seq(&self) -> u64 {
        self.change.seq()
    }

    /// Content hash identifying this operation in every replica.
    pub fn id(&self) -> ChangeHash {
        self.change.hash()
    }

    /// Operations that must be applied before this one.
    pub fn dependencies(&self) -> &[ChangeHash] {
        self.change.deps()
    }
}

impl From<Change> for Operation {
    fn from(change: Change) -> Self {
        Self { change }
    }
}

// ───────────────────────── State vector ─────────────────────────

/// Compact summary of what a replica has seen: its current heads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(Vec<[u8; 32]>);

impl StateVector {
    pub fn from_heads(heads: &[ChangeHash]) -> Self {
        let mut hashes: Vec<[u8; 32]> = heads.iter().map(|h| h.0).collect();
        hashes.sort_unstable();
        Self(hashes)
    }

    /// Change hashes the vector holds.
    pub fn heads(&self) -> Vec<ChangeHash> {
        self.0.iter().map(|h| ChangeHash(*h)).collect()
    }

    /// Number of heads.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ───────────────────────── Text edits ─────────────────────────

/// A delta reported by the editing surface.
///
/// Positions and lengths count Unicode scalar values. Out-of-range values
/// are clamped when applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextEdit {
    pub position: usize,
    pub delete: usize,
    pub insert: String,
}

impl TextEdit {
    /// Insert `text` before `position`.
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self {
            position,
            delete: 0,
            insert: text.into(),
        }
    }

    /// Delete `len` characters starting at `position`.
    pub fn delete(position: usize, len: usize) -> Self {
        Self {
            position,
            delete: len,
            insert: String::new(),
        }
    }

    /// Replace `len` characters at `position` with `text`.
    pub fn replace(position: usize, len: usize, text: impl Into<String>) -> Self {
        Self {
            position,
            delete: len,
            insert: text.into(),
        }
    }

    /// Minimal single-span edit turning `old` into `new`, if they differ.
    ///
    /// Surfaces that only report their full content use this to produce
    /// deltas.
    pub fn between(old: &str, new: &str) -> Option<Self> {
        if old == new {
            return None;
        }
        let old_chars: Vec<char> = old.chars().collect();
        let new_chars: Vec<char> = new.chars().collect();

        let prefix = old_chars
            .iter()
            .zip(&new_chars)
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
        let suffix = old_chars
            .iter()
            .rev()
            .zip(new_chars.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        Some(Self {
            position: prefix,
            delete: old_chars.len() - prefix - suffix,
            insert: new_chars[prefix..new_chars.len() - suffix].iter().collect(),
        })
    }

    pub fn is_noop(&self) -> bool {
        self.delete == 0 && self.insert.is_empty()
    }
}

// ───────────────────────── Replica store ─────────────────────────

/// One replica of a collaboratively edited text document.
pub struct ReplicaStore {
    doc: AutoCommit,
    content: ObjId,
}

impl ReplicaStore {
    /// Create a replica with a fresh random identifier.
    pub fn new() -> Result<Self, ReplicaError> {
        Self::with_replica_id(ActorId::random())
    }

    /// Create a replica whose operations are tagged with `replica_id`.
    pub fn with_replica_id(replica_id: impl Into<ActorId>) -> Result<Self, ReplicaError> {
        let mut doc = AutoCommit::new_with_encoding(TextEncoding::UnicodeCodePoint)
            .with_actor(ActorId::from(GENESIS_ACTOR));
        let content = doc.put_object(ROOT, CONTENT_KEY, ObjType::Text)?;
        doc.commit_with(CommitOptions::default().with_time(0));
        doc.set_actor(replica_id.into());
        Ok(Self { doc, content })
    }

    /// Actor id stamped on operations this replica produces.
    pub fn replica_id(&self) -> &ActorId {
        self.doc.get_actor()
    }

    /// Apply an edit made on this replica and return the operations to
    /// broadcast. Never fails; an edit that changes nothing yields nothing.
    pub fn apply_local(&mut self, edit: TextEdit) -> Vec<Operation> {
        let len = self.len();
        let position = edit.position.min(len);
        let delete = edit.delete.min(len - position);
        if delete == 0 && edit.insert.is_empty() {
            return Vec::new();
        }

        if let Err(e) = self
            .doc
            .splice_text(&self.content, position, delete as isize, &edit.insert)
        {
            log::error!("Local splice at {position} (delete {delete}) failed: {e}");
            self.doc.rollback();
            return Vec::new();
        }

        let Some(hash) = self.doc.commit() else {
            return Vec::new();
        };
        self.doc
            .get_change_by_hash(&hash)
            .cloned()
            .map(Operation::from)
            .into_iter()
            .collect()
    }

    /// Merge one remote operation. Returns whether the rendered content
    /// changed.
    ///
    /// Duplicates are ignored. Operations whose dependencies have not
    /// arrived yet are held and applied once they do.
    pub fn apply_remote(&mut self, operation: &Operation) -> Result<bool, ReplicaError> {
        self.apply_changes(vec![operation.change.clone()])
    }

    /// Decode and merge a batch of wire operations.
    ///
    /// Every operation is decoded before any is applied; one malformed
    /// entry rejects the whole batch and leaves the replica untouched.
    pub fn apply_remote_batch(&mut self, batch: Vec<Vec<u8>>) -> Result<bool, ReplicaError> {
        let changes = batch
            .into_iter()
            .map(|bytes| Operation::decode(bytes).map(|op| op.change))
            .collect::<Result<Vec<_>, _>>()?;
        if changes.is_empty() {
            return Ok(false);
        }
        self.apply_changes(changes)
    }

    fn apply_changes(&mut self, changes: Vec<Change>) -> Result<bool, ReplicaError> {
        let before = self.snapshot();
        self.doc.apply_changes(changes)?;
        Ok(self.snapshot() != before)
    }

    /// Current rendered content.
    pub fn snapshot(&self) -> String {
        self.doc.text(&self.content).unwrap_or_default()
    }

    /// Length of the content in Unicode scalar values.
    pub fn len(&self) -> usize {
        self.doc.length(&self.content)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Heads of the document, for the sync handshake.
    pub fn state_vector(&mut self) -> StateVector {
        StateVector::from_heads(&self.doc.get_heads())
    }

    /// Operations a peer with `state_vector` has not seen.
    ///
    /// Heads unknown to this replica are ignored, so the result may
    /// include operations the peer already has; re-application is a no-op.
    pub fn missing_since(&mut self, state_vector: &StateVector) -> Vec<Operation> {
        self.doc
            .get_changes(&state_vector.heads())
            .into_iter()
            .cloned()
            .map(Operation::from)
            .collect()
    }

    /// Dependencies of held operations that have not arrived yet.
    pub fn missing_dependencies(&mut self) -> Vec<ChangeHash> {
        self.doc.get_missing_deps(&[])
    }

    /// Full replica state, for late joiners and snapshots.
    pub fn export(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Merge a full export into this replica. Local operations not present
    /// in the export are kept.
    pub fn import(&mut self, bytes: &[u8]) -> Result<bool, ReplicaError> {
        let mut incoming =
            AutoCommit::load(bytes).map_err(|e| ReplicaError::Import(e.to_string()))?;
        let before = self.snapshot();
        self.doc.merge(&mut incoming)?;
        Ok(self.snapshot() != before)
    }
}

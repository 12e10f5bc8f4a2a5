//! Seams to the outside world: the editing surface that displays content and
//! the document store that receives periodic snapshots.

use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::replica::TextEdit;

/// A text editor widget bound to a session.
///
/// The session calls `render_content` when remote changes arrive; the
/// surface reports its own edits to the session as [`TextEdit`]s.
pub trait EditingSurface {
    /// Replace the displayed content.
    fn render_content(&mut self, content: &str);

    /// Content as currently displayed.
    fn plain_text(&self) -> String;
}

/// Minimal in-memory surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlainTextSurface {
    text: String,
}

impl PlainTextSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole text as a user would, returning the edit to forward.
    pub fn type_text(&mut self, new_text: &str) -> Option<TextEdit> {
        let edit = TextEdit::between(&self.text, new_text);
        self.text = new_text.to_string();
        edit
    }
}

impl EditingSurface for PlainTextSurface {
    fn render_content(&mut self, content: &str) {
        self.text.clear();
        self.text.push_str(content);
    }

    fn plain_text(&self) -> String {
        self.text.clone()
    }
}

/// Errors a [`SnapshotSink`] may report.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

/// Receiver of periodic content snapshots (autosave).
pub trait SnapshotSink: Send {
    fn store_snapshot(&mut self, document_id: &str, content: &str) -> Result<(), SnapshotError>;
}

/// Sink that records snapshots in memory. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotSink {
    snapshots: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemorySnapshotSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored `(document_id, content)` pair, oldest first.
    pub fn snapshots(&self) -> Vec<(String, String)> {
        self.snapshots
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Most recent snapshot stored for `document_id`.
    pub fn latest(&self, document_id: &str) -> Option<String> {
        self.snapshots()
            .into_iter()
            .rev()
            .find(|(id, _)| id == document_id)
            .map(|(_, content)| content)
    }
}

impl SnapshotSink for MemorySnapshotSink {
    fn store_snapshot(&mut self, document_id: &str, content: &str) -> Result<(), SnapshotError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|e| SnapshotError::Unavailable(e.to_string()))?;
        snapshots.push((document_id.to_string(), content.to_string()));
        Ok(())
    }
}

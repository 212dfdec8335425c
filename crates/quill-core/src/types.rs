//! Core types for Quill sessions
//!
//! Defines the data model shared by every coordinator:
//! - Revisions, request and task identifiers
//! - The persisted `Document` and in-memory `ContentSnapshot`
//! - Save, AI assist and upload lifecycles

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Monotonic tag of an accepted content mutation.
pub type Revision = u64;

/// Unique AI request identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Ulid);

impl RequestId {
    /// Generate new request ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique upload task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Ulid);

impl TaskId {
    /// Generate new task ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A document as known to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub revision: Revision,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create an empty document at revision 0
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        author_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            content: String::new(),
            revision: 0,
            author_id: author_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// With initial content
    #[inline]
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// With persisted revision
    #[inline]
    #[must_use]
    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = revision;
        self
    }
}

/// Immutable copy of the buffer at one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentSnapshot {
    pub content: String,
    pub revision: Revision,
}

/// Persistence state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveState {
    /// Buffer matches the last successful save
    #[default]
    Clean,
    /// Unsaved edits, waiting for the debounce window or an explicit save
    Dirty,
    /// A save is in flight
    Saving,
    /// A save failed and a backoff retry is scheduled
    Retrying,
    /// Automatic retry gave up; waiting for an explicit retry
    Error,
}

impl SaveState {
    /// Whether a save is in flight or scheduled for retry
    #[inline]
    #[must_use]
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Saving | Self::Retrying)
    }
}

impl std::fmt::Display for SaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::Saving => "saving",
            Self::Retrying => "retrying",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Kind of text transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistKind {
    Improve,
    Summarize,
    Expand,
    Custom,
}

impl std::fmt::Display for AssistKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Improve => "improve",
            Self::Summarize => "summarize",
            Self::Expand => "expand",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// How an applied AI result lands in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Replace the whole buffer
    #[default]
    Replace,
    /// Append at the end of the buffer
    Append,
    /// Insert at a character offset
    InsertAt(usize),
}

/// A request to transform text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistIntent {
    pub kind: AssistKind,
    pub input: String,
    /// Caller instruction, only used by `AssistKind::Custom`
    pub instruction: Option<String>,
    /// Only honoured for `AssistKind::Custom`; other kinds always replace
    pub merge: MergeStrategy,
}

impl AssistIntent {
    fn builtin(kind: AssistKind, input: impl Into<String>) -> Self {
        Self {
            kind,
            input: input.into(),
            instruction: None,
            merge: MergeStrategy::Replace,
        }
    }

    /// Improve the given text
    #[must_use]
    pub fn improve(input: impl Into<String>) -> Self {
        Self::builtin(AssistKind::Improve, input)
    }

    /// Summarize the given text
    #[must_use]
    pub fn summarize(input: impl Into<String>) -> Self {
        Self::builtin(AssistKind::Summarize, input)
    }

    /// Expand the given text
    #[must_use]
    pub fn expand(input: impl Into<String>) -> Self {
        Self::builtin(AssistKind::Expand, input)
    }

    /// Free-form instruction applied to the given text
    #[must_use]
    pub fn custom(instruction: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            kind: AssistKind::Custom,
            input: input.into(),
            instruction: Some(instruction.into()),
            merge: MergeStrategy::Replace,
        }
    }

    /// With merge strategy
    #[inline]
    #[must_use]
    pub fn with_merge(mut self, merge: MergeStrategy) -> Self {
        self.merge = merge;
        self
    }

    /// Effective merge strategy for this intent
    #[inline]
    #[must_use]
    pub fn effective_merge(&self) -> MergeStrategy {
        match self.kind {
            AssistKind::Custom => self.merge,
            _ => MergeStrategy::Replace,
        }
    }
}

/// AI request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistStatus {
    Pending,
    Applied,
    Discarded,
    Failed,
    Cancelled,
}

impl AssistStatus {
    /// Whether the request has reached a final state
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Bookkeeping record for one AI request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssistRequest {
    pub id: RequestId,
    pub kind: AssistKind,
    pub source_revision: Revision,
    pub status: AssistStatus,
    pub result_text: Option<String>,
    pub merge: MergeStrategy,
    pub dispatched_at: DateTime<Utc>,
}

/// Upload task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Validating,
    Uploading,
    Inserting,
    Done,
    Rejected,
}

impl UploadStatus {
    /// Whether the task has reached a final state
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Rejected)
    }
}

/// Reference to an uploaded asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub url: String,
    pub key: String,
    pub name: String,
    pub size: u64,
}

/// A file offered for upload.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
    /// Character offset of the cursor at submit time; `None` means document end
    pub anchor: Option<usize>,
}

impl FileDescriptor {
    /// Create a file descriptor inserted at document end
    #[must_use]
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
            anchor: None,
        }
    }

    /// With cursor anchor
    #[inline]
    #[must_use]
    pub fn with_anchor(mut self, anchor: usize) -> Self {
        self.anchor = Some(anchor);
        self
    }

    /// Size in bytes
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Bookkeeping record for one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadTask {
    pub id: TaskId,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    pub anchor: Option<usize>,
    pub submitted_revision: Revision,
    pub status: UploadStatus,
    pub result_ref: Option<AssetRef>,
    pub failure: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_intents_always_replace() {
        let intent = AssistIntent::improve("text").with_merge(MergeStrategy::Append);
        assert_eq!(intent.effective_merge(), MergeStrategy::Replace);

        let custom = AssistIntent::custom("translate", "text").with_merge(MergeStrategy::Append);
        assert_eq!(custom.effective_merge(), MergeStrategy::Append);
    }

    #[test]
    fn save_state_busy() {
        assert!(SaveState::Saving.is_busy());
        assert!(SaveState::Retrying.is_busy());
        assert!(!SaveState::Error.is_busy());
        assert!(!SaveState::Dirty.is_busy());
    }

    #[test]
    fn document_serializes_camel_case() {
        let doc = Document::new("doc-1", "Notes", "author-1").with_revision(3);
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["authorId"], "author-1");
        assert_eq!(json["revision"], 3);
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
        assert_ne!(TaskId::new(), TaskId::new());
    }
}

//! Error types for Quill sessions
//!
//! Provides the failure taxonomy shared by every coordinator:
//! - Validation failures rejected before any network call
//! - Persistence failures (transient, conflict, fatal)
//! - AI assist and upload collaborator failures
//! - Configuration contract violations

use crate::types::{AssistKind, RequestId, Revision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of every surfaced failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before any network call; never retried
    Validation,
    /// Network-level failure or timeout
    TransientNetwork,
    /// Persistence rejected the base revision
    Conflict,
    /// Persistence refused the save permanently
    FatalPersist,
}

/// Which coordinator produced a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOrigin {
    Save,
    Assist,
    Upload,
}

/// A failure surfaced to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionFault {
    pub kind: ErrorKind,
    pub origin: FaultOrigin,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl SessionFault {
    /// Create new fault stamped with the current time
    #[must_use]
    pub fn new(kind: ErrorKind, origin: FaultOrigin, message: impl Into<String>) -> Self {
        Self {
            kind,
            origin,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Upload validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// File has no content
    #[error("file is empty: {0}")]
    EmptyFile(String),

    /// MIME type outside the allow-list
    #[error("unsupported mime type: {0}")]
    UnsupportedMimeType(String),

    /// File exceeds the configured maximum
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
}

/// Persistence collaborator failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistError {
    /// Network-level failure
    #[error("transient persistence failure: {0}")]
    Transient(String),

    /// Base revision mismatch
    #[error("revision conflict: remote is at {remote_revision}")]
    Conflict { remote_revision: Revision },

    /// Non-retryable failure
    #[error("fatal persistence failure: {0}")]
    Fatal(String),

    /// Operation exceeded its upper bound
    #[error("persistence timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Document does not exist
    #[error("document not found: {0}")]
    NotFound(String),
}

impl PersistError {
    /// Error classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) | Self::Timeout { .. } => ErrorKind::TransientNetwork,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Fatal(_) | Self::NotFound(_) => ErrorKind::FatalPersist,
        }
    }

    /// Check if the save should be retried with backoff
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientNetwork)
    }
}

/// AI collaborator failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssistError {
    /// Network-level failure
    #[error("assist request failed: {0}")]
    Transient(String),

    /// Model refused or errored
    #[error("model error: {0}")]
    Model(String),

    /// Model produced no text
    #[error("model returned an empty result")]
    EmptyResult,

    /// Operation exceeded its upper bound
    #[error("assist request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl AssistError {
    /// Error classification
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TransientNetwork
    }
}

/// Upload collaborator failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    /// Transport failure
    #[error("upload transport failed: {0}")]
    Transport(String),

    /// Collaborator answered with an unusable reference
    #[error("invalid upload response: {0}")]
    InvalidResponse(String),

    /// Operation exceeded its upper bound
    #[error("upload timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Session closed before the upload finished
    #[error("upload cancelled")]
    Cancelled,
}

impl UploadError {
    /// Error classification
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TransientNetwork
    }
}

/// Configuration contract violations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Field value out of range
    #[error("invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// TOML could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// File could not be read
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors returned by `SessionController` entry points
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Upload rejected before any network call
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Document could not be loaded
    #[error("failed to load document: {0}")]
    Load(#[source] PersistError),

    /// Feature switched off in configuration
    #[error("{0} is disabled for this session")]
    FeatureDisabled(&'static str),

    /// A request of the same kind is pending under the reject-new policy
    #[error("{kind} request {request} is still pending")]
    AssistInFlight { kind: AssistKind, request: RequestId },

    /// Session was closed
    #[error("session is closed")]
    Closed,
}

impl SessionError {
    /// Error classification, if the error maps onto the failure taxonomy
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Validation(_) => Some(ErrorKind::Validation),
            Self::Load(e) => Some(e.kind()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_error_classification() {
        assert!(PersistError::Transient("reset".into()).is_retryable());
        assert!(PersistError::Timeout { timeout_ms: 30_000 }.is_retryable());
        assert!(!PersistError::Conflict { remote_revision: 4 }.is_retryable());
        assert!(!PersistError::Fatal("quota".into()).is_retryable());

        assert_eq!(
            PersistError::Conflict { remote_revision: 4 }.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(PersistError::Fatal("x".into()).kind(), ErrorKind::FatalPersist);
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError::TooLarge {
            size: 11,
            max: 10,
        };
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn session_error_kind() {
        let err = SessionError::from(ValidationError::UnsupportedMimeType("text/x".into()));
        assert_eq!(err.kind(), Some(ErrorKind::Validation));
        assert_eq!(SessionError::Closed.kind(), None);
    }
}

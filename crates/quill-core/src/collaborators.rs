//! External collaborators
//!
//! The session talks to the outside world only through these traits:
//! persistence, text generation and asset upload. Implementations are
//! injected as trait objects when the session is constructed.

use crate::error::{AssistError, PersistError, UploadError};
use crate::types::{AssetRef, Document, Revision};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One save call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub document_id: String,
    pub content: String,
    /// Session revision of `content`
    pub revision: Revision,
    /// Revision the caller believes the remote currently holds
    pub expected_base_revision: Revision,
}

/// Acknowledgement of a successful save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    pub revision: Revision,
    pub saved_at: DateTime<Utc>,
}

/// Persistence backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceClient: Send + Sync {
    /// Read a document
    async fn load(&self, document_id: &str) -> Result<Document, PersistError>;

    /// Store content on top of `expected_base_revision`
    async fn save(&self, request: SaveRequest) -> Result<SaveReceipt, PersistError>;
}

/// Text generation backend (plain text in, plain text out)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssistClient: Send + Sync {
    /// Generate text for a prompt
    async fn generate(&self, prompt: &str) -> Result<String, AssistError>;
}

/// Asset upload backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UploadClient: Send + Sync {
    /// Transfer bytes and return the stored asset reference
    async fn upload(
        &self,
        bytes: Bytes,
        mime_type: &str,
        file_name: &str,
    ) -> Result<AssetRef, UploadError>;
}

/// The full set of injected collaborators
#[derive(Clone)]
pub struct Collaborators {
    pub persistence: Arc<dyn PersistenceClient>,
    pub assist: Arc<dyn AssistClient>,
    pub uploads: Arc<dyn UploadClient>,
}

impl Collaborators {
    /// Bundle collaborators
    #[must_use]
    pub fn new(
        persistence: Arc<dyn PersistenceClient>,
        assist: Arc<dyn AssistClient>,
        uploads: Arc<dyn UploadClient>,
    ) -> Self {
        Self {
            persistence,
            assist,
            uploads,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

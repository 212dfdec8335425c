//! Testing utilities for the Quill workspace
//!
//! Scripted collaborators with controllable latency and failures, and
//! fixtures for building sessions in tests and simulations.

#![allow(missing_docs)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use quill_core::{
    AssetRef, AssistClient, AssistError, Collaborators, Document, FileDescriptor, PersistError,
    PersistenceClient, SaveReceipt, SaveRequest, SessionConfig, SessionController, SessionError,
    UploadClient, UploadError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

async fn delay(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

/// In-memory persistence with a failure script
///
/// Each save pops the next scripted outcome; an empty script means success.
#[derive(Debug, Default)]
pub struct ScriptedPersistence {
    latency: Duration,
    documents: Mutex<HashMap<String, Document>>,
    script: Mutex<VecDeque<PersistError>>,
    stalls: Mutex<usize>,
    saves: Mutex<Vec<SaveRequest>>,
}

impl ScriptedPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn with_document(self, document: Document) -> Self {
        self.documents.lock().insert(document.id.clone(), document);
        self
    }

    /// Fail the next save calls with these errors, in order
    pub fn fail_next(&self, errors: impl IntoIterator<Item = PersistError>) {
        self.script.lock().extend(errors);
    }

    /// Hang the next `calls` saves far beyond any operation timeout
    pub fn stall_next(&self, calls: usize) {
        *self.stalls.lock() += calls;
    }

    /// Every save request received, in call order
    pub fn saves(&self) -> Vec<SaveRequest> {
        self.saves.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().len()
    }

    /// Stored copy of a document
    pub fn stored(&self, document_id: &str) -> Option<Document> {
        self.documents.lock().get(document_id).cloned()
    }
}

#[async_trait]
impl PersistenceClient for ScriptedPersistence {
    async fn load(&self, document_id: &str) -> Result<Document, PersistError> {
        delay(self.latency).await;
        self.stored(document_id)
            .ok_or_else(|| PersistError::NotFound(document_id.to_string()))
    }

    async fn save(&self, request: SaveRequest) -> Result<SaveReceipt, PersistError> {
        self.saves.lock().push(request.clone());
        let stalled = {
            let mut stalls = self.stalls.lock();
            let stalled = *stalls > 0;
            *stalls = stalls.saturating_sub(1);
            stalled
        };
        if stalled {
            delay(Duration::from_secs(24 * 60 * 60)).await;
        }
        delay(self.latency).await;

        if let Some(error) = self.script.lock().pop_front() {
            return Err(error);
        }

        let saved_at = Utc::now();
        let mut documents = self.documents.lock();
        let document = documents
            .entry(request.document_id.clone())
            .or_insert_with(|| Document::new(request.document_id.clone(), "", ""));
        document.content = request.content;
        document.revision = request.revision;
        document.updated_at = saved_at;

        Ok(SaveReceipt {
            revision: request.revision,
            saved_at,
        })
    }
}

/// Text generation that replays scripted responses
///
/// Without a scripted response the prompt is echoed back prefixed with
/// `[ai] `.
#[derive(Debug, Default)]
pub struct ScriptedAssist {
    latency: Duration,
    responses: Mutex<VecDeque<Result<String, AssistError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAssist {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn respond_with(&self, response: Result<String, AssistError>) {
        self.responses.lock().push_back(response);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl AssistClient for ScriptedAssist {
    async fn generate(&self, prompt: &str) -> Result<String, AssistError> {
        self.prompts.lock().push(prompt.to_string());
        let scripted = self.responses.lock().pop_front();
        delay(self.latency).await;
        scripted.unwrap_or_else(|| Ok(format!("[ai] {prompt}")))
    }
}

/// Upload backend with per-file latency
#[derive(Debug)]
pub struct ScriptedUploads {
    base_url: String,
    latency: Duration,
    per_file: HashMap<String, Duration>,
    failures: Mutex<VecDeque<UploadError>>,
    calls: Mutex<Vec<String>>,
}

impl Default for ScriptedUploads {
    fn default() -> Self {
        Self {
            base_url: "https://cdn.test/assets/".to_string(),
            latency: Duration::ZERO,
            per_file: HashMap::new(),
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedUploads {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Override latency for one file name
    #[must_use]
    pub fn with_file_latency(mut self, file_name: impl Into<String>, latency: Duration) -> Self {
        self.per_file.insert(file_name.into(), latency);
        self
    }

    pub fn fail_next(&self, error: UploadError) {
        self.failures.lock().push_back(error);
    }

    /// File names received, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn url_for(&self, file_name: &str) -> String {
        format!("{}{file_name}", self.base_url)
    }
}

#[async_trait]
impl UploadClient for ScriptedUploads {
    async fn upload(
        &self,
        bytes: Bytes,
        _mime_type: &str,
        file_name: &str,
    ) -> Result<AssetRef, UploadError> {
        self.calls.lock().push(file_name.to_string());
        let failure = self.failures.lock().pop_front();
        delay(self.per_file.get(file_name).copied().unwrap_or(self.latency)).await;

        if let Some(error) = failure {
            return Err(error);
        }
        Ok(AssetRef {
            url: self.url_for(file_name),
            key: format!("assets/{file_name}"),
            name: file_name.to_string(),
            size: bytes.len() as u64,
        })
    }
}

/// Scripted collaborators kept reachable for assertions
#[derive(Debug, Clone)]
pub struct Harness {
    pub persistence: Arc<ScriptedPersistence>,
    pub assist: Arc<ScriptedAssist>,
    pub uploads: Arc<ScriptedUploads>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(
            ScriptedPersistence::new(),
            ScriptedAssist::new(),
            ScriptedUploads::new(),
        )
    }
}

impl Harness {
    pub fn new(
        persistence: ScriptedPersistence,
        assist: ScriptedAssist,
        uploads: ScriptedUploads,
    ) -> Self {
        Self {
            persistence: Arc::new(persistence),
            assist: Arc::new(assist),
            uploads: Arc::new(uploads),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.persistence.clone(),
            self.assist.clone(),
            self.uploads.clone(),
        )
    }

    /// Open a session on `document` without going through `load`
    ///
    /// # Errors
    /// `SessionError::Config` if `config` is invalid
    pub fn session(
        &self,
        document: Document,
        config: SessionConfig,
    ) -> Result<SessionController, SessionError> {
        SessionController::new(document, config, self.collaborators())
    }
}

pub fn test_document(content: &str) -> Document {
    Document::new("doc-test", "Test document", "author-test").with_content(content)
}

/// PNG descriptor of `size` bytes
pub fn png_file(name: &str, size: usize) -> FileDescriptor {
    FileDescriptor::new(name, "image/png", vec![0x89u8; size])
}

/// Config with short timers for fast simulations
pub fn fast_config() -> SessionConfig {
    SessionConfig::new()
        .with_debounce(Duration::from_millis(200))
        .with_backoff_base(Duration::from_millis(100))
        .with_operation_timeout(Duration::from_secs(2))
}

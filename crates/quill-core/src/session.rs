//! Session controller
//!
//! The single mutator of a session's buffer. It composes the content store,
//! autosave planner, AI assist and upload coordinators into one state machine:
//!
//! ```text
//! Clean --edit--> Dirty --debounce / save--> Saving --ok--> Clean | Saving
//!                                            Saving --err--> Retrying --max--> Error
//!                                            Error --retry--> Saving
//! ```
//!
//! Network calls run as spawned tasks. Their results re-enter through the
//! session lock and are applied only if the ticket, request or task they carry
//! is still the live one; late responses after cancellation or close are
//! dropped. The lock is never held across an `.await`.

use crate::assist::{AssistCoordinator, AssistResolution};
use crate::autosave::{AutosavePlanner, DebounceAction, SaveFollowUp, SaveTicket, SaveTrigger};
use crate::collaborators::{Collaborators, SaveReceipt, SaveRequest};
use crate::config::SessionConfig;
use crate::error::{
    AssistError, ErrorKind, FaultOrigin, PersistError, SessionError, SessionFault, UploadError,
};
use crate::journal::{EventKind, Journal, SessionEvent};
use crate::store::{ContentStore, InsertPosition};
use crate::types::{
    AssetRef, AssistIntent, AssistRequest, ContentSnapshot, Document, FileDescriptor,
    MergeStrategy, RequestId, Revision, SaveState, TaskId, UploadTask,
};
use crate::upload::{UploadCoordinator, UploadResolution};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Observable session state for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub document_id: String,
    pub revision: Revision,
    pub dirty: bool,
    pub save_state: SaveState,
    pub last_saved_revision: Revision,
    pub last_saved_at: Option<DateTime<Utc>>,
    /// Most recent surfaced failure
    ///
    /// A save fault is cleared by the next successful save. An AI or upload
    /// fault is cleared by the next successful save, applied AI result or
    /// inserted upload.
    pub last_error: Option<SessionFault>,
    /// A debounce or backoff timer is armed and will start a save
    pub save_scheduled: bool,
    pub pending_assists: usize,
    pub active_uploads: usize,
    pub closed: bool,
}

impl SessionStatus {
    /// No save, AI request or upload is in flight or scheduled
    ///
    /// A dirty buffer with no timer armed (autosave off, or paused in
    /// `Error`) counts as settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !self.save_state.is_busy()
            && !self.save_scheduled
            && self.pending_assists == 0
            && self.active_uploads == 0
    }
}

/// One open editor session
///
/// Entry points spawn work on the current Tokio runtime and must be called
/// from within one. Dropping the controller closes the session.
pub struct SessionController {
    shared: Arc<Shared>,
}

struct Shared {
    config: SessionConfig,
    collaborators: Collaborators,
    state: Mutex<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
}

/// A spawned sleep that fires `generation` into the planner
struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct SessionState {
    document: Document,
    store: ContentStore,
    autosave: AutosavePlanner,
    assist: AssistCoordinator,
    uploads: UploadCoordinator,
    journal: Journal,
    last_error: Option<SessionFault>,
    last_saved_at: Option<DateTime<Utc>>,
    closed: bool,
    debounce_timer: Option<Timer>,
    retry_timer: Option<Timer>,
    save_task: Option<JoinHandle<()>>,
    assist_tasks: HashMap<RequestId, JoinHandle<()>>,
    upload_tasks: HashMap<TaskId, JoinHandle<()>>,
}

impl SessionState {
    fn status(&self) -> SessionStatus {
        SessionStatus {
            document_id: self.document.id.clone(),
            revision: self.store.revision(),
            dirty: self.store.is_dirty(),
            save_state: self.autosave.state(),
            last_saved_revision: self.autosave.last_saved_revision(),
            last_saved_at: self.last_saved_at,
            last_error: self.last_error.clone(),
            save_scheduled: self.debounce_timer.is_some() || self.retry_timer.is_some(),
            pending_assists: self.assist.pending_count(),
            active_uploads: self.uploads.active_count(),
            closed: self.closed,
        }
    }

    fn record(&mut self, kind: EventKind) {
        self.journal.record(self.store.revision(), kind);
    }

    fn fault(&mut self, kind: ErrorKind, origin: FaultOrigin, message: impl Into<String>) {
        self.last_error = Some(SessionFault::new(kind, origin, message));
    }

    fn clear_fault(&mut self, origin: FaultOrigin) {
        if self
            .last_error
            .as_ref()
            .is_some_and(|fault| fault.origin == origin)
        {
            self.last_error = None;
        }
    }

    fn abort_timers(&mut self) {
        for timer in [self.debounce_timer.take(), self.retry_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.handle.abort();
        }
    }
}

impl SessionController {
    /// Load a document from persistence and open a session on it
    ///
    /// # Errors
    /// - `SessionError::Config` if the configuration is invalid
    /// - `SessionError::Load` if the document cannot be read
    pub async fn open(
        document_id: &str,
        config: SessionConfig,
        collaborators: Collaborators,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let persistence = Arc::clone(&collaborators.persistence);
        let document = bounded(
            config.operation_timeout(),
            persistence.load(document_id),
            |timeout_ms| PersistError::Timeout { timeout_ms },
        )
        .await
        .map_err(SessionError::Load)?;
        Self::new(document, config, collaborators)
    }

    /// Open a session on an already loaded document
    ///
    /// # Errors
    /// `SessionError::Config` if the configuration is invalid
    pub fn new(
        document: Document,
        config: SessionConfig,
        collaborators: Collaborators,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let state = SessionState {
            store: ContentStore::new(document.content.clone(), document.revision),
            autosave: AutosavePlanner::new(&config, document.revision),
            assist: AssistCoordinator::new(config.ai_concurrency_policy, config.history_limit),
            uploads: UploadCoordinator::new(&config),
            journal: Journal::new(config.history_limit),
            last_error: None,
            last_saved_at: None,
            closed: false,
            debounce_timer: None,
            retry_timer: None,
            save_task: None,
            assist_tasks: HashMap::new(),
            upload_tasks: HashMap::new(),
            document,
        };
        let (status_tx, _) = watch::channel(state.status());

        tracing::info!(
            document = %state.document.id,
            revision = state.store.revision(),
            "session opened"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                collaborators,
                state: Mutex::new(state),
                status_tx,
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Replace the buffer content; returns the resulting revision
    ///
    /// Content equal to the current buffer is not a mutation.
    ///
    /// # Errors
    /// `SessionError::Closed` after `close`
    pub fn edit(&self, content: impl Into<String>) -> Result<Revision, SessionError> {
        let content = content.into();
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(SessionError::Closed);
        }
        if state.store.content() == content {
            return Ok(state.store.revision());
        }

        let revision = state.store.update(content);
        state.record(EventKind::Edited);
        tracing::debug!(revision, "content edited");
        self.shared.after_mutation(state);
        self.shared.publish(state);
        Ok(revision)
    }

    /// Save now instead of waiting for the debounce window
    ///
    /// # Errors
    /// `SessionError::Closed` after `close`
    pub fn save_now(&self) -> Result<SaveTrigger, SessionError> {
        self.shared.explicit_save()
    }

    /// Leave the `Error` state and save again with the latest content
    ///
    /// # Errors
    /// `SessionError::Closed` after `close`
    pub fn retry_save(&self) -> Result<SaveTrigger, SessionError> {
        tracing::info!(state = %self.status().save_state, "save retry requested");
        self.shared.explicit_save()
    }

    /// Send a text transformation; its result is applied only if the
    /// buffer is still at the revision current now
    ///
    /// # Errors
    /// - `SessionError::FeatureDisabled` if AI assist is switched off
    /// - `SessionError::AssistInFlight` under the reject-new policy
    /// - `SessionError::Closed` after `close`
    pub fn dispatch_assist(&self, intent: AssistIntent) -> Result<RequestId, SessionError> {
        if !self.shared.config.enable_ai {
            return Err(SessionError::FeatureDisabled("ai assist"));
        }
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(SessionError::Closed);
        }

        let source_revision = state.store.revision();
        let dispatch = state.assist.dispatch(&intent, source_revision)?;
        if let Some(previous) = dispatch.superseded {
            if let Some(handle) = state.assist_tasks.remove(&previous) {
                handle.abort();
            }
            state.record(EventKind::AssistCancelled { request: previous });
            tracing::debug!(request = %previous, "superseded pending assist request");
        }

        let request_id = dispatch.request_id;
        state.record(EventKind::AssistDispatched {
            request: request_id,
            kind: intent.kind,
        });
        tracing::info!(request = %request_id, kind = %intent.kind, source_revision, "assist dispatched");

        let client = Arc::clone(&self.shared.collaborators.assist);
        let limit = self.shared.config.operation_timeout();
        let shared = Arc::clone(&self.shared);
        let prompt = dispatch.prompt;
        let handle = self.shared.spawn(async move {
            let result = bounded(limit, client.generate(&prompt), |timeout_ms| {
                AssistError::Timeout { timeout_ms }
            })
            .await;
            shared.finish_assist(request_id, result);
        });
        state.assist_tasks.insert(request_id, handle);

        self.shared.publish(state);
        Ok(request_id)
    }

    /// Cancel a pending AI request; returns whether it was pending
    ///
    /// # Errors
    /// `SessionError::Closed` after `close`
    pub fn cancel_assist(&self, request_id: RequestId) -> Result<bool, SessionError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(SessionError::Closed);
        }
        if !state.assist.cancel(request_id) {
            return Ok(false);
        }
        if let Some(handle) = state.assist_tasks.remove(&request_id) {
            handle.abort();
        }
        state.record(EventKind::AssistCancelled {
            request: request_id,
        });
        tracing::info!(request = %request_id, "assist cancelled");
        self.shared.publish(state);
        Ok(true)
    }

    /// Validate and upload a file; its reference is inserted once the
    /// transfer completes
    ///
    /// # Errors
    /// - `SessionError::Validation` before any network call
    /// - `SessionError::FeatureDisabled` if uploads are switched off
    /// - `SessionError::Closed` after `close`
    pub fn submit_upload(&self, file: FileDescriptor) -> Result<TaskId, SessionError> {
        if !self.shared.config.enable_upload {
            return Err(SessionError::FeatureDisabled("uploads"));
        }
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(SessionError::Closed);
        }

        let revision = state.store.revision();
        let task_id = match state.uploads.submit(&file, revision) {
            Ok(task_id) => task_id,
            Err(error) => {
                tracing::warn!(file = %file.name, %error, "upload rejected before transfer");
                state.fault(ErrorKind::Validation, FaultOrigin::Upload, error.to_string());
                self.shared.publish(state);
                return Err(error.into());
            }
        };
        state.record(EventKind::UploadSubmitted { task: task_id });
        tracing::info!(task = %task_id, file = %file.name, size = file.size(), "upload submitted");

        let client = Arc::clone(&self.shared.collaborators.uploads);
        let limit = self.shared.config.operation_timeout();
        let shared = Arc::clone(&self.shared);
        let FileDescriptor {
            name,
            mime_type,
            bytes,
            ..
        } = file;
        let handle = self.shared.spawn(async move {
            let result = bounded(limit, client.upload(bytes, &mime_type, &name), |timeout_ms| {
                UploadError::Timeout { timeout_ms }
            })
            .await;
            shared.finish_upload(task_id, result);
        });
        state.upload_tasks.insert(task_id, handle);

        self.shared.publish(state);
        Ok(task_id)
    }

    /// Close the session, cancelling all in-flight work
    ///
    /// Late responses are ignored. Unsaved content stays readable through
    /// `snapshot` for export.
    pub fn close(&self) -> SessionStatus {
        self.shared.shutdown()
    }

    /// Current observable state
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.shared.state.lock().status()
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Wait until nothing is in flight or scheduled
    pub async fn settled(&self) -> SessionStatus {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(SessionStatus::is_settled).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        status
    }

    /// Immutable copy of the buffer
    #[must_use]
    pub fn snapshot(&self) -> ContentSnapshot {
        self.shared.state.lock().store.snapshot()
    }

    /// The document as last persisted
    #[must_use]
    pub fn document(&self) -> Document {
        self.shared.state.lock().document.clone()
    }

    /// Look up an AI request
    #[must_use]
    pub fn assist_request(&self, request_id: RequestId) -> Option<AssistRequest> {
        self.shared.state.lock().assist.get(request_id).cloned()
    }

    /// Look up an upload task
    #[must_use]
    pub fn upload_task(&self, task_id: TaskId) -> Option<UploadTask> {
        self.shared.state.lock().uploads.get(task_id).cloned()
    }

    /// AI requests in dispatch order
    #[must_use]
    pub fn assist_requests(&self) -> Vec<AssistRequest> {
        self.shared.state.lock().assist.requests().cloned().collect()
    }

    /// Upload tasks in submission order
    #[must_use]
    pub fn upload_tasks(&self) -> Vec<UploadTask> {
        self.shared.state.lock().uploads.tasks().cloned().collect()
    }

    /// Recent session events, oldest first
    #[must_use]
    pub fn events(&self) -> Vec<SessionEvent> {
        self.shared.state.lock().journal.events()
    }

    /// Session configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn publish(&self, state: &SessionState) {
        self.status_tx.send_replace(state.status());
    }

    fn spawn<F>(&self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = work => {}
            }
        })
    }

    /// Feed a mutation into the save machine
    fn after_mutation(self: &Arc<Self>, state: &mut SessionState) {
        let revision = state.store.revision();
        if !self.config.autosave {
            state.autosave.mark_dirty();
            return;
        }
        let Some(generation) = state.autosave.schedule(revision) else {
            return;
        };
        if let Some(timer) = state.debounce_timer.take() {
            timer.handle.abort();
        }
        let delay = state.autosave.debounce();
        let shared = Arc::clone(self);
        state.debounce_timer = Some(Timer {
            generation,
            handle: self.spawn(async move {
                tokio::time::sleep(delay).await;
                shared.on_debounce(generation);
            }),
        });
    }

    fn on_debounce(self: &Arc<Self>, generation: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }
        if state
            .debounce_timer
            .as_ref()
            .is_some_and(|timer| timer.generation == generation)
        {
            state.debounce_timer = None;
        }
        let current = state.store.revision();
        let dirty = state.store.is_dirty();
        match state.autosave.debounce_elapsed(generation, current, dirty) {
            DebounceAction::StartSave => self.start_save(state),
            DebounceAction::Deferred => {
                tracing::debug!(revision = current, "save in flight; re-save queued");
                state.record(EventKind::SaveDeferred);
            }
            DebounceAction::Ignore => {}
        }
        self.publish(state);
    }

    fn explicit_save(self: &Arc<Self>) -> Result<SaveTrigger, SessionError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(SessionError::Closed);
        }
        let trigger = state
            .autosave
            .request_explicit(state.store.revision(), state.store.is_dirty());
        match trigger {
            SaveTrigger::Started => {
                state.abort_timers();
                self.start_save(state);
            }
            SaveTrigger::Queued => state.record(EventKind::SaveDeferred),
            SaveTrigger::InFlight | SaveTrigger::AlreadyClean => {}
        }
        self.publish(state);
        Ok(trigger)
    }

    /// Issue a save of the latest snapshot
    fn start_save(self: &Arc<Self>, state: &mut SessionState) {
        let snapshot = state.store.snapshot();
        let ticket = state.autosave.begin(snapshot.revision);
        state.record(EventKind::SaveStarted {
            ticket: ticket.id,
            base_revision: ticket.base_revision,
        });
        tracing::info!(
            ticket = ticket.id,
            revision = ticket.revision,
            base = ticket.base_revision,
            attempt = ticket.attempt,
            "saving"
        );

        let request = SaveRequest {
            document_id: state.document.id.clone(),
            content: snapshot.content,
            revision: snapshot.revision,
            expected_base_revision: ticket.base_revision,
        };
        let persistence = Arc::clone(&self.collaborators.persistence);
        let limit = self.config.operation_timeout();
        let shared = Arc::clone(self);
        state.save_task = Some(self.spawn(async move {
            let content = request.content.clone();
            let result = bounded(limit, persistence.save(request), |timeout_ms| {
                PersistError::Timeout { timeout_ms }
            })
            .await;
            shared.finish_save(ticket, content, result);
        }));
    }

    fn finish_save(
        self: &Arc<Self>,
        ticket: SaveTicket,
        content: String,
        result: Result<SaveReceipt, PersistError>,
    ) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }
        let saved_at = result.as_ref().ok().map(|receipt| receipt.saved_at);
        let Some(follow_up) = state.autosave.complete(ticket.id, result.map(|_| ())) else {
            tracing::debug!(ticket = ticket.id, "stale save completion ignored");
            return;
        };

        match follow_up {
            SaveFollowUp::Saved { revision, resave } => {
                let clean = state.store.mark_persisted(revision);
                state.document.content = content;
                state.document.revision = revision;
                if let Some(at) = saved_at {
                    state.document.updated_at = at;
                    state.last_saved_at = Some(at);
                }
                state.last_error = None;
                state.record(EventKind::SaveSucceeded { ticket: ticket.id });
                tracing::info!(ticket = ticket.id, revision, "save succeeded");

                if resave && !clean {
                    self.start_save(state);
                } else {
                    state.autosave.settle(!clean);
                }
            }
            SaveFollowUp::RetryAfter {
                error,
                attempt,
                delay,
                generation,
            } => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(ticket = ticket.id, attempt, delay_ms, %error, "save failed; retrying");
                state.record(EventKind::SaveFailed {
                    ticket: ticket.id,
                    kind: error.kind(),
                    message: error.to_string(),
                });
                state.record(EventKind::SaveRetryScheduled { attempt, delay_ms });
                state.fault(error.kind(), FaultOrigin::Save, error.to_string());

                if let Some(timer) = state.retry_timer.take() {
                    timer.handle.abort();
                }
                let shared = Arc::clone(self);
                state.retry_timer = Some(Timer {
                    generation,
                    handle: self.spawn(async move {
                        tokio::time::sleep(delay).await;
                        shared.on_retry(generation);
                    }),
                });
            }
            SaveFollowUp::RetryNow { error } => {
                tracing::warn!(
                    ticket = ticket.id,
                    base = state.autosave.base_revision(),
                    %error,
                    "revision conflict; re-saving on remote base"
                );
                state.record(EventKind::SaveFailed {
                    ticket: ticket.id,
                    kind: error.kind(),
                    message: error.to_string(),
                });
                state.fault(error.kind(), FaultOrigin::Save, error.to_string());
                self.start_save(state);
            }
            SaveFollowUp::GaveUp { error } => {
                tracing::error!(
                    ticket = ticket.id,
                    failures = state.autosave.failures(),
                    %error,
                    "save gave up; content kept in memory"
                );
                state.record(EventKind::SaveFailed {
                    ticket: ticket.id,
                    kind: error.kind(),
                    message: error.to_string(),
                });
                state.record(EventKind::SaveGaveUp { kind: error.kind() });
                state.fault(error.kind(), FaultOrigin::Save, error.to_string());
            }
        }
        self.publish(state);
    }

    fn on_retry(self: &Arc<Self>, generation: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }
        if state
            .retry_timer
            .as_ref()
            .is_some_and(|timer| timer.generation == generation)
        {
            state.retry_timer = None;
        }
        if state.autosave.retry_elapsed(generation) {
            self.start_save(state);
        }
        self.publish(state);
    }

    fn finish_assist(self: &Arc<Self>, request_id: RequestId, result: Result<String, AssistError>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }
        state.assist_tasks.remove(&request_id);

        let current = state.store.revision();
        match state.assist.resolve(request_id, result, current) {
            AssistResolution::Apply { text, merge } => {
                let applied = match merge {
                    MergeStrategy::Replace => Ok(state.store.update(text)),
                    MergeStrategy::Append => {
                        state
                            .store
                            .merge_insertion(&text, current, InsertPosition::End)
                    }
                    MergeStrategy::InsertAt(offset) => {
                        state
                            .store
                            .merge_insertion(&text, current, InsertPosition::Offset(offset))
                    }
                };
                match applied {
                    Ok(revision) => {
                        state.record(EventKind::AssistApplied {
                            request: request_id,
                        });
                        tracing::info!(request = %request_id, revision, "assist result applied");
                        state.clear_fault(FaultOrigin::Assist);
                        self.after_mutation(state);
                    }
                    Err(rejected) => {
                        tracing::warn!(request = %request_id, %rejected, "assist result not merged");
                        state.assist.mark_failed(request_id);
                        state.record(EventKind::AssistFailed {
                            request: request_id,
                            message: rejected.to_string(),
                        });
                    }
                }
            }
            AssistResolution::Stale { source_revision } => {
                tracing::debug!(
                    request = %request_id,
                    source_revision,
                    current,
                    "discarding stale assist result"
                );
                state.record(EventKind::AssistDiscarded {
                    request: request_id,
                    source_revision,
                });
            }
            AssistResolution::Failed(error) => {
                tracing::warn!(request = %request_id, %error, "assist request failed");
                state.fault(error.kind(), FaultOrigin::Assist, error.to_string());
                state.record(EventKind::AssistFailed {
                    request: request_id,
                    message: error.to_string(),
                });
            }
            AssistResolution::Ignored => {
                tracing::debug!(request = %request_id, "late assist response ignored");
            }
        }
        self.publish(state);
    }

    fn finish_upload(self: &Arc<Self>, task_id: TaskId, result: Result<AssetRef, UploadError>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }
        state.upload_tasks.remove(&task_id);

        match state.uploads.complete(task_id, result) {
            UploadResolution::Insert {
                marker,
                position,
                at_revision,
            } => {
                let url = state
                    .uploads
                    .get(task_id)
                    .and_then(|task| task.result_ref.as_ref())
                    .map(|asset| asset.url.clone())
                    .unwrap_or_default();
                match state.store.merge_insertion(&marker, at_revision, position) {
                    Ok(revision) => {
                        state.uploads.mark_done(task_id);
                        state.record(EventKind::UploadInserted { task: task_id, url });
                        tracing::info!(task = %task_id, revision, "upload reference inserted");
                        state.clear_fault(FaultOrigin::Upload);
                        self.after_mutation(state);
                    }
                    Err(rejected) => {
                        tracing::warn!(task = %task_id, %rejected, "upload reference not inserted");
                        state.uploads.mark_rejected(task_id, rejected.to_string());
                        state.record(EventKind::UploadRejected {
                            task: task_id,
                            reason: rejected.to_string(),
                        });
                    }
                }
            }
            UploadResolution::Failed(error) => {
                tracing::warn!(task = %task_id, %error, "upload failed");
                state.fault(error.kind(), FaultOrigin::Upload, error.to_string());
                state.record(EventKind::UploadRejected {
                    task: task_id,
                    reason: error.to_string(),
                });
            }
            UploadResolution::Ignored => {
                tracing::debug!(task = %task_id, "late upload response ignored");
            }
        }
        self.publish(state);
    }

    fn shutdown(&self) -> SessionStatus {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return state.status();
        }
        state.closed = true;
        self.cancel.cancel();

        state.abort_timers();
        if let Some(handle) = state.save_task.take() {
            handle.abort();
        }
        for (_, handle) in state.assist_tasks.drain() {
            handle.abort();
        }
        for (_, handle) in state.upload_tasks.drain() {
            handle.abort();
        }

        let dirty = state.store.is_dirty();
        state.autosave.abandon(dirty);
        for request in state.assist.cancel_all() {
            state.record(EventKind::AssistCancelled { request });
        }
        for task in state.uploads.cancel_in_flight() {
            state.record(EventKind::UploadRejected {
                task,
                reason: UploadError::Cancelled.to_string(),
            });
        }
        state.record(EventKind::Closed { dirty });

        if dirty {
            tracing::warn!(
                document = %state.document.id,
                revision = state.store.revision(),
                last_saved = state.autosave.last_saved_revision(),
                "session closed with unsaved changes"
            );
        } else {
            tracing::info!(document = %state.document.id, "session closed");
        }

        self.publish(state);
        state.status()
    }
}

/// Run `operation` with an upper bound; elapsed time becomes `on_timeout`
async fn bounded<T, E, F>(
    limit: Duration,
    operation: F,
    on_timeout: impl FnOnce(u64) -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(
            u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MockAssistClient, MockPersistenceClient, MockUploadClient};

    fn collaborators(
        persistence: MockPersistenceClient,
        uploads: MockUploadClient,
    ) -> Collaborators {
        Collaborators::new(
            Arc::new(persistence),
            Arc::new(MockAssistClient::new()),
            Arc::new(uploads),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_upload_makes_no_network_call() {
        let mut uploads = MockUploadClient::new();
        uploads.expect_upload().times(0);

        let session = SessionController::new(
            Document::new("doc", "Doc", "me"),
            SessionConfig::default(),
            collaborators(MockPersistenceClient::new(), uploads),
        )
        .unwrap();

        let eleven_mb = vec![0u8; 11 * 1024 * 1024];
        let err = session
            .submit_upload(FileDescriptor::new("big.png", "image/png", eleven_mb))
            .unwrap_err();

        assert!(matches!(err, SessionError::Validation(_)));
        assert!(session.upload_tasks().is_empty());
        let status = session.status();
        assert_eq!(status.last_error.map(|f| f.kind), Some(ErrorKind::Validation));
        assert_eq!(status.revision, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_save_without_edits_is_a_no_op() {
        let mut persistence = MockPersistenceClient::new();
        persistence.expect_save().times(1).returning(|request| {
            Ok(SaveReceipt {
                revision: request.revision,
                saved_at: Utc::now(),
            })
        });

        let session = SessionController::new(
            Document::new("doc", "Doc", "me"),
            SessionConfig::default().with_autosave(false),
            collaborators(persistence, MockUploadClient::new()),
        )
        .unwrap();

        session.edit("hello").unwrap();
        assert_eq!(session.status().save_state, SaveState::Dirty);
        assert_eq!(session.save_now().unwrap(), SaveTrigger::Started);

        let status = session.settled().await;
        assert_eq!(status.save_state, SaveState::Clean);
        assert_eq!(status.last_saved_revision, 1);

        assert_eq!(session.save_now().unwrap(), SaveTrigger::AlreadyClean);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(session.document().content, "hello");
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let err = SessionController::new(
            Document::new("doc", "Doc", "me"),
            SessionConfig::default().with_history_limit(0),
            collaborators(MockPersistenceClient::new(), MockUploadClient::new()),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[tokio::test]
    async fn closed_session_refuses_entry_points() {
        let session = SessionController::new(
            Document::new("doc", "Doc", "me"),
            SessionConfig::default(),
            collaborators(MockPersistenceClient::new(), MockUploadClient::new()),
        )
        .unwrap();

        let status = session.close();
        assert!(status.closed);
        assert!(matches!(session.edit("x"), Err(SessionError::Closed)));
        assert!(matches!(session.save_now(), Err(SessionError::Closed)));
        assert!(matches!(
            session.dispatch_assist(AssistIntent::improve("x")),
            Err(SessionError::Closed)
        ));
    }
}

//! AI assist coordinator
//!
//! Tracks text-transformation requests against the revision they were
//! dispatched at. A result is applied only if the buffer has not moved since;
//! otherwise it is discarded silently. One request per kind may be pending.

use crate::config::AssistPolicy;
use crate::error::{AssistError, SessionError};
use crate::types::{AssistIntent, AssistKind, AssistRequest, AssistStatus, MergeStrategy, RequestId, Revision};
use chrono::Utc;
use indexmap::IndexMap;
use std::collections::HashMap;

/// A request ready to be sent to the AI collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistDispatch {
    pub request_id: RequestId,
    pub prompt: String,
    /// Pending request of the same kind that was cancelled to make room
    pub superseded: Option<RequestId>,
}

/// Outcome of a completed AI call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssistResolution {
    /// Buffer unchanged since dispatch; apply `text`
    Apply { text: String, merge: MergeStrategy },
    /// Buffer moved on; result dropped
    Stale { source_revision: Revision },
    /// Collaborator failed
    Failed(AssistError),
    /// Unknown, cancelled or already resolved request
    Ignored,
}

/// Prompt sent to the model for an intent
#[must_use]
pub fn build_prompt(intent: &AssistIntent) -> String {
    let text = intent.input.as_str();
    match intent.kind {
        AssistKind::Improve => format!("Improve this text: {text}"),
        AssistKind::Summarize => format!("Summarize this text: {text}"),
        AssistKind::Expand => format!("Expand this text: {text}"),
        AssistKind::Custom => {
            let instruction = intent.instruction.as_deref().unwrap_or_default().trim();
            match (instruction.is_empty(), text.is_empty()) {
                (true, _) => text.to_string(),
                (false, true) => instruction.to_string(),
                (false, false) => format!("{instruction}\n\n{text}"),
            }
        }
    }
}

/// Bookkeeping for AI requests of one session
#[derive(Debug, Clone)]
pub struct AssistCoordinator {
    policy: AssistPolicy,
    history_limit: usize,
    requests: IndexMap<RequestId, AssistRequest>,
    pending: HashMap<AssistKind, RequestId>,
}

impl AssistCoordinator {
    /// Create coordinator
    #[must_use]
    pub fn new(policy: AssistPolicy, history_limit: usize) -> Self {
        Self {
            policy,
            history_limit,
            requests: IndexMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Register a new request dispatched at `source_revision`
    ///
    /// # Errors
    /// `SessionError::AssistInFlight` under the reject-new policy when a
    /// request of the same kind is still pending
    pub fn dispatch(
        &mut self,
        intent: &AssistIntent,
        source_revision: Revision,
    ) -> Result<AssistDispatch, SessionError> {
        let superseded = match self.pending.get(&intent.kind).copied() {
            Some(previous) => match self.policy {
                AssistPolicy::RejectNew => {
                    return Err(SessionError::AssistInFlight {
                        kind: intent.kind,
                        request: previous,
                    });
                }
                AssistPolicy::CancelPrevious => {
                    self.cancel(previous);
                    Some(previous)
                }
            },
            None => None,
        };

        let request_id = RequestId::new();
        self.requests.insert(
            request_id,
            AssistRequest {
                id: request_id,
                kind: intent.kind,
                source_revision,
                status: AssistStatus::Pending,
                result_text: None,
                merge: intent.effective_merge(),
                dispatched_at: Utc::now(),
            },
        );
        self.pending.insert(intent.kind, request_id);
        self.prune();

        Ok(AssistDispatch {
            request_id,
            prompt: build_prompt(intent),
            superseded,
        })
    }

    /// Reconcile a completed call with the buffer at `current_revision`
    pub fn resolve(
        &mut self,
        request_id: RequestId,
        result: Result<String, AssistError>,
        current_revision: Revision,
    ) -> AssistResolution {
        let Some(record) = self.requests.get_mut(&request_id) else {
            return AssistResolution::Ignored;
        };
        if record.status != AssistStatus::Pending {
            return AssistResolution::Ignored;
        }

        let resolution = match result {
            Ok(text) if text.trim().is_empty() => {
                record.status = AssistStatus::Failed;
                AssistResolution::Failed(AssistError::EmptyResult)
            }
            Ok(text) if record.source_revision == current_revision => {
                record.status = AssistStatus::Applied;
                record.result_text = Some(text.clone());
                AssistResolution::Apply {
                    text,
                    merge: record.merge,
                }
            }
            Ok(text) => {
                record.status = AssistStatus::Discarded;
                record.result_text = Some(text);
                AssistResolution::Stale {
                    source_revision: record.source_revision,
                }
            }
            Err(error) => {
                record.status = AssistStatus::Failed;
                AssistResolution::Failed(error)
            }
        };

        let kind = record.kind;
        if self.pending.get(&kind) == Some(&request_id) {
            self.pending.remove(&kind);
        }
        self.prune();
        resolution
    }

    /// Cancel a pending request; its eventual response is ignored
    pub fn cancel(&mut self, request_id: RequestId) -> bool {
        let Some(record) = self.requests.get_mut(&request_id) else {
            return false;
        };
        if record.status != AssistStatus::Pending {
            return false;
        }
        record.status = AssistStatus::Cancelled;
        if self.pending.get(&record.kind) == Some(&request_id) {
            self.pending.remove(&record.kind);
        }
        true
    }

    /// A result that resolved as applicable could not be merged
    pub fn mark_failed(&mut self, request_id: RequestId) {
        if let Some(record) = self.requests.get_mut(&request_id) {
            record.status = AssistStatus::Failed;
        }
    }

    /// Cancel every pending request
    pub fn cancel_all(&mut self) -> Vec<RequestId> {
        let pending: Vec<RequestId> = self.pending.values().copied().collect();
        for id in &pending {
            self.cancel(*id);
        }
        pending
    }

    /// Look up a request
    #[inline]
    #[must_use]
    pub fn get(&self, request_id: RequestId) -> Option<&AssistRequest> {
        self.requests.get(&request_id)
    }

    /// Requests in dispatch order
    pub fn requests(&self) -> impl Iterator<Item = &AssistRequest> {
        self.requests.values()
    }

    /// Number of pending requests
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // Oldest finished records go first; pending ones are never dropped.
    fn prune(&mut self) {
        while self.requests.len() > self.history_limit {
            let Some(index) = self
                .requests
                .values()
                .position(|r| r.status.is_terminal())
            else {
                break;
            };
            self.requests.shift_remove_index(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_follow_templates() {
        assert_eq!(
            build_prompt(&AssistIntent::improve("hi")),
            "Improve this text: hi"
        );
        assert_eq!(
            build_prompt(&AssistIntent::summarize("hi")),
            "Summarize this text: hi"
        );
        assert_eq!(
            build_prompt(&AssistIntent::expand("hi")),
            "Expand this text: hi"
        );
        assert_eq!(
            build_prompt(&AssistIntent::custom("Translate to French", "hi")),
            "Translate to French\n\nhi"
        );
        assert_eq!(build_prompt(&AssistIntent::custom("Write a haiku", "")), "Write a haiku");
    }

    #[test]
    fn result_applies_at_same_revision() {
        let mut coordinator = AssistCoordinator::new(AssistPolicy::CancelPrevious, 8);
        let dispatch = coordinator.dispatch(&AssistIntent::improve("a"), 5).unwrap();

        let resolution = coordinator.resolve(dispatch.request_id, Ok("A".into()), 5);
        assert_eq!(
            resolution,
            AssistResolution::Apply {
                text: "A".into(),
                merge: MergeStrategy::Replace
            }
        );
        assert_eq!(
            coordinator.get(dispatch.request_id).unwrap().status,
            AssistStatus::Applied
        );
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[test]
    fn result_discarded_after_edit() {
        let mut coordinator = AssistCoordinator::new(AssistPolicy::CancelPrevious, 8);
        let dispatch = coordinator.dispatch(&AssistIntent::improve("a"), 5).unwrap();

        let resolution = coordinator.resolve(dispatch.request_id, Ok("A".into()), 6);
        assert_eq!(resolution, AssistResolution::Stale { source_revision: 5 });
        assert_eq!(
            coordinator.get(dispatch.request_id).unwrap().status,
            AssistStatus::Discarded
        );
    }

    #[test]
    fn cancel_previous_supersedes_same_kind_only() {
        let mut coordinator = AssistCoordinator::new(AssistPolicy::CancelPrevious, 8);
        let first = coordinator.dispatch(&AssistIntent::improve("a"), 1).unwrap();
        let other = coordinator.dispatch(&AssistIntent::summarize("a"), 1).unwrap();
        let second = coordinator.dispatch(&AssistIntent::improve("a"), 1).unwrap();

        assert_eq!(other.superseded, None);
        assert_eq!(second.superseded, Some(first.request_id));
        assert_eq!(
            coordinator.get(first.request_id).unwrap().status,
            AssistStatus::Cancelled
        );
        // late response of the cancelled request
        assert_eq!(
            coordinator.resolve(first.request_id, Ok("late".into()), 1),
            AssistResolution::Ignored
        );
        assert_eq!(coordinator.pending_count(), 2);
    }

    #[test]
    fn reject_new_refuses_second_request() {
        let mut coordinator = AssistCoordinator::new(AssistPolicy::RejectNew, 8);
        let first = coordinator.dispatch(&AssistIntent::expand("a"), 1).unwrap();
        let err = coordinator
            .dispatch(&AssistIntent::expand("b"), 1)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::AssistInFlight { kind: AssistKind::Expand, request } if request == first.request_id
        ));
    }

    #[test]
    fn unmerged_result_is_marked_failed() {
        let mut coordinator = AssistCoordinator::new(AssistPolicy::CancelPrevious, 8);
        let dispatch = coordinator.dispatch(&AssistIntent::improve("a"), 1).unwrap();
        assert!(matches!(
            coordinator.resolve(dispatch.request_id, Ok("A".into()), 1),
            AssistResolution::Apply { .. }
        ));

        coordinator.mark_failed(dispatch.request_id);
        assert_eq!(
            coordinator.get(dispatch.request_id).unwrap().status,
            AssistStatus::Failed
        );
    }

    #[test]
    fn empty_result_fails() {
        let mut coordinator = AssistCoordinator::new(AssistPolicy::CancelPrevious, 8);
        let dispatch = coordinator.dispatch(&AssistIntent::improve("a"), 1).unwrap();
        assert_eq!(
            coordinator.resolve(dispatch.request_id, Ok("  \n".into()), 1),
            AssistResolution::Failed(AssistError::EmptyResult)
        );
    }

    #[test]
    fn history_is_bounded() {
        let mut coordinator = AssistCoordinator::new(AssistPolicy::CancelPrevious, 3);
        for revision in 0..10 {
            let dispatch = coordinator
                .dispatch(&AssistIntent::improve("a"), revision)
                .unwrap();
            coordinator.resolve(dispatch.request_id, Ok("b".into()), revision);
        }
        assert_eq!(coordinator.requests().count(), 3);
        assert!(coordinator
            .requests()
            .all(|r| r.status == AssistStatus::Applied));
    }
}

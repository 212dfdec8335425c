//! Session journal
//!
//! A bounded, sequenced record of what happened in a session: edits, save
//! attempts, AI requests and uploads. Oldest events are dropped once the
//! configured history limit is reached. Events serialize flat with an
//! `event` tag for export.

use crate::error::ErrorKind;
use crate::types::{AssistKind, RequestId, Revision, TaskId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Edited,
    SaveStarted { ticket: u64, base_revision: Revision },
    /// Save requested while one is in flight; re-save queued
    SaveDeferred,
    SaveSucceeded { ticket: u64 },
    SaveFailed { ticket: u64, kind: ErrorKind, message: String },
    SaveRetryScheduled { attempt: u32, delay_ms: u64 },
    /// Automatic retry stopped; session is in `Error`
    SaveGaveUp { kind: ErrorKind },
    AssistDispatched { request: RequestId, kind: AssistKind },
    AssistApplied { request: RequestId },
    /// Result arrived after the buffer moved past `source_revision`
    AssistDiscarded { request: RequestId, source_revision: Revision },
    AssistFailed { request: RequestId, message: String },
    AssistCancelled { request: RequestId },
    UploadSubmitted { task: TaskId },
    UploadInserted { task: TaskId, url: String },
    UploadRejected { task: TaskId, reason: String },
    Closed { dirty: bool },
}

/// One journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEvent {
    /// Monotonic per session, starting at 1
    pub seq: u64,
    pub at: DateTime<Utc>,
    /// Buffer revision when the event was recorded
    pub revision: Revision,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Bounded in-order record of what happened in a session
#[derive(Debug, Clone)]
pub struct Journal {
    capacity: usize,
    next_seq: u64,
    events: VecDeque<SessionEvent>,
}

impl Journal {
    /// Create journal keeping at most `capacity` events
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            events: VecDeque::new(),
        }
    }

    /// Append an event; returns its sequence number
    pub fn record(&mut self, revision: Revision, kind: EventKind) -> u64 {
        self.next_seq += 1;
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(SessionEvent {
            seq: self.next_seq,
            at: Utc::now(),
            revision,
            kind,
        });
        self.next_seq
    }

    /// Retained events, oldest first
    #[must_use]
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_beyond_capacity() {
        let mut journal = Journal::new(2);
        journal.record(1, EventKind::Edited);
        journal.record(2, EventKind::Edited);
        let seq = journal.record(3, EventKind::SaveDeferred);

        assert_eq!(seq, 3);
        let events = journal.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].revision, 2);
        assert_eq!(events[1].kind, EventKind::SaveDeferred);
    }

    #[test]
    fn serializes_flat() {
        let mut journal = Journal::new(4);
        journal.record(7, EventKind::SaveStarted { ticket: 1, base_revision: 5 });
        let json = serde_json::to_value(&journal.events()[0]).unwrap();
        assert_eq!(json["event"], "save_started");
        assert_eq!(json["ticket"], 1);
        assert_eq!(json["revision"], 7);
    }
}

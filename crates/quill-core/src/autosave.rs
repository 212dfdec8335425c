//! Autosave planner
//!
//! Converts a stream of edits into a bounded rate of save calls:
//! - Debounces edits; only the newest timer generation may fire
//! - Keeps at most one save in flight and queues a re-save behind it
//! - Retries transient failures with exponential backoff, then gives up
//!
//! The planner performs no I/O. The session controller runs the timers and
//! network calls and reports back with the generation or ticket it was given.

use crate::config::SessionConfig;
use crate::error::{ErrorKind, PersistError};
use crate::types::{Revision, SaveState};
use std::time::Duration;

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
}

impl Backoff {
    /// Create a schedule starting at `base_ms`, doubling, capped at `max_ms`
    #[inline]
    #[must_use]
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }

    /// Delay before retry number `attempt` (1-based)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_ms);
        Duration::from_millis(delay)
    }
}

/// Identity of one save call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveTicket {
    pub id: u64,
    /// Session revision being saved
    pub revision: Revision,
    /// Revision the remote is expected to hold
    pub base_revision: Revision,
    /// 1 for the first try, incremented per consecutive failure
    pub attempt: u32,
}

/// Result of an explicit save request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTrigger {
    /// A save was issued now
    Started,
    /// A save is in flight; a re-save with the latest content follows it
    Queued,
    /// The in-flight save already carries the latest content
    InFlight,
    /// Nothing to save
    AlreadyClean,
}

/// What to do when a debounce timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceAction {
    StartSave,
    /// Save in flight; re-save queued behind it
    Deferred,
    Ignore,
}

/// What to do after a save call returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveFollowUp {
    /// Save succeeded; `resave` asks for an immediate follow-up save
    Saved { revision: Revision, resave: bool },
    /// Transient failure; retry after `delay` if `generation` is still current
    RetryAfter {
        error: PersistError,
        attempt: u32,
        delay: Duration,
        generation: u64,
    },
    /// Base revision conflict; re-snapshot and save again now
    RetryNow { error: PersistError },
    /// Fatal failure or retry budget exhausted
    GaveUp { error: PersistError },
}

/// Debounce and retry state machine for one session
#[derive(Debug, Clone)]
pub struct AutosavePlanner {
    debounce: Duration,
    max_retries: u32,
    backoff: Backoff,
    state: SaveState,
    in_flight: Option<SaveTicket>,
    pending_resave: bool,
    failures: u32,
    last_saved_revision: Revision,
    base_revision: Revision,
    debounce_generation: u64,
    retry_generation: u64,
    next_ticket: u64,
}

impl AutosavePlanner {
    /// Create a clean planner for content persisted at `persisted_revision`
    #[must_use]
    pub fn new(config: &SessionConfig, persisted_revision: Revision) -> Self {
        Self {
            debounce: config.debounce(),
            max_retries: config.max_retries,
            backoff: Backoff::new(config.backoff_base_ms, config.backoff_max_ms),
            state: SaveState::Clean,
            in_flight: None,
            pending_resave: false,
            failures: 0,
            last_saved_revision: persisted_revision,
            base_revision: persisted_revision,
            debounce_generation: 0,
            retry_generation: 0,
            next_ticket: 0,
        }
    }

    /// Record an edit and reset the debounce timer
    ///
    /// Returns the timer generation to arm, or `None` while in `Error`
    /// (automatic saving stays off until an explicit retry).
    pub fn schedule(&mut self, revision: Revision) -> Option<u64> {
        if self.state == SaveState::Error {
            tracing::debug!(revision, "edit recorded while save is in error; autosave paused");
            return None;
        }
        if self.state == SaveState::Clean {
            self.state = SaveState::Dirty;
        }
        self.debounce_generation += 1;
        tracing::trace!(revision, generation = self.debounce_generation, "debounce reset");
        Some(self.debounce_generation)
    }

    /// Record an edit without arming a timer (autosave disabled)
    pub fn mark_dirty(&mut self) {
        if self.state == SaveState::Clean {
            self.state = SaveState::Dirty;
        }
    }

    /// A debounce timer fired
    pub fn debounce_elapsed(
        &mut self,
        generation: u64,
        current: Revision,
        dirty: bool,
    ) -> DebounceAction {
        if generation != self.debounce_generation {
            return DebounceAction::Ignore;
        }
        match self.state {
            SaveState::Saving => {
                if self.in_flight.is_some_and(|t| t.revision < current) {
                    self.pending_resave = true;
                    DebounceAction::Deferred
                } else {
                    DebounceAction::Ignore
                }
            }
            SaveState::Retrying | SaveState::Error => DebounceAction::Ignore,
            SaveState::Clean | SaveState::Dirty => {
                if dirty {
                    DebounceAction::StartSave
                } else {
                    self.state = SaveState::Clean;
                    DebounceAction::Ignore
                }
            }
        }
    }

    /// Explicit save or retry requested by the user
    pub fn request_explicit(&mut self, current: Revision, dirty: bool) -> SaveTrigger {
        if let Some(ticket) = self.in_flight {
            if ticket.revision < current {
                self.pending_resave = true;
                return SaveTrigger::Queued;
            }
            return SaveTrigger::InFlight;
        }
        if !dirty {
            return SaveTrigger::AlreadyClean;
        }
        // pending debounce and retry timers become stale
        self.debounce_generation += 1;
        self.retry_generation += 1;
        if self.state == SaveState::Error {
            self.failures = 0;
        }
        SaveTrigger::Started
    }

    /// Issue a save of the snapshot at `revision`
    pub fn begin(&mut self, revision: Revision) -> SaveTicket {
        self.next_ticket += 1;
        let ticket = SaveTicket {
            id: self.next_ticket,
            revision,
            base_revision: self.base_revision,
            attempt: self.failures + 1,
        };
        self.in_flight = Some(ticket);
        self.pending_resave = false;
        self.state = SaveState::Saving;
        ticket
    }

    /// A save call returned; `None` if the ticket is not the one in flight
    pub fn complete(
        &mut self,
        ticket_id: u64,
        result: Result<(), PersistError>,
    ) -> Option<SaveFollowUp> {
        let ticket = self.in_flight.filter(|t| t.id == ticket_id)?;
        self.in_flight = None;

        let error = match result {
            Ok(()) => {
                self.failures = 0;
                self.last_saved_revision = self.last_saved_revision.max(ticket.revision);
                self.base_revision = ticket.revision;
                let resave = std::mem::take(&mut self.pending_resave);
                return Some(SaveFollowUp::Saved {
                    revision: ticket.revision,
                    resave,
                });
            }
            Err(error) => error,
        };

        self.failures += 1;
        if let PersistError::Conflict { remote_revision } = error {
            self.base_revision = remote_revision;
        }

        let recoverable = error.is_retryable() || error.kind() == ErrorKind::Conflict;
        if self.failures > self.max_retries || !recoverable {
            self.state = SaveState::Error;
            self.pending_resave = false;
            return Some(SaveFollowUp::GaveUp { error });
        }

        self.state = SaveState::Retrying;
        if error.kind() == ErrorKind::Conflict {
            return Some(SaveFollowUp::RetryNow { error });
        }

        self.retry_generation += 1;
        Some(SaveFollowUp::RetryAfter {
            error,
            attempt: self.failures,
            delay: self.backoff.delay(self.failures),
            generation: self.retry_generation,
        })
    }

    /// A backoff timer fired; true if the retry should run now
    pub fn retry_elapsed(&mut self, generation: u64) -> bool {
        generation == self.retry_generation
            && self.state == SaveState::Retrying
            && self.in_flight.is_none()
    }

    /// Settle after a save without follow-up
    pub fn settle(&mut self, dirty: bool) {
        let settled = matches!(
            self.state,
            SaveState::Saving | SaveState::Dirty | SaveState::Clean
        );
        if self.in_flight.is_none() && settled {
            self.state = if dirty {
                SaveState::Dirty
            } else {
                SaveState::Clean
            };
        }
    }

    /// Drop all in-flight and scheduled work (session closing)
    pub fn abandon(&mut self, dirty: bool) {
        self.in_flight = None;
        self.pending_resave = false;
        self.debounce_generation += 1;
        self.retry_generation += 1;
        if self.state != SaveState::Error {
            self.state = if dirty {
                SaveState::Dirty
            } else {
                SaveState::Clean
            };
        }
    }

    /// Current save state
    #[inline]
    #[must_use]
    pub fn state(&self) -> SaveState {
        self.state
    }

    /// Debounce window
    #[inline]
    #[must_use]
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Highest revision confirmed by persistence
    #[inline]
    #[must_use]
    pub fn last_saved_revision(&self) -> Revision {
        self.last_saved_revision
    }

    /// Revision the remote is believed to hold
    #[inline]
    #[must_use]
    pub fn base_revision(&self) -> Revision {
        self.base_revision
    }

    /// Save currently in flight
    #[inline]
    #[must_use]
    pub fn in_flight(&self) -> Option<SaveTicket> {
        self.in_flight
    }

    /// Consecutive failures in the current save cycle
    #[inline]
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> AutosavePlanner {
        AutosavePlanner::new(&SessionConfig::default().with_max_retries(2), 0)
    }

    #[test]
    fn only_latest_debounce_generation_fires() {
        let mut p = planner();
        let first = p.schedule(1).unwrap();
        let second = p.schedule(2).unwrap();
        assert_eq!(p.state(), SaveState::Dirty);

        assert_eq!(p.debounce_elapsed(first, 2, true), DebounceAction::Ignore);
        assert_eq!(p.debounce_elapsed(second, 2, true), DebounceAction::StartSave);
    }

    #[test]
    fn debounce_during_save_queues_resave() {
        let mut p = planner();
        let gen = p.schedule(1).unwrap();
        assert_eq!(p.debounce_elapsed(gen, 1, true), DebounceAction::StartSave);
        let ticket = p.begin(1);

        let gen = p.schedule(2).unwrap();
        assert_eq!(p.debounce_elapsed(gen, 2, true), DebounceAction::Deferred);

        let follow_up = p.complete(ticket.id, Ok(())).unwrap();
        assert_eq!(
            follow_up,
            SaveFollowUp::Saved {
                revision: 1,
                resave: true
            }
        );
        assert_eq!(p.last_saved_revision(), 1);
    }

    #[test]
    fn transient_failures_back_off_then_give_up() {
        let mut p = planner();
        let ticket = p.begin(1);
        let follow_up = p
            .complete(ticket.id, Err(PersistError::Transient("reset".into())))
            .unwrap();
        let SaveFollowUp::RetryAfter {
            attempt,
            delay,
            generation,
            ..
        } = follow_up
        else {
            panic!("expected retry, got {follow_up:?}");
        };
        assert_eq!(attempt, 1);
        assert_eq!(delay, Duration::from_secs(1));
        assert_eq!(p.state(), SaveState::Retrying);
        assert!(p.retry_elapsed(generation));

        let ticket = p.begin(1);
        assert_eq!(ticket.attempt, 2);
        let follow_up = p
            .complete(ticket.id, Err(PersistError::Timeout { timeout_ms: 10 }))
            .unwrap();
        assert!(matches!(
            follow_up,
            SaveFollowUp::RetryAfter { delay, .. } if delay == Duration::from_secs(2)
        ));

        let ticket = p.begin(1);
        let follow_up = p
            .complete(ticket.id, Err(PersistError::Transient("reset".into())))
            .unwrap();
        assert!(matches!(follow_up, SaveFollowUp::GaveUp { .. }));
        assert_eq!(p.state(), SaveState::Error);
    }

    #[test]
    fn error_state_pauses_autosave_until_explicit_retry() {
        let mut p = planner();
        let ticket = p.begin(1);
        p.complete(ticket.id, Err(PersistError::Fatal("quota".into())));
        assert_eq!(p.state(), SaveState::Error);

        assert_eq!(p.schedule(2), None);
        assert_eq!(p.request_explicit(2, true), SaveTrigger::Started);
        assert_eq!(p.failures(), 0);
        let ticket = p.begin(2);
        assert_eq!(ticket.attempt, 1);
        assert_eq!(p.state(), SaveState::Saving);
    }

    #[test]
    fn conflict_adopts_remote_base() {
        let mut p = planner();
        let ticket = p.begin(3);
        assert_eq!(ticket.base_revision, 0);
        let follow_up = p
            .complete(ticket.id, Err(PersistError::Conflict { remote_revision: 7 }))
            .unwrap();
        assert!(matches!(follow_up, SaveFollowUp::RetryNow { .. }));
        assert_eq!(p.begin(3).base_revision, 7);
    }

    #[test]
    fn stale_ticket_is_ignored() {
        let mut p = planner();
        let ticket = p.begin(1);
        assert!(p.complete(ticket.id + 1, Ok(())).is_none());
        assert!(p.complete(ticket.id, Ok(())).is_some());
        assert!(p.complete(ticket.id, Ok(())).is_none());
    }

    #[test]
    fn explicit_save_is_idempotent_when_clean() {
        let mut p = planner();
        assert_eq!(p.request_explicit(0, false), SaveTrigger::AlreadyClean);

        let ticket = p.begin(4);
        assert_eq!(p.request_explicit(4, true), SaveTrigger::InFlight);
        assert_eq!(p.request_explicit(5, true), SaveTrigger::Queued);
        assert_eq!(
            p.complete(ticket.id, Ok(())),
            Some(SaveFollowUp::Saved {
                revision: 4,
                resave: true
            })
        );
    }

    #[test]
    fn settle_reflects_buffer() {
        let mut p = planner();
        let ticket = p.begin(1);
        p.complete(ticket.id, Ok(()));
        p.settle(true);
        assert_eq!(p.state(), SaveState::Dirty);
        p.settle(false);
        assert_eq!(p.state(), SaveState::Clean);
    }

    #[test]
    fn abandon_drops_in_flight_and_timers() {
        let mut p = planner();
        let gen = p.schedule(1).unwrap();
        let ticket = p.begin(1);
        p.abandon(true);

        assert_eq!(p.state(), SaveState::Dirty);
        assert!(p.in_flight().is_none());
        assert!(p.complete(ticket.id, Ok(())).is_none());
        assert_eq!(p.debounce_elapsed(gen, 1, true), DebounceAction::Ignore);
    }
}

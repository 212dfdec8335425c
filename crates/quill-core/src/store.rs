//! Authoritative in-memory document buffer
//!
//! Every accepted mutation bumps the revision by exactly one. The store has
//! no side effects beyond its own state; persistence is driven elsewhere.

use crate::types::{ContentSnapshot, Revision};

/// Where an insertion lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    /// Character offset, clamped to the end of the buffer
    Offset(usize),
    /// End of the buffer
    End,
}

impl From<Option<usize>> for InsertPosition {
    fn from(anchor: Option<usize>) -> Self {
        anchor.map_or(Self::End, Self::Offset)
    }
}

/// Reasons an insertion is refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InsertionRejected {
    /// Nothing to insert
    #[error("insertion text is empty")]
    EmptyText,

    /// Caller claims a revision the store has not reached
    #[error("insertion targets revision {at} but store is at {current}")]
    FutureRevision { at: Revision, current: Revision },
}

/// Document buffer with a monotonically increasing revision
#[derive(Debug, Clone)]
pub struct ContentStore {
    content: String,
    revision: Revision,
    dirty: bool,
}

impl ContentStore {
    /// Create a clean store at a persisted revision
    #[must_use]
    pub fn new(content: impl Into<String>, revision: Revision) -> Self {
        Self {
            content: content.into(),
            revision,
            dirty: false,
        }
    }

    /// Replace the content; returns the new revision
    pub fn update(&mut self, new_content: impl Into<String>) -> Revision {
        self.content = new_content.into();
        self.bump()
    }

    /// Immutable copy of the current content and revision
    #[must_use]
    pub fn snapshot(&self) -> ContentSnapshot {
        ContentSnapshot {
            content: self.content.clone(),
            revision: self.revision,
        }
    }

    /// Insert `text` at `position` regardless of intervening edits
    ///
    /// Offsets are character offsets; an offset past the end lands at the
    /// end. `at_revision` is the revision the caller captured its position
    /// against; staleness policy belongs to the caller.
    ///
    /// # Errors
    /// - `InsertionRejected::EmptyText` if `text` is empty
    /// - `InsertionRejected::FutureRevision` if `at_revision` is ahead of the store
    pub fn merge_insertion(
        &mut self,
        text: &str,
        at_revision: Revision,
        position: InsertPosition,
    ) -> Result<Revision, InsertionRejected> {
        if text.is_empty() {
            return Err(InsertionRejected::EmptyText);
        }
        if at_revision > self.revision {
            return Err(InsertionRejected::FutureRevision {
                at: at_revision,
                current: self.revision,
            });
        }

        let byte_index = match position {
            InsertPosition::End => self.content.len(),
            InsertPosition::Offset(offset) => self
                .content
                .char_indices()
                .nth(offset)
                .map_or(self.content.len(), |(index, _)| index),
        };
        self.content.insert_str(byte_index, text);
        Ok(self.bump())
    }

    /// Record a successful save; clears `dirty` only if nothing changed since
    ///
    /// Returns whether the buffer is now clean.
    pub fn mark_persisted(&mut self, revision: Revision) -> bool {
        if revision == self.revision {
            self.dirty = false;
        }
        !self.dirty
    }

    /// Current revision
    #[inline]
    #[must_use]
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Current content
    #[inline]
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Whether the buffer has unsaved changes
    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn bump(&mut self) -> Revision {
        self.revision += 1;
        self.dirty = true;
        self.revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn update_bumps_revision_and_marks_dirty() {
        let mut store = ContentStore::new("hello", 4);
        assert!(!store.is_dirty());

        let rev = store.update("hello world");
        assert_eq!(rev, 5);
        assert!(store.is_dirty());
        assert_eq!(store.snapshot().content, "hello world");
    }

    #[test]
    fn insertion_uses_char_offsets() {
        let mut store = ContentStore::new("héllo", 0);
        let rev = store.merge_insertion("[x]", 0, InsertPosition::Offset(2)).unwrap();
        assert_eq!(rev, 1);
        assert_eq!(store.content(), "hé[x]llo");
    }

    #[test]
    fn insertion_past_end_clamps() {
        let mut store = ContentStore::new("abc", 0);
        store.merge_insertion("!", 0, InsertPosition::Offset(99)).unwrap();
        assert_eq!(store.content(), "abc!");

        store.merge_insertion("?", 1, InsertPosition::End).unwrap();
        assert_eq!(store.content(), "abc!?");
    }

    #[test]
    fn insertion_applies_across_intervening_edits() {
        let mut store = ContentStore::new("abc", 0);
        store.update("abcdef");
        let rev = store.merge_insertion("X", 0, InsertPosition::Offset(1)).unwrap();
        assert_eq!(rev, 2);
        assert_eq!(store.content(), "aXbcdef");
    }

    #[test]
    fn insertion_rejections() {
        let mut store = ContentStore::new("abc", 3);
        assert_eq!(
            store.merge_insertion("", 3, InsertPosition::End),
            Err(InsertionRejected::EmptyText)
        );
        assert_eq!(
            store.merge_insertion("x", 9, InsertPosition::End),
            Err(InsertionRejected::FutureRevision { at: 9, current: 3 })
        );
        assert_eq!(store.revision(), 3);
        assert!(!store.is_dirty());
    }

    #[test]
    fn mark_persisted_ignores_older_revision() {
        let mut store = ContentStore::new("", 0);
        store.update("a");
        store.update("ab");
        assert!(!store.mark_persisted(1));
        assert!(store.is_dirty());
        assert!(store.mark_persisted(2));
        assert!(!store.is_dirty());
    }

    proptest! {
        #[test]
        fn revisions_strictly_increase(ops in proptest::collection::vec((any::<bool>(), "[a-z]{1,4}", 0usize..20), 1..40)) {
            let mut store = ContentStore::new("", 0);
            let mut last = store.revision();
            for (replace, text, offset) in ops {
                let rev = if replace {
                    store.update(text)
                } else {
                    store
                        .merge_insertion(&text, last, InsertPosition::Offset(offset))
                        .unwrap()
                };
                prop_assert_eq!(rev, last + 1);
                last = rev;
            }
        }
    }
}

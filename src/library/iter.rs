//! Iteration that tolerates concurrent mutation.

use std::fmt;
use std::sync::Arc;

use super::Library;
use crate::storage::{EntryRef, SlotIndex};

/// Membership source a [`PausableIter`] walks.
pub(crate) trait MemberSet: Send + Sync {
    /// Smallest member `>= from`, looked up under a short read lock.
    fn next_member(&self, from: SlotIndex) -> Option<SlotIndex>;
}

/// Iterator that never holds a lock between steps.
///
/// The slot range and the library revision are fixed when the iterator is
/// created. Each step takes the relevant read locks just long enough to find
/// the next live entry. Slots removed in the meantime are skipped, and the
/// iterator ends for good once the library moves to another revision.
pub struct PausableIter {
    library: Library,
    members: Option<Arc<dyn MemberSet>>,
    cursor: u32,
    max: u32,
    revision: u64,
    done: bool,
}

enum Step {
    Live(EntryRef),
    Missing,
    Stale,
}

impl PausableIter {
    pub(crate) fn new(
        library: Library,
        members: Option<Arc<dyn MemberSet>>,
        min: Option<SlotIndex>,
        max: Option<SlotIndex>,
        revision: u64,
    ) -> Self {
        let (cursor, max, done) = match (min, max) {
            (Some(min), Some(max)) => (min.as_u32(), max.as_u32(), false),
            _ => (0, 0, true),
        };
        Self {
            library,
            members,
            cursor,
            max,
            revision,
            done,
        }
    }

    /// Revision the iterator is bound to.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl Iterator for PausableIter {
    type Item = EntryRef;

    fn next(&mut self) -> Option<EntryRef> {
        while !self.done && self.cursor <= self.max {
            let candidate = match &self.members {
                Some(members) => match members.next_member(SlotIndex::from_u32(self.cursor)) {
                    Some(index) => index.as_u32(),
                    None => break,
                },
                None => self.cursor,
            };
            if candidate > self.max {
                break;
            }
            self.cursor = candidate + 1;
            match self.library.step(SlotIndex::from_u32(candidate), self.revision) {
                Step::Live(entry) => return Some(entry),
                Step::Missing => continue,
                Step::Stale => {
                    log::debug!("iteration stopped: revision {} superseded", self.revision);
                    break;
                }
            }
        }
        self.done = true;
        None
    }
}

impl fmt::Debug for PausableIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PausableIter")
            .field("cursor", &self.cursor)
            .field("max", &self.max)
            .field("revision", &self.revision)
            .field("done", &self.done)
            .finish()
    }
}

impl Library {
    fn step(&self, index: SlotIndex, revision: u64) -> Step {
        let state = self.shared.state.read();
        // Rescans bump the revision under the write lock.
        if self.shared.revisions.current_revision() != revision {
            return Step::Stale;
        }
        match state.slots.get(index) {
            Some(entry) => Step::Live(Arc::clone(entry)),
            None => Step::Missing,
        }
    }
}

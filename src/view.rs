//! Read-only projections of the library.

use std::path::Path;

use crate::library::{Library, PausableIter};
use crate::storage::{EntryRef, IndexSet, SlotIndex};

/// A subset of the library, defined by a set of slot numbers.
///
/// Membership is resolved against the library: an index whose slot has been
/// vacated is not contained, even if the view has not caught up yet.
///
/// Lock order is view before library. Implementations never hold their own
/// lock while delivering events.
pub trait FileView: Send + Sync {
    fn library(&self) -> &Library;

    fn contains_index(&self, index: SlotIndex) -> bool;

    fn contains_path(&self, path: &Path) -> bool {
        self.library()
            .get_by_path(path)
            .is_some_and(|entry| self.contains_index(entry.index()))
    }

    /// Number of member slots. May briefly count slots the library already
    /// vacated.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the member slots.
    fn index_set(&self) -> IndexSet;

    /// Live member entries, collected while the view's read lock is held.
    fn entries(&self) -> Vec<EntryRef>;

    /// Lock-free iteration; see [`PausableIter`].
    fn pausable_iter(&self) -> PausableIter;
}

//! Compact ordered set of slot indices.
//!
//! Members are stored as sorted, non-adjacent inclusive spans. Libraries admit
//! files in runs, so a view over thousands of consecutive slots usually costs
//! a handful of spans. Backed by `ThinVec` so an empty set is one pointer.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thin_vec::ThinVec;

use super::index_types::SlotIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Span {
    start: u32,
    end: u32,
}

/// Ordered set of [`SlotIndex`] values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSet {
    spans: ThinVec<Span>,
    len: usize,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finds the span holding `value`, or the position a new span would go.
    fn locate(&self, value: u32) -> Result<usize, usize> {
        self.spans.binary_search_by(|span| {
            if span.end < value {
                Ordering::Less
            } else if span.start > value {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        })
    }

    pub fn contains(&self, index: SlotIndex) -> bool {
        self.locate(index.as_u32()).is_ok()
    }

    /// Adds `index`, returning true if it was not already a member.
    pub fn insert(&mut self, index: SlotIndex) -> bool {
        let value = index.as_u32();
        let pos = match self.locate(value) {
            Ok(_) => return false,
            Err(pos) => pos,
        };

        // SlotIndex never holds u32::MAX, so value + 1 cannot overflow.
        let joins_prev = pos > 0 && self.spans[pos - 1].end + 1 == value;
        let joins_next = pos < self.spans.len() && self.spans[pos].start == value + 1;
        match (joins_prev, joins_next) {
            (true, true) => {
                let next_end = self.spans[pos].end;
                self.spans[pos - 1].end = next_end;
                self.spans.remove(pos);
            }
            (true, false) => self.spans[pos - 1].end = value,
            (false, true) => self.spans[pos].start = value,
            (false, false) => self.spans.insert(
                pos,
                Span {
                    start: value,
                    end: value,
                },
            ),
        }
        self.len += 1;
        true
    }

    /// Removes `index`, returning true if it was a member.
    pub fn remove(&mut self, index: SlotIndex) -> bool {
        let value = index.as_u32();
        let Ok(pos) = self.locate(value) else {
            return false;
        };

        let span = self.spans[pos];
        if span.start == span.end {
            self.spans.remove(pos);
        } else if value == span.start {
            self.spans[pos].start = value + 1;
        } else if value == span.end {
            self.spans[pos].end = value - 1;
        } else {
            self.spans[pos].end = value - 1;
            self.spans.insert(
                pos + 1,
                Span {
                    start: value + 1,
                    end: span.end,
                },
            );
        }
        self.len -= 1;
        true
    }

    pub fn clear(&mut self) {
        self.spans.clear();
        self.len = 0;
    }

    pub fn min(&self) -> Option<SlotIndex> {
        self.spans.first().map(|span| SlotIndex::from_u32(span.start))
    }

    pub fn max(&self) -> Option<SlotIndex> {
        self.spans.last().map(|span| SlotIndex::from_u32(span.end))
    }

    /// Smallest member that is `>= index`.
    pub fn next_at_or_after(&self, index: SlotIndex) -> Option<SlotIndex> {
        match self.locate(index.as_u32()) {
            Ok(_) => Some(index),
            Err(pos) => self
                .spans
                .get(pos)
                .map(|span| SlotIndex::from_u32(span.start)),
        }
    }

    /// Iterates members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = SlotIndex> + '_ {
        self.spans
            .iter()
            .flat_map(|span| (span.start..=span.end).map(SlotIndex::from_u32))
    }

    /// Adds every member of `other`, returning the indices that were new.
    pub fn union_with(&mut self, other: &IndexSet) -> IndexSet {
        let mut added = IndexSet::new();
        for index in other.iter() {
            if self.insert(index) {
                added.insert(index);
            }
        }
        added
    }

    /// Members of `self` that are not in `other`.
    pub fn difference(&self, other: &IndexSet) -> IndexSet {
        self.iter().filter(|index| !other.contains(*index)).collect()
    }

    /// Removes every member of `other`.
    pub fn remove_all(&mut self, other: &IndexSet) {
        for index in other.iter() {
            self.remove(index);
        }
    }
}

impl FromIterator<SlotIndex> for IndexSet {
    fn from_iter<I: IntoIterator<Item = SlotIndex>>(iter: I) -> Self {
        let mut set = IndexSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<SlotIndex> for IndexSet {
    fn extend<I: IntoIterator<Item = SlotIndex>>(&mut self, iter: I) {
        for index in iter {
            self.insert(index);
        }
    }
}

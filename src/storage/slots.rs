//! Append-only slot arena.
//!
//! Unlike a slab with a freelist, a vacated slot is never handed out again:
//! index `i` either holds the value created for it or is empty forever. Views
//! keep plain slot numbers, so reuse would silently point them at another file.

use std::ops::Index;

use super::index_types::SlotIndex;

/// Arena of optional values addressed by [`SlotIndex`].
#[derive(Debug)]
pub struct Slots<T> {
    entries: Vec<Option<T>>,
    /// Logical element count (occupied slots only).
    len: usize,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slots<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            len: 0,
        }
    }

    /// The index the next [`Slots::push`] will use.
    #[inline]
    pub fn next_index(&self) -> SlotIndex {
        SlotIndex::new(self.entries.len())
    }

    /// Appends a value, returning its index.
    pub fn push(&mut self, value: T) -> SlotIndex {
        let index = self.next_index();
        self.entries.push(Some(value));
        self.len += 1;
        index
    }

    pub fn get(&self, index: SlotIndex) -> Option<&T> {
        self.entries.get(index.get()).and_then(Option::as_ref)
    }

    /// Empties the slot at `index`, returning its value if present.
    pub fn take(&mut self, index: SlotIndex) -> Option<T> {
        let value = self.entries.get_mut(index.get())?.take();
        if value.is_some() {
            self.len -= 1;
        }
        value
    }

    /// Empties every slot without rewinding the allocation cursor.
    pub fn vacate_all(&mut self) {
        for slot in &mut self.entries {
            *slot = None;
        }
        self.len = 0;
    }

    /// Returns the number of occupied slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever allocated, occupied or not.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.entries.len()
    }

    /// Iterates occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotIndex, &T)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|value| (SlotIndex::new(idx), value)))
    }
}

impl<T> Index<SlotIndex> for Slots<T> {
    type Output = T;

    fn index(&self, index: SlotIndex) -> &Self::Output {
        self.get(index).expect("invalid slot index")
    }
}

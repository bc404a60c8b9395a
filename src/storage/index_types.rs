//! Slot numbers handed out by the library.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of an entry in the library's slot array.
///
/// Slots are append-only: once a number has been handed out it never names
/// a different file, which is what lets views hold entries by number.
/// `u32::MAX` is never a valid slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(transparent)]
pub struct SlotIndex(u32);

impl SlotIndex {
    /// # Panics
    /// Panics if `index >= u32::MAX`.
    #[inline]
    pub fn new(index: usize) -> Self {
        assert!(
            index < u32::MAX as usize,
            "slot index must be less than u32::MAX"
        );
        Self(index as u32)
    }

    #[inline]
    pub(crate) const fn from_u32(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn as_u32(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for SlotIndex {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value == u32::MAX {
            return Err("slot index cannot be u32::MAX".to_string());
        }
        Ok(Self(value))
    }
}

impl From<SlotIndex> for u32 {
    fn from(index: SlotIndex) -> Self {
        index.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

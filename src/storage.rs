//! Storage layer for the library.
//!
//! This module provides the low-level data primitives:
//! - Append-only slot arena addressed by compact indices
//! - Range-compressed index sets used by every view
//! - The per-file entry record

mod entry;
mod index_set;
mod index_types;
mod slots;

pub use entry::{Entry, EntryRef};
pub(crate) use entry::FileFacts;
pub use index_set::IndexSet;
pub use index_types::SlotIndex;
pub use slots::Slots;

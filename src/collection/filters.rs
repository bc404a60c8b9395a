//! Membership filters for collections.

use std::sync::Arc;

use crate::storage::Entry;

/// Decides whether an entry may join a collection.
pub type EntryFilter = Arc<dyn Fn(&Entry) -> bool + Send + Sync>;

/// Accepts every entry.
pub fn any() -> EntryFilter {
    Arc::new(|_| true)
}

/// Finished files that are not store purchases.
pub fn shareable() -> EntryFilter {
    Arc::new(|entry| !entry.is_incomplete() && !entry.is_store_purchase())
}

/// Placeholders for downloads in progress.
pub fn incomplete_only() -> EntryFilter {
    Arc::new(|entry| entry.is_incomplete())
}

//! Concurrent registry of shared files.
//!
//! This crate provides:
//! - A library of content-hashed file entries in an append-only slot arena
//! - Asynchronous admission guarded by a rescan revision
//! - Collections with persisted membership that follow the library
//! - Union views over collections, one per peer via the view manager

pub mod cancel;
pub mod collection;
pub mod config;
pub mod error;
pub mod events;
pub mod library;
pub mod manager;
pub mod services;
pub mod storage;
pub mod types;
pub mod union;
pub mod view;

#[cfg(test)]
mod testing;

// Re-export main types
pub use cancel::{RevisionToken, RevisionTracker};
pub use collection::{Collection, CollectionBuilder, CollectionId, EntryFilter};
pub use config::LibraryConfig;
pub use error::{AdmissionError, FailureReason, LibraryError, Result};
pub use events::{EventBus, LibraryEvent, ListenerId, ViewEvent};
pub use library::{AdmissionHandle, AdmissionResult, Library, LibraryBuilder, PausableIter};
pub use manager::ViewManager;
pub use services::{
    HashService, ManagedStore, MembershipStore, MemoryManagedStore, MemoryMembershipStore,
    PermissiveValidator, Validator,
};
pub use storage::{Entry, EntryRef, IndexSet, SlotIndex};
pub use types::{ContentHash, EntryFlags, EntryMetadata, HashKind, LibraryStatus, PeerId};
pub use union::UnionView;
pub use view::FileView;

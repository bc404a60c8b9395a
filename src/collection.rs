//! Mutable views: named sets of library entries with persisted membership.
//!
//! A collection follows the library through its event bus. Files the
//! membership store says belong here are picked up as soon as the library
//! admits them, dropped when the library removes them, and carried across
//! renames. Every accepted change is written to the store before the
//! collection's own event goes out.

pub mod filters;

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Weak};

use ignore::WalkBuilder;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

pub use filters::EntryFilter;

use crate::config::Manageability;
use crate::error::{canonicalize_existing_path, AdmissionError, FailureReason};
use crate::events::{EventBus, LibraryEvent, ListenerId, ViewEvent};
use crate::library::{AdmissionHandle, AdmissionResult, Library, MemberSet, PausableIter};
use crate::services::{warn_on_store_error, MembershipStore, MemoryMembershipStore};
use crate::storage::{EntryRef, IndexSet, SlotIndex};
use crate::types::PeerId;
use crate::view::FileView;

/// Identity of a collection within its library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId(u64);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collection-{}", self.0)
    }
}

/// Cloneable handle to a collection.
#[derive(Clone)]
pub struct Collection {
    shared: Arc<CollectionShared>,
}

struct CollectionShared {
    id: CollectionId,
    name: String,
    library: Library,
    filter: EntryFilter,
    store: Arc<dyn MembershipStore>,
    members: RwLock<IndexSet>,
    peers: RwLock<BTreeSet<PeerId>>,
    events: EventBus<ViewEvent>,
    library_listener: Mutex<Option<ListenerId>>,
}

impl Drop for CollectionShared {
    fn drop(&mut self) {
        if let Some(id) = self.library_listener.get_mut().take() {
            self.library.remove_listener(id);
        }
    }
}

impl MemberSet for CollectionShared {
    fn next_member(&self, from: SlotIndex) -> Option<SlotIndex> {
        self.members.read().next_at_or_after(from)
    }
}

/// Builder for [`Collection`].
pub struct CollectionBuilder {
    library: Library,
    name: String,
    filter: EntryFilter,
    store: Option<Arc<dyn MembershipStore>>,
}

impl CollectionBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn filter(mut self, filter: EntryFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn store(mut self, store: Arc<dyn MembershipStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Collection {
        let capacity = self.library.config().event_capacity;
        let id = CollectionId(self.library.allocate_view_id());
        let shared = Arc::new(CollectionShared {
            id,
            name: self.name,
            library: self.library,
            filter: self.filter,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryMembershipStore::new())),
            members: RwLock::new(IndexSet::new()),
            peers: RwLock::new(BTreeSet::new()),
            events: EventBus::new(capacity),
            library_listener: Mutex::new(None),
        });

        let weak: Weak<CollectionShared> = Arc::downgrade(&shared);
        let listener = shared.library.add_listener(move |event| {
            if let Some(shared) = weak.upgrade() {
                Collection { shared }.on_library_event(event);
            }
        });
        *shared.library_listener.lock() = Some(listener);
        log::debug!("created {} ({})", id, shared.name);
        Collection { shared }
    }
}

impl Collection {
    pub fn builder(library: &Library) -> CollectionBuilder {
        CollectionBuilder {
            library: library.clone(),
            name: String::new(),
            filter: filters::shareable(),
            store: None,
        }
    }

    pub fn id(&self) -> CollectionId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Adds a live library entry. Returns true if it became a member.
    pub fn add(&self, entry: &EntryRef) -> bool {
        let shared = &self.shared;
        if !(shared.filter)(entry) {
            log::debug!("{} refused {}", shared.id, entry.path().display());
            return false;
        }
        {
            let mut members = shared.members.write();
            // Checked under our lock so a concurrent library removal is
            // either seen here or delivered after we release.
            let live = shared
                .library
                .get_by_index(entry.index())
                .is_some_and(|current| Arc::ptr_eq(&current, entry));
            if !live || !members.insert(entry.index()) {
                return false;
            }
            entry.increment_share_count();
            warn_on_store_error(
                shared.store.record_membership(entry.path(), true),
                "record membership of",
                entry.path(),
            );
            shared.events.enqueue(ViewEvent::Added(Arc::clone(entry)));
        }
        shared.events.flush();
        true
    }

    /// Adds the file at `path`, admitting it to the library first if needed.
    ///
    /// Membership is persisted before hashing starts, so the collection picks
    /// the file up even if the handle is dropped or the library is rescanned
    /// meanwhile. Resolves with `CantAddToCollection` if the filter refuses
    /// the admitted entry.
    pub fn add_path(&self, path: impl AsRef<Path>) -> AdmissionHandle {
        let path = path.as_ref();
        if let Some(entry) = self.shared.library.get_by_path(path) {
            let key = entry.path().to_path_buf();
            let result = self.settle(&key, Ok(entry));
            return AdmissionHandle::ready(key, result);
        }
        let key = canonicalize_existing_path(path);
        warn_on_store_error(
            self.shared.store.record_membership(&key, true),
            "record membership of",
            &key,
        );
        let collection = self.clone();
        self.shared
            .library
            .admit(path)
            .map_result(move |result| collection.settle(&key, result))
    }

    fn settle(&self, path: &Path, result: AdmissionResult) -> AdmissionResult {
        match result {
            Ok(entry) | Err(AdmissionError::AlreadyManaged(entry)) => {
                if self.has_member(entry.index()) || self.add(&entry) {
                    Ok(entry)
                } else {
                    self.forget_membership(path);
                    Err(AdmissionError::CantAddToCollection(path.to_path_buf()))
                }
            }
            Err(error) => Err(error),
        }
    }

    /// Adds every manageable file directly inside `dir`.
    pub fn add_folder(&self, dir: impl AsRef<Path>) -> Vec<AdmissionHandle> {
        let config = self.shared.library.config().clone();
        let walker = WalkBuilder::new(dir.as_ref())
            .max_depth(Some(1))
            .hidden(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .parents(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();
        walker
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
            .filter(|entry| {
                let metadata = fs::metadata(entry.path()).ok();
                config.manageability(entry.path(), metadata.as_ref()) == Manageability::Manageable
            })
            .filter(|entry| !self.contains_path(entry.path()))
            .map(|entry| self.add_path(entry.path()))
            .collect()
    }

    /// Removes a member. Returns false if it was not one.
    pub fn remove(&self, entry: &EntryRef) -> bool {
        let shared = &self.shared;
        {
            let mut members = shared.members.write();
            if !members.remove(entry.index()) {
                return false;
            }
            entry.decrement_share_count();
            warn_on_store_error(
                shared.store.record_membership(entry.path(), false),
                "record membership of",
                entry.path(),
            );
            shared.events.enqueue(ViewEvent::Removed(Arc::clone(entry)));
        }
        shared.events.flush();
        true
    }

    /// Removes the file at `path`. A persisted membership for a file the
    /// library does not hold is dropped too.
    pub fn remove_path(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match self.shared.library.get_by_path(path) {
            Some(entry) => self.remove(&entry),
            None => {
                self.forget_membership(&canonicalize_existing_path(path));
                false
            }
        }
    }

    /// Drops every member. Emits `Cleared` only if something was removed.
    pub fn clear(&self) -> usize {
        self.release_all(true)
    }

    /// Live members located directly in `dir`.
    pub fn files_in_directory(&self, dir: impl AsRef<Path>) -> Vec<EntryRef> {
        let dir = canonicalize_existing_path(dir.as_ref());
        self.entries()
            .into_iter()
            .filter(|entry| entry.path().parent() == Some(dir.as_path()))
            .collect()
    }

    pub fn share_with(&self, peer: PeerId) -> bool {
        let added = {
            let mut peers = self.shared.peers.write();
            let added = peers.insert(peer.clone());
            if added {
                self.shared.events.enqueue(ViewEvent::PeerAdded(peer));
            }
            added
        };
        self.shared.events.flush();
        added
    }

    pub fn unshare_with(&self, peer: &PeerId) -> bool {
        let removed = {
            let mut peers = self.shared.peers.write();
            let removed = peers.remove(peer);
            if removed {
                self.shared
                    .events
                    .enqueue(ViewEvent::PeerRemoved(peer.clone()));
            }
            removed
        };
        self.shared.events.flush();
        removed
    }

    pub fn is_shared_with(&self, peer: &PeerId) -> bool {
        self.shared.peers.read().contains(peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.peers.read().iter().cloned().collect()
    }

    /// Stops following the library and empties the collection without
    /// touching persisted membership.
    pub fn dispose(&self) {
        if let Some(id) = self.shared.library_listener.lock().take() {
            self.shared.library.remove_listener(id);
        }
        self.release_all(false);
        log::debug!("disposed {}", self.shared.id);
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ViewEvent) + Send + Sync + 'static,
    {
        self.shared.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.events.remove_listener(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.shared.events.subscribe()
    }

    /// Raw membership, without checking the slot is still live.
    pub(crate) fn has_member(&self, index: SlotIndex) -> bool {
        self.shared.members.read().contains(index)
    }

    fn forget_membership(&self, path: &Path) {
        if self.shared.store.is_member(path) {
            warn_on_store_error(
                self.shared.store.record_membership(path, false),
                "drop membership of",
                path,
            );
        }
    }

    /// Empties the member set. With `persist`, members still live in the
    /// library also lose their stored membership.
    fn release_all(&self, persist: bool) -> usize {
        let shared = &self.shared;
        let released = {
            let mut members = shared.members.write();
            let released = std::mem::take(&mut *members);
            for entry in shared.library.entries_for(released.iter()) {
                entry.decrement_share_count();
                if persist {
                    warn_on_store_error(
                        shared.store.record_membership(entry.path(), false),
                        "record membership of",
                        entry.path(),
                    );
                }
            }
            if !released.is_empty() {
                shared.events.enqueue(ViewEvent::Cleared);
            }
            released.len()
        };
        shared.events.flush();
        released
    }

    /// Rename or content change: the new slot replaces the old one.
    fn swap(&self, old: &EntryRef, new: &EntryRef) {
        let shared = &self.shared;
        let was_member = {
            let mut members = shared.members.write();
            let was_member = members.remove(old.index());
            if was_member {
                old.decrement_share_count();
                warn_on_store_error(
                    shared.store.record_membership(old.path(), false),
                    "record membership of",
                    old.path(),
                );
                if (shared.filter)(new) && members.insert(new.index()) {
                    new.increment_share_count();
                    warn_on_store_error(
                        shared.store.record_membership(new.path(), true),
                        "record membership of",
                        new.path(),
                    );
                    shared.events.enqueue(ViewEvent::Changed {
                        old: Arc::clone(old),
                        new: Arc::clone(new),
                    });
                } else {
                    shared.events.enqueue(ViewEvent::Removed(Arc::clone(old)));
                }
            }
            was_member
        };
        shared.events.flush();
        if !was_member && shared.store.is_member(new.path()) {
            self.add(new);
        }
    }

    fn on_add_failed(&self, path: &Path, reason: FailureReason, existing: Option<&EntryRef>) {
        if !self.shared.store.is_member(path) {
            return;
        }
        match (reason, existing) {
            // Superseded work is retried by the rescan that superseded it.
            (FailureReason::RevisionChanged, _) => {}
            (FailureReason::AlreadyManaged, Some(entry)) => {
                if !self.add(entry) && !self.has_member(entry.index()) {
                    self.forget_membership(path);
                }
            }
            _ => {
                log::debug!("{} rolling back membership of {}", self.shared.id, path.display());
                self.forget_membership(path);
            }
        }
    }

    fn on_library_event(&self, event: &LibraryEvent) {
        match event {
            LibraryEvent::Added(entry) => {
                if self.shared.store.is_member(entry.path())
                    && !self.add(entry)
                    && !self.has_member(entry.index())
                {
                    self.forget_membership(entry.path());
                }
            }
            LibraryEvent::Changed { old, new } => self.swap(old, new),
            LibraryEvent::Removed(entry) => {
                self.remove(entry);
            }
            LibraryEvent::Cleared => {
                self.release_all(false);
            }
            LibraryEvent::AddFailed {
                path,
                reason,
                existing,
            } => self.on_add_failed(path, *reason, existing.as_ref()),
            LibraryEvent::ChangeFailed { .. }
            | LibraryEvent::LoadStarted { .. }
            | LibraryEvent::LoadFinishing { .. }
            | LibraryEvent::LoadComplete { .. }
            | LibraryEvent::Saved => {}
        }
    }
}

impl FileView for Collection {
    fn library(&self) -> &Library {
        &self.shared.library
    }

    fn contains_index(&self, index: SlotIndex) -> bool {
        self.has_member(index) && self.shared.library.contains_index(index)
    }

    fn len(&self) -> usize {
        self.shared.members.read().len()
    }

    fn index_set(&self) -> IndexSet {
        self.shared.members.read().clone()
    }

    fn entries(&self) -> Vec<EntryRef> {
        let members = self.shared.members.read();
        self.shared.library.entries_for(members.iter())
    }

    fn pausable_iter(&self) -> PausableIter {
        let (min, max) = {
            let members = self.shared.members.read();
            (members.min(), members.max())
        };
        let members: Arc<dyn MemberSet> = Arc::clone(&self.shared) as Arc<dyn MemberSet>;
        PausableIter::new(
            self.shared.library.clone(),
            Some(members),
            min,
            max,
            self.shared.library.revision(),
        )
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("members", &self.shared.members.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{HashService, ManagedStore, MemoryManagedStore, Validator};
    use crate::testing::{touch, BlockList, EventLog, ScriptedHasher};
    use crate::types::EntryMetadata;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        hasher: Arc<ScriptedHasher>,
        library: Library,
        members: Arc<MemoryMembershipStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_hasher(ScriptedHasher::new())
        }

        fn with_hasher(hasher: ScriptedHasher) -> Self {
            let hasher = Arc::new(hasher);
            let library = Library::builder(Arc::clone(&hasher) as Arc<dyn HashService>)
                .store(Arc::new(MemoryManagedStore::new()) as Arc<dyn ManagedStore>)
                .build()
                .expect("library");
            Self {
                dir: TempDir::new().expect("tempdir"),
                hasher,
                library,
                members: Arc::new(MemoryMembershipStore::new()),
            }
        }

        fn collection(&self, filter: EntryFilter) -> Collection {
            Collection::builder(&self.library)
                .name("shared")
                .filter(filter)
                .store(Arc::clone(&self.members) as Arc<dyn MembershipStore>)
                .build()
        }

        fn file(&self, name: &str) -> PathBuf {
            touch(&self.dir, name, name.as_bytes())
        }
    }

    #[tokio::test]
    async fn add_path_admits_and_persists_membership() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::shareable());
        let log = EventLog::watch_collection(&collection);
        let path = fx.file("a.txt");

        let entry = collection.add_path(&path).await.expect("add");
        assert!(collection.contains_path(&path));
        assert!(fx.library.contains_path(&path));
        assert!(fx.members.is_member(&path));
        assert_eq!(entry.share_count(), 1);
        assert_eq!(log.added(), vec![entry.index()]);

        let again = collection.add_path(&path).await.expect("add again");
        assert!(Arc::ptr_eq(&again, &entry));
        assert_eq!(log.added().len(), 1);
    }

    #[tokio::test]
    async fn dangerous_file_never_joins() {
        let dir = TempDir::new().expect("tempdir");
        let path = touch(&dir, "virus.zip", b"x");
        let validator = Arc::new(BlockList::default());
        validator.block_path(&path);
        let library = Library::builder(Arc::new(ScriptedHasher::new()))
            .validator(validator as Arc<dyn Validator>)
            .build()
            .expect("library");
        let members = Arc::new(MemoryMembershipStore::new());
        let collection = Collection::builder(&library)
            .store(Arc::clone(&members) as Arc<dyn MembershipStore>)
            .build();
        let log = EventLog::watch_collection(&collection);

        let result = collection.add_path(&path).await;
        assert!(matches!(result, Err(AdmissionError::DangerousFile(_))));
        assert!(log.events().is_empty());
        assert!(!collection.contains_path(&path));
        assert!(!members.is_member(&path));
    }

    #[tokio::test]
    async fn refused_entry_rolls_back_membership() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::incomplete_only());
        let path = fx.file("a.txt");

        let result = collection.add_path(&path).await;
        assert!(matches!(result, Err(AdmissionError::CantAddToCollection(_))));
        assert!(fx.library.contains_path(&path));
        assert!(collection.is_empty());
        assert!(!fx.members.is_member(&path));
    }

    #[tokio::test]
    async fn store_purchases_are_not_shareable() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::shareable());
        let metadata = EntryMetadata::with_flags(crate::types::EntryFlags::STORE_PURCHASE);
        let bought = fx
            .library
            .admit_with(fx.file("song.mp3"), metadata)
            .await
            .expect("admit");

        assert!(!collection.add(&bought));
        assert_eq!(bought.share_count(), 0);
    }

    #[tokio::test]
    async fn add_and_remove_entries_directly() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::any());
        let log = EventLog::watch_collection(&collection);
        let entry = fx.library.admit(fx.file("a.txt")).await.expect("admit");

        assert!(collection.add(&entry));
        assert!(!collection.add(&entry));
        assert!(collection.remove(&entry));
        assert!(!collection.remove(&entry));
        assert_eq!(entry.share_count(), 0);
        assert!(!fx.members.is_member(entry.path()));

        fx.library.remove_index(entry.index());
        assert!(!collection.add(&entry), "stale entries cannot join");
        assert_eq!(log.added(), vec![entry.index()]);
        assert_eq!(log.removed(), vec![entry.index()]);
    }

    #[tokio::test]
    async fn library_removal_drops_member() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::shareable());
        let log = EventLog::watch_collection(&collection);
        let entry = collection.add_path(fx.file("a.txt")).await.expect("add");

        assert!(fx.library.remove_path(entry.path()));
        assert!(collection.is_empty());
        assert_eq!(log.removed(), vec![entry.index()]);
        assert!(!fx.members.is_member(entry.path()));
    }

    #[tokio::test]
    async fn rename_carries_membership_to_new_slot() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::shareable());
        let log = EventLog::watch_collection(&collection);
        let old_path = fx.file("old.txt");
        let old = collection.add_path(&old_path).await.expect("add");

        let new_path = fx.dir.path().join("new.txt");
        std::fs::rename(&old_path, &new_path).expect("rename");
        let new = fx.library.rename(&old_path, &new_path).await.expect("rename");

        assert!(collection.contains_index(new.index()));
        assert!(!collection.contains_index(old.index()));
        assert_eq!(collection.len(), 1);
        assert!(!fx.members.is_member(old.path()));
        assert!(fx.members.is_member(new.path()));
        assert_eq!((old.share_count(), new.share_count()), (0, 1));
        assert!(matches!(
            log.events().last(),
            Some(ViewEvent::Changed { old: o, new: n }) if Arc::ptr_eq(o, &old) && Arc::ptr_eq(n, &new)
        ));
    }

    #[tokio::test]
    async fn rescan_restores_persisted_members() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::shareable());
        let a = collection.add_path(fx.file("a.txt")).await.expect("a");
        let b = collection.add_path(fx.file("b.txt")).await.expect("b");
        fx.library.admit(fx.file("other.txt")).await.expect("other");
        let log = EventLog::watch_collection(&collection);

        for handle in fx.library.rescan() {
            handle.await.expect("reload");
        }
        assert_eq!(fx.library.len(), 3);
        assert_eq!(collection.len(), 2);
        assert!(collection.contains_path(a.path()));
        assert!(collection.contains_path(b.path()));
        assert!(!collection.contains_index(a.index()));
        assert!(matches!(log.events().first(), Some(ViewEvent::Cleared)));
        assert_eq!(log.added().len(), 2);
        assert_eq!(a.share_count(), 0, "vacated entries are no longer shared");
        let reloaded = fx.library.get_by_path(a.path()).expect("reloaded");
        assert_eq!(reloaded.share_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn superseded_add_keeps_pending_membership() {
        let fx = Fixture::with_hasher(ScriptedHasher::gated());
        let collection = fx.collection(filters::shareable());
        let path = fx.file("a.txt");

        let stale = collection.add_path(&path);
        fx.hasher.wait_for_calls(1).await;
        let reload = fx.library.rescan();
        assert!(matches!(stale.await, Err(AdmissionError::RevisionChanged { .. })));
        assert!(fx.members.is_member(&path));

        fx.hasher.release(2);
        for handle in reload {
            handle.await.expect("reload");
        }
        assert!(collection.contains_path(&path));
    }

    #[tokio::test]
    async fn clear_emits_once_and_forgets_members() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::shareable());
        let a = collection.add_path(fx.file("a.txt")).await.expect("a");
        collection.add_path(fx.file("b.txt")).await.expect("b");
        let log = EventLog::watch_collection(&collection);

        assert_eq!(collection.clear(), 2);
        assert_eq!(collection.clear(), 0);
        assert!(matches!(&log.events()[..], [ViewEvent::Cleared]));
        assert!(fx.members.members().is_empty());
        assert_eq!(a.share_count(), 0);
        assert!(fx.library.contains_path(a.path()));
    }

    #[tokio::test]
    async fn peer_list_changes_emit_events() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::shareable());
        let log = EventLog::watch_collection(&collection);
        let alice = PeerId::new("alice");

        assert!(collection.share_with(alice.clone()));
        assert!(!collection.share_with(alice.clone()));
        assert!(collection.is_shared_with(&alice));
        assert_eq!(collection.peers(), vec![alice.clone()]);
        assert!(collection.unshare_with(&alice));
        assert!(!collection.unshare_with(&alice));
        assert!(matches!(
            &log.events()[..],
            [ViewEvent::PeerAdded(added), ViewEvent::PeerRemoved(removed)]
                if *added == alice && *removed == alice
        ));
    }

    #[tokio::test]
    async fn add_folder_adds_immediate_manageable_files() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::shareable());
        let a = fx.file("a.txt");
        fx.file("b.txt");
        fx.file("setup.exe");
        std::fs::create_dir(fx.dir.path().join("nested")).expect("mkdir");
        let nested = touch(fx.dir.path().join("nested"), "c.txt", b"c");
        collection.add_path(&a).await.expect("a");

        let handles = collection.add_folder(fx.dir.path());
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.await.expect("add");
        }
        assert_eq!(collection.len(), 2);
        assert!(!fx.library.contains_path(&nested));
    }

    #[tokio::test]
    async fn files_in_directory_lists_direct_children() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::shareable());
        std::fs::create_dir(fx.dir.path().join("nested")).expect("mkdir");
        let top = collection.add_path(fx.file("a.txt")).await.expect("a");
        collection
            .add_path(touch(fx.dir.path().join("nested"), "c.txt", b"c"))
            .await
            .expect("c");

        let listed = collection.files_in_directory(fx.dir.path());
        assert_eq!(listed.len(), 1);
        assert!(Arc::ptr_eq(&listed[0], &top));
    }

    #[tokio::test]
    async fn dispose_stops_following_the_library() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::shareable());
        let entry = collection.add_path(fx.file("a.txt")).await.expect("add");
        let log = EventLog::watch_collection(&collection);

        collection.dispose();
        assert!(collection.is_empty());
        assert!(fx.members.is_member(entry.path()));
        fx.library.remove_path(entry.path());
        fx.library.admit(entry.path()).await.expect("readmit");
        assert!(collection.is_empty());
        assert!(matches!(&log.events()[..], [ViewEvent::Cleared]));
    }

    #[tokio::test]
    async fn pausable_iter_walks_members_only() {
        let fx = Fixture::new();
        let collection = fx.collection(filters::shareable());
        let mut members = Vec::new();
        for name in ["a.txt", "b.txt", "c.txt"] {
            members.push(collection.add_path(fx.file(name)).await.expect("add"));
            fx.library.admit(fx.file(&format!("x-{name}"))).await.expect("admit");
        }

        let mut iter = collection.pausable_iter();
        let first = iter.next().expect("first");
        assert!(Arc::ptr_eq(&first, &members[0]));
        collection.remove(&members[1]);
        let rest: Vec<SlotIndex> = iter.map(|entry| entry.index()).collect();
        assert_eq!(rest, vec![members[2].index()]);
        assert_eq!(collection.entries().len(), 2);
    }
}

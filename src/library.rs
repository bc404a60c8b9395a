//! The library: master registry of every file the node tracks.
//!
//! The library owns the slot arena and the path and hash indices. It is the
//! only component that creates or destroys entries. Collections and views
//! hold slot numbers and resolve them here.

mod admission;
mod iter;
mod rescan;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

pub use admission::{AdmissionHandle, AdmissionResult};
pub use iter::PausableIter;
pub(crate) use iter::MemberSet;

use crate::cancel::RevisionTracker;
use crate::config::LibraryConfig;
use crate::error::{canonicalize_existing_path, AdmissionError, LibraryError, Result};
use crate::events::{EventBus, LibraryEvent, ListenerId};
use crate::services::{
    warn_on_store_error, HashService, ManagedStore, MemoryManagedStore, PermissiveValidator,
    Validator,
};
use crate::storage::{Entry, EntryRef, FileFacts, IndexSet, SlotIndex, Slots};
use crate::types::{ContentHash, EntryFlags, LibraryStatus};
use crate::view::FileView;

use admission::PendingAdmission;
use rescan::LoadTracker;

/// Cloneable handle to the shared registry.
#[derive(Clone)]
pub struct Library {
    shared: Arc<LibraryShared>,
}

struct LibraryShared {
    config: LibraryConfig,
    state: RwLock<LibraryState>,
    revisions: Arc<RevisionTracker>,
    events: EventBus<LibraryEvent>,
    hasher: Arc<dyn HashService>,
    validator: Arc<dyn Validator>,
    store: Arc<dyn ManagedStore>,
    runtime: Handle,
    load: LoadTracker,
    next_view_id: AtomicU64,
}

/// Everything guarded by the library lock.
#[derive(Default)]
struct LibraryState {
    slots: Slots<EntryRef>,
    by_path: FnvHashMap<PathBuf, SlotIndex>,
    /// Primary hash to the slots carrying it.
    by_hash: FnvHashMap<ContentHash, IndexSet>,
    pending: FnvHashMap<PathBuf, Arc<PendingAdmission>>,
}

impl LibraryState {
    fn entry_at_path(&self, path: &Path) -> Option<EntryRef> {
        let index = self.by_path.get(path)?;
        self.slots.get(*index).cloned()
    }

    fn insert(&mut self, facts: FileFacts, hashes: &[ContentHash]) -> Option<EntryRef> {
        let index = self.slots.next_index();
        let entry = Arc::new(Entry::new(index, facts, hashes)?);
        let pushed = self.slots.push(Arc::clone(&entry));
        debug_assert_eq!(pushed, index);
        let previous = self.by_path.insert(entry.path().to_path_buf(), index);
        debug_assert!(previous.is_none(), "path already had a live slot");
        self.by_hash
            .entry(entry.primary_hash())
            .or_default()
            .insert(index);
        Some(entry)
    }

    fn remove(&mut self, index: SlotIndex) -> Option<EntryRef> {
        let entry = self.slots.take(index)?;
        debug_assert_eq!(entry.index(), index, "slot holds a foreign entry");
        let mapped = self.by_path.remove(entry.path());
        debug_assert_eq!(mapped, Some(index), "path index out of sync");
        let primary = entry.primary_hash();
        if let Some(indices) = self.by_hash.get_mut(&primary) {
            indices.remove(index);
            if indices.is_empty() {
                self.by_hash.remove(&primary);
            }
        }
        Some(entry)
    }

    /// Vacates every slot. Collections drop all members on `Cleared`, so the
    /// share counts of the vacated entries go back to zero here.
    fn clear(&mut self) {
        for (_, entry) in self.slots.iter() {
            entry.reset_share_count();
        }
        self.slots.vacate_all();
        self.by_path.clear();
        self.by_hash.clear();
    }
}

/// Builder for [`Library`].
pub struct LibraryBuilder {
    config: LibraryConfig,
    hasher: Arc<dyn HashService>,
    validator: Arc<dyn Validator>,
    store: Arc<dyn ManagedStore>,
    runtime: Option<Handle>,
}

impl LibraryBuilder {
    pub fn config(mut self, config: LibraryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn store(mut self, store: Arc<dyn ManagedStore>) -> Self {
        self.store = store;
        self
    }

    /// Runtime used for hashing and finalization. Defaults to the runtime
    /// `build` is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Library> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| LibraryError::NoRuntime)?,
        };
        let events = EventBus::new(self.config.event_capacity);
        Ok(Library {
            shared: Arc::new(LibraryShared {
                config: self.config,
                state: RwLock::new(LibraryState::default()),
                revisions: Arc::new(RevisionTracker::new()),
                events,
                hasher: self.hasher,
                validator: self.validator,
                store: self.store,
                runtime,
                load: LoadTracker::default(),
                next_view_id: AtomicU64::new(0),
            }),
        })
    }
}

impl Library {
    pub fn builder(hasher: Arc<dyn HashService>) -> LibraryBuilder {
        LibraryBuilder {
            config: LibraryConfig::default(),
            hasher,
            validator: Arc::new(PermissiveValidator),
            store: Arc::new(MemoryManagedStore::new()),
            runtime: None,
        }
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.shared.config
    }

    /// Looks `path` up as given, then canonicalized.
    pub fn get_by_path(&self, path: impl AsRef<Path>) -> Option<EntryRef> {
        let path = path.as_ref();
        if let Some(entry) = self.shared.state.read().entry_at_path(path) {
            return Some(entry);
        }
        let canonical = fs::canonicalize(path).ok()?;
        if canonical == path {
            return None;
        }
        self.shared.state.read().entry_at_path(&canonical)
    }

    pub fn get_by_index(&self, index: SlotIndex) -> Option<EntryRef> {
        self.shared.state.read().slots.get(index).cloned()
    }

    /// Every live entry whose primary hash is `hash`, in slot order.
    pub fn get_all_by_hash(&self, hash: &ContentHash) -> Vec<EntryRef> {
        let state = self.shared.state.read();
        state
            .by_hash
            .get(hash)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|index| state.slots.get(index).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn indices_by_hash(&self, hash: &ContentHash) -> IndexSet {
        self.shared
            .state
            .read()
            .by_hash
            .get(hash)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains_path(&self, path: impl AsRef<Path>) -> bool {
        self.get_by_path(path).is_some()
    }

    pub fn contains_index(&self, index: SlotIndex) -> bool {
        self.shared.state.read().slots.get(index).is_some()
    }

    pub fn len(&self) -> usize {
        self.shared.state.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn revision(&self) -> u64 {
        self.shared.revisions.current_revision()
    }

    /// True once every managed path of the current revision has been tried.
    pub fn is_load_finished(&self) -> bool {
        self.shared.load.is_finished(self.revision())
    }

    pub fn status(&self) -> LibraryStatus {
        let (entries, pending_admissions) = {
            let state = self.shared.state.read();
            (state.slots.len(), state.pending.len())
        };
        let revision = self.revision();
        let (load_started_at, load_finished_at) = self.shared.load.timestamps();
        LibraryStatus {
            entries,
            revision,
            pending_admissions,
            load_finished: self.shared.load.is_finished(revision),
            load_started_at,
            load_finished_at,
        }
    }

    /// Removes the entry at `path` and forgets that the path is managed.
    pub fn remove_path(&self, path: impl AsRef<Path>) -> bool {
        match self.detach(path.as_ref()) {
            Some(entry) => {
                self.finish_removal(entry);
                true
            }
            None => false,
        }
    }

    pub fn remove_index(&self, index: SlotIndex) -> bool {
        let removed = self.shared.state.write().remove(index);
        match removed {
            Some(entry) => {
                self.finish_removal(entry);
                true
            }
            None => false,
        }
    }

    fn finish_removal(&self, entry: EntryRef) {
        log::debug!("removed {} from slot {}", entry.path().display(), entry.index());
        self.shared
            .events
            .publish(LibraryEvent::Removed(Arc::clone(&entry)));
        warn_on_store_error(
            self.shared.store.record_managed(entry.path(), false),
            "unmanage",
            entry.path(),
        );
    }

    /// Takes the entry at `path` out of every index without notifying anyone.
    fn detach(&self, path: &Path) -> Option<EntryRef> {
        let key = self.resolve_key(path);
        let mut state = self.shared.state.write();
        let index = *state.by_path.get(&key)?;
        state.remove(index)
    }

    /// The key `path` is stored under: as given if present, else canonical.
    fn resolve_key(&self, path: &Path) -> PathBuf {
        if self.shared.state.read().by_path.contains_key(path) {
            path.to_path_buf()
        } else {
            canonicalize_existing_path(path)
        }
    }

    /// Attaches an auxiliary hash to the entry at `index`.
    pub fn add_hash(&self, index: SlotIndex, hash: ContentHash) -> bool {
        self.get_by_index(index)
            .is_some_and(|entry| entry.add_hash(hash))
    }

    /// Removes every entry whose primary hash turned out to be invalid.
    pub fn invalidate_hash(&self, hash: &ContentHash) -> usize {
        let removed: Vec<EntryRef> = {
            let mut state = self.shared.state.write();
            let indices = state.by_hash.get(hash).cloned().unwrap_or_default();
            let removed: Vec<EntryRef> = indices
                .iter()
                .filter_map(|index| state.remove(index))
                .collect();
            for entry in &removed {
                self.shared
                    .events
                    .enqueue(LibraryEvent::Removed(Arc::clone(entry)));
            }
            removed
        };
        self.shared.events.flush();
        if !removed.is_empty() {
            log::info!("invalidated {} entries with hash {}", removed.len(), hash);
        }
        removed.len()
    }

    /// Inserts a placeholder for a download in progress. No hashing happens;
    /// `hashes` must still contain a primary hash.
    pub fn add_incomplete(
        &self,
        path: impl AsRef<Path>,
        hashes: &[ContentHash],
        size: u64,
    ) -> AdmissionResult {
        let path = canonicalize_existing_path(path.as_ref());
        let facts = FileFacts {
            path: path.clone(),
            size,
            modified: None,
            flags: EntryFlags::INCOMPLETE,
        };
        let outcome = {
            let mut state = self.shared.state.write();
            let outcome = match state.entry_at_path(&path) {
                Some(existing) => Err(AdmissionError::AlreadyManaged(existing)),
                None => state
                    .insert(facts, hashes)
                    .ok_or_else(|| AdmissionError::CantCreateEntry(path.clone())),
            };
            match &outcome {
                Ok(entry) => self
                    .shared
                    .events
                    .enqueue(LibraryEvent::Added(Arc::clone(entry))),
                Err(error) => self.shared.events.enqueue(LibraryEvent::AddFailed {
                    path: path.clone(),
                    reason: error.reason(),
                    existing: error.existing().cloned(),
                }),
            }
            outcome
        };
        self.shared.events.flush();
        outcome
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LibraryEvent) + Send + Sync + 'static,
    {
        self.shared.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.events.remove_listener(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.shared.events.subscribe()
    }

    /// Resolves `indices` to live entries under one read lock.
    pub(crate) fn entries_for<I>(&self, indices: I) -> Vec<EntryRef>
    where
        I: IntoIterator<Item = SlotIndex>,
    {
        let state = self.shared.state.read();
        indices
            .into_iter()
            .filter_map(|index| state.slots.get(index).cloned())
            .collect()
    }

    /// Ids for collections and union views attached to this library.
    pub(crate) fn allocate_view_id(&self) -> u64 {
        self.shared.next_view_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn ptr_eq(&self, other: &Library) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("entries", &self.len())
            .field("revision", &self.revision())
            .finish()
    }
}

/// The library is the all-files view.
impl FileView for Library {
    fn library(&self) -> &Library {
        self
    }

    fn contains_index(&self, index: SlotIndex) -> bool {
        Library::contains_index(self, index)
    }

    fn contains_path(&self, path: &Path) -> bool {
        Library::contains_path(self, path)
    }

    fn len(&self) -> usize {
        Library::len(self)
    }

    fn index_set(&self) -> IndexSet {
        let state = self.shared.state.read();
        state.slots.iter().map(|(index, _)| index).collect()
    }

    fn entries(&self) -> Vec<EntryRef> {
        let state = self.shared.state.read();
        state.slots.iter().map(|(_, entry)| Arc::clone(entry)).collect()
    }

    fn pausable_iter(&self) -> PausableIter {
        let (max, revision) = {
            let state = self.shared.state.read();
            let max = state.slots.slot_count().checked_sub(1).map(SlotIndex::new);
            (max, self.revision())
        };
        PausableIter::new(self.clone(), None, Some(SlotIndex::new(0)), max, revision)
    }
}

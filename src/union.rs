//! Views whose membership is the union of several collections.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::collection::{Collection, CollectionId};
use crate::error::{LibraryError, Result};
use crate::events::{EventBus, ListenerId, ViewEvent};
use crate::library::{Library, MemberSet, PausableIter};
use crate::storage::{EntryRef, IndexSet, SlotIndex};
use crate::view::FileView;

/// Read-only view over the union of its backing collections.
///
/// Membership is maintained incrementally from the backings' events and
/// recomputed in full by [`UnionView::validate`] whenever a backing is
/// cleared or detached. A slot leaves the union only once no backing holds
/// it any more.
#[derive(Clone)]
pub struct UnionView {
    shared: Arc<UnionShared>,
}

struct UnionShared {
    library: Library,
    state: RwLock<UnionState>,
    events: EventBus<ViewEvent>,
}

#[derive(Default)]
struct UnionState {
    members: IndexSet,
    backings: Vec<Backing>,
}

struct Backing {
    collection: Collection,
    listener: ListenerId,
}

impl UnionState {
    fn is_backed_by(&self, id: CollectionId) -> bool {
        self.backings
            .iter()
            .any(|backing| backing.collection.id() == id)
    }

    fn held_by_any(&self, index: SlotIndex) -> bool {
        self.backings
            .iter()
            .any(|backing| backing.collection.has_member(index))
    }

    fn recompute(&self) -> IndexSet {
        let mut union = IndexSet::new();
        for backing in &self.backings {
            union.union_with(&backing.collection.index_set());
        }
        union
    }
}

impl Drop for UnionShared {
    fn drop(&mut self) {
        for backing in self.state.get_mut().backings.drain(..) {
            backing.collection.remove_listener(backing.listener);
        }
    }
}

impl MemberSet for UnionShared {
    fn next_member(&self, from: SlotIndex) -> Option<SlotIndex> {
        self.state.read().members.next_at_or_after(from)
    }
}

impl UnionView {
    pub fn new(library: &Library) -> Self {
        Self {
            shared: Arc::new(UnionShared {
                library: library.clone(),
                state: RwLock::new(UnionState::default()),
                events: EventBus::new(library.config().event_capacity),
            }),
        }
    }

    /// Adds `collection` as a backing and returns the slots that joined the
    /// union because of it.
    pub fn add_backing(&self, collection: &Collection) -> Result<IndexSet> {
        if !collection.library().ptr_eq(&self.shared.library) {
            return Err(LibraryError::InvalidInput(format!(
                "{} belongs to another library",
                collection.id()
            )));
        }
        if self.is_backed_by(collection.id()) {
            return Ok(IndexSet::new());
        }

        // Registered before the snapshot so no change slips between the two.
        let source = collection.id();
        let weak: Weak<UnionShared> = Arc::downgrade(&self.shared);
        let listener = collection.add_listener(move |event| {
            if let Some(shared) = weak.upgrade() {
                UnionView { shared }.on_backing_event(source, event);
            }
        });

        let added = {
            let mut state = self.shared.state.write();
            if state.is_backed_by(source) {
                drop(state);
                collection.remove_listener(listener);
                return Ok(IndexSet::new());
            }
            let added = state.members.union_with(&collection.index_set());
            state.backings.push(Backing {
                collection: collection.clone(),
                listener,
            });
            for entry in self.shared.library.entries_for(added.iter()) {
                self.shared.events.enqueue(ViewEvent::Added(entry));
            }
            added
        };
        self.shared.events.flush();
        log::debug!("{} now backs a union view (+{} slots)", source, added.len());
        Ok(added)
    }

    /// Detaches the backing `id` and returns the slots that left the union.
    pub fn remove_backing(&self, id: CollectionId) -> IndexSet {
        let backing = {
            let mut state = self.shared.state.write();
            let Some(position) = state
                .backings
                .iter()
                .position(|backing| backing.collection.id() == id)
            else {
                return IndexSet::new();
            };
            state.backings.remove(position)
        };
        backing.collection.remove_listener(backing.listener);
        self.validate()
    }

    pub fn is_backed_by(&self, id: CollectionId) -> bool {
        self.shared.state.read().is_backed_by(id)
    }

    pub fn backings(&self) -> Vec<CollectionId> {
        self.shared
            .state
            .read()
            .backings
            .iter()
            .map(|backing| backing.collection.id())
            .collect()
    }

    /// A backing gained `entry`.
    pub fn on_backing_file_added(&self, source: CollectionId, entry: &EntryRef) -> bool {
        let added = {
            let mut state = self.shared.state.write();
            let added = state.is_backed_by(source) && state.members.insert(entry.index());
            if added {
                self.shared.events.enqueue(ViewEvent::Added(Arc::clone(entry)));
            }
            added
        };
        self.shared.events.flush();
        added
    }

    /// A backing lost `entry`. The slot stays if another backing holds it.
    pub fn on_backing_file_removed(&self, source: CollectionId, entry: &EntryRef) -> bool {
        let removed = {
            let mut state = self.shared.state.write();
            let removed = state.is_backed_by(source)
                && !state.held_by_any(entry.index())
                && state.members.remove(entry.index());
            if removed {
                self.shared
                    .events
                    .enqueue(ViewEvent::Removed(Arc::clone(entry)));
            }
            removed
        };
        self.shared.events.flush();
        removed
    }

    fn on_backing_changed(&self, source: CollectionId, old: &EntryRef, new: &EntryRef) {
        {
            let mut state = self.shared.state.write();
            if !state.is_backed_by(source) {
                return;
            }
            let removed =
                !state.held_by_any(old.index()) && state.members.remove(old.index());
            let added = state.held_by_any(new.index()) && state.members.insert(new.index());
            let event = match (removed, added) {
                (true, true) => Some(ViewEvent::Changed {
                    old: Arc::clone(old),
                    new: Arc::clone(new),
                }),
                (true, false) => Some(ViewEvent::Removed(Arc::clone(old))),
                (false, true) => Some(ViewEvent::Added(Arc::clone(new))),
                (false, false) => None,
            };
            if let Some(event) = event {
                self.shared.events.enqueue(event);
            }
        }
        self.shared.events.flush();
    }

    /// Recomputes membership from the backings and returns the slots that
    /// were dropped. Emits `Removed` and `Added` for every difference.
    pub fn validate(&self) -> IndexSet {
        let removed = {
            let mut state = self.shared.state.write();
            let union = state.recompute();
            let removed = state.members.difference(&union);
            let added = union.difference(&state.members);
            state.members = union;

            let library = &self.shared.library;
            // Slots the library already vacated were announced there.
            for entry in library.entries_for(removed.iter()) {
                self.shared.events.enqueue(ViewEvent::Removed(entry));
            }
            for entry in library.entries_for(added.iter()) {
                self.shared.events.enqueue(ViewEvent::Added(entry));
            }
            removed
        };
        self.shared.events.flush();
        removed
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

    fn on_backing_event(&self, source: CollectionId, event: &ViewEvent) {
        match event {
            ViewEvent::Added(entry) => {
                self.on_backing_file_added(source, entry);
            }
            ViewEvent::Removed(entry) => {
                self.on_backing_file_removed(source, entry);
            }
            ViewEvent::Changed { old, new } => self.on_backing_changed(source, old, new),
            ViewEvent::Cleared => {
                if self.is_backed_by(source) {
                    self.validate();
                }
            }
            ViewEvent::PeerAdded(_) | ViewEvent::PeerRemoved(_) => {}
        }
    }
}

impl FileView for UnionView {
    fn library(&self) -> &Library {
        &self.shared.library
    }

    fn contains_index(&self, index: SlotIndex) -> bool {
        self.shared.state.read().members.contains(index)
            && self.shared.library.contains_index(index)
    }

    fn len(&self) -> usize {
        self.shared.state.read().members.len()
    }

    fn index_set(&self) -> IndexSet {
        self.shared.state.read().members.clone()
    }

    fn entries(&self) -> Vec<EntryRef> {
        let state = self.shared.state.read();
        self.shared.library.entries_for(state.members.iter())
    }

    fn pausable_iter(&self) -> PausableIter {
        let (min, max) = {
            let state = self.shared.state.read();
            (state.members.min(), state.members.max())
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

impl fmt::Debug for UnionView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("UnionView")
            .field("members", &state.members.len())
            .field("backings", &state.backings.len())
            .finish()
    }
}

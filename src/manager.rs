//! Per-peer union views over the shared collections.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::collection::{Collection, CollectionId};
use crate::error::{LibraryError, Result};
use crate::events::{ListenerId, ViewEvent};
use crate::library::Library;
use crate::types::PeerId;
use crate::union::UnionView;
use crate::view::FileView;

/// Tracks the shared collections and keeps one [`UnionView`] per peer,
/// backed by every collection shared with that peer.
///
/// Views are created on first request. Changes to a collection's peer list
/// attach or detach it from the affected views.
#[derive(Clone)]
pub struct ViewManager {
    shared: Arc<ManagerShared>,
}

struct ManagerShared {
    library: Library,
    state: RwLock<ManagerState>,
}

#[derive(Default)]
struct ManagerState {
    collections: Vec<Managed>,
    views: BTreeMap<PeerId, UnionView>,
}

struct Managed {
    collection: Collection,
    listener: ListenerId,
}

impl ManagerState {
    fn find(&self, id: CollectionId) -> Option<&Collection> {
        self.collections
            .iter()
            .map(|managed| &managed.collection)
            .find(|collection| collection.id() == id)
    }
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        for managed in self.state.get_mut().collections.drain(..) {
            managed.collection.remove_listener(managed.listener);
        }
    }
}

impl ViewManager {
    pub fn new(library: &Library) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                library: library.clone(),
                state: RwLock::new(ManagerState::default()),
            }),
        }
    }

    /// Starts tracking `collection`. Returns false if it already was.
    pub fn add_collection(&self, collection: &Collection) -> Result<bool> {
        if !collection.library().ptr_eq(&self.shared.library) {
            return Err(LibraryError::InvalidInput(format!(
                "{} belongs to another library",
                collection.id()
            )));
        }
        let id = collection.id();
        let weak: Weak<ManagerShared> = Arc::downgrade(&self.shared);
        let listener = collection.add_listener(move |event| {
            if let Some(shared) = weak.upgrade() {
                ViewManager { shared }.on_collection_event(id, event);
            }
        });

        let views: Vec<UnionView> = {
            let mut state = self.shared.state.write();
            if state.find(id).is_some() {
                drop(state);
                collection.remove_listener(listener);
                return Ok(false);
            }
            state.collections.push(Managed {
                collection: collection.clone(),
                listener,
            });
            state
                .views
                .iter()
                .filter(|(peer, _)| collection.is_shared_with(peer))
                .map(|(_, view)| view.clone())
                .collect()
        };
        for view in views {
            view.add_backing(collection)?;
        }
        log::debug!("view manager tracking {}", id);
        Ok(true)
    }

    /// Stops tracking the collection and detaches it from every view.
    pub fn remove_collection(&self, id: CollectionId) -> bool {
        let (managed, views) = {
            let mut state = self.shared.state.write();
            let Some(position) = state
                .collections
                .iter()
                .position(|managed| managed.collection.id() == id)
            else {
                return false;
            };
            let managed = state.collections.remove(position);
            let views: Vec<UnionView> = state.views.values().cloned().collect();
            (managed, views)
        };
        managed.collection.remove_listener(managed.listener);
        for view in views {
            view.remove_backing(id);
        }
        true
    }

    pub fn collections(&self) -> Vec<Collection> {
        self.shared
            .state
            .read()
            .collections
            .iter()
            .map(|managed| managed.collection.clone())
            .collect()
    }

    /// The union of every collection shared with `peer`, created on demand.
    pub fn view_for_peer(&self, peer: &PeerId) -> UnionView {
        if let Some(view) = self.shared.state.read().views.get(peer) {
            return view.clone();
        }
        let (view, backings) = {
            let mut state = self.shared.state.write();
            if let Some(view) = state.views.get(peer) {
                return view.clone();
            }
            let view = UnionView::new(&self.shared.library);
            state.views.insert(peer.clone(), view.clone());
            let backings: Vec<Collection> = state
                .collections
                .iter()
                .map(|managed| &managed.collection)
                .filter(|collection| collection.is_shared_with(peer))
                .cloned()
                .collect();
            (view, backings)
        };

        for collection in &backings {
            if let Err(err) = view.add_backing(collection) {
                log::warn!("cannot back view for {}: {}", peer, err);
            }
        }
        // A peer list may have changed while the backings were attached.
        for collection in &backings {
            let still_tracked = self.shared.state.read().find(collection.id()).is_some();
            if !still_tracked || !collection.is_shared_with(peer) {
                view.remove_backing(collection.id());
            }
        }
        log::debug!(
            "created view for {} over {} collections",
            peer,
            view.backings().len()
        );
        view
    }

    /// Drops the view for `peer`; a later request builds a fresh one.
    pub fn remove_view(&self, peer: &PeerId) -> bool {
        self.shared.state.write().views.remove(peer).is_some()
    }

    pub fn views(&self) -> Vec<(PeerId, UnionView)> {
        self.shared
            .state
            .read()
            .views
            .iter()
            .map(|(peer, view)| (peer.clone(), view.clone()))
            .collect()
    }

    fn on_collection_event(&self, id: CollectionId, event: &ViewEvent) {
        let (peer, shared) = match event {
            ViewEvent::PeerAdded(peer) => (peer, true),
            ViewEvent::PeerRemoved(peer) => (peer, false),
            _ => return,
        };
        let (collection, view) = {
            let state = self.shared.state.read();
            let Some(collection) = state.find(id).cloned() else {
                return;
            };
            let Some(view) = state.views.get(peer).cloned() else {
                return;
            };
            (collection, view)
        };
        if shared {
            if let Err(err) = view.add_backing(&collection) {
                log::warn!("cannot back view for {}: {}", peer, err);
            }
        } else {
            view.remove_backing(id);
        }
    }
}

impl fmt::Debug for ViewManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("ViewManager")
            .field("collections", &state.collections.len())
            .field("views", &state.views.len())
            .finish()
    }
}

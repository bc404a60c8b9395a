//! In-process event buses.
//!
//! Producers never deliver events while holding their own locks. They
//! [`EventBus::enqueue`] while the lock is held, so queue order matches
//! mutation order, then release the lock and [`EventBus::flush`].
//!
//! Only one thread delivers at a time. A flush that finds a delivery already
//! running returns at once and the running deliverer drains the queue,
//! including events enqueued by its own listeners. Listeners can therefore
//! call back into the component that notified them without deadlocking, and
//! see events strictly in order.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::error::FailureReason;
use crate::storage::EntryRef;
use crate::types::PeerId;

/// Change notification from the library.
#[derive(Debug, Clone)]
pub enum LibraryEvent {
    Added(EntryRef),
    /// A renamed or modified file was re-admitted under a new slot.
    Changed { old: EntryRef, new: EntryRef },
    Removed(EntryRef),
    /// Every entry was dropped at the start of a rescan.
    Cleared,
    AddFailed {
        path: PathBuf,
        reason: FailureReason,
        /// The converged entry for `AlreadyManaged` failures.
        existing: Option<EntryRef>,
    },
    ChangeFailed {
        old: Option<EntryRef>,
        new_path: PathBuf,
        reason: FailureReason,
    },
    LoadStarted { revision: u64 },
    LoadFinishing { revision: u64 },
    LoadComplete { revision: u64 },
    Saved,
}

/// Change notification from a collection or union view.
#[derive(Debug, Clone)]
pub enum ViewEvent {
    Added(EntryRef),
    Removed(EntryRef),
    Changed { old: EntryRef, new: EntryRef },
    Cleared,
    PeerAdded(PeerId),
    PeerRemoved(PeerId),
}

/// Handle returned by [`EventBus::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered, reentrancy-safe event bus.
pub struct EventBus<E> {
    listeners: RwLock<Vec<(ListenerId, Listener<E>)>>,
    next_listener: AtomicU64,
    pending: Mutex<VecDeque<E>>,
    delivery: Mutex<()>,
    sender: broadcast::Sender<E>,
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl<E> EventBus<E>
where
    E: Clone + Send + 'static,
{
    /// `capacity` bounds the async subscriber channel.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            delivery: Mutex::new(()),
            sender,
        }
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Async view of every delivered event.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Queues an event for the next flush.
    pub fn enqueue(&self, event: E) {
        self.pending.lock().push_back(event);
    }

    /// Queues and delivers in one step. Only for callers holding no locks.
    pub fn publish(&self, event: E) {
        self.enqueue(event);
        self.flush();
    }

    /// Delivers queued events in order.
    pub fn flush(&self) {
        loop {
            let Some(guard) = self.delivery.try_lock() else {
                return;
            };
            loop {
                let next = self.pending.lock().pop_front();
                let Some(event) = next else {
                    break;
                };
                self.deliver(&event);
            }
            drop(guard);
            // An event enqueued after the drain but before the guard dropped
            // would otherwise sit until the next flush.
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }

    fn deliver(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
        let _ = self.sender.send(event.clone());
    }
}

//! Scripted collaborators and event recorders shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fnv::FnvHasher;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::time::{timeout, Duration};

use crate::collection::Collection;
use crate::error::FailureReason;
use crate::events::{LibraryEvent, ViewEvent};
use crate::library::Library;
use crate::services::{HashService, Validator};
use crate::storage::SlotIndex;
use crate::types::ContentHash;
use crate::union::UnionView;

pub(crate) fn sha1(n: u8) -> ContentHash {
    ContentHash::Sha1([n; 20])
}

/// Writes a file and returns its canonical path.
pub(crate) fn touch(dir: impl AsRef<Path>, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.as_ref().join(name);
    std::fs::write(&path, contents).expect("write test file");
    std::fs::canonicalize(&path).expect("canonicalize test file")
}

enum Script {
    Hashes(Vec<ContentHash>),
    Fail(String),
}

/// Hash service with per-path answers and an optional gate.
///
/// Unscripted paths hash to a SHA-1 derived from the path itself, so distinct
/// files never collide. A gated hasher blocks every computation until
/// [`ScriptedHasher::release`] hands out permits.
pub(crate) struct ScriptedHasher {
    scripts: Mutex<HashMap<PathBuf, Script>>,
    primed: Mutex<HashMap<PathBuf, Vec<ContentHash>>>,
    calls: AtomicUsize,
    forgotten: AtomicUsize,
    called: Notify,
    gate: Option<Semaphore>,
}

impl ScriptedHasher {
    pub(crate) fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            primed: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            forgotten: AtomicUsize::new(0),
            called: Notify::new(),
            gate: None,
        }
    }

    pub(crate) fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub(crate) fn set(&self, path: &Path, hashes: Vec<ContentHash>) {
        self.scripts
            .lock()
            .insert(path.to_path_buf(), Script::Hashes(hashes));
    }

    pub(crate) fn fail(&self, path: &Path, message: &str) {
        self.scripts
            .lock()
            .insert(path.to_path_buf(), Script::Fail(message.to_string()));
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn forgotten(&self) -> usize {
        self.forgotten.load(Ordering::SeqCst)
    }

    pub(crate) fn primed(&self, path: &Path) -> Option<Vec<ContentHash>> {
        self.primed.lock().get(path).cloned()
    }

    /// Lets `permits` gated computations through.
    pub(crate) fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    /// Waits until at least `count` computations have started.
    pub(crate) async fn wait_for_calls(&self, count: usize) {
        let wait = async {
            loop {
                let notified = self.called.notified();
                if self.calls() >= count {
                    return;
                }
                notified.await;
            }
        };
        timeout(Duration::from_secs(5), wait)
            .await
            .expect("hash computations did not start");
    }

    fn default_hash(path: &Path) -> ContentHash {
        let mut hasher = FnvHasher::default();
        path.hash(&mut hasher);
        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(&hasher.finish().to_le_bytes());
        ContentHash::Sha1(bytes)
    }
}

#[async_trait]
impl HashService for ScriptedHasher {
    async fn compute(&self, path: &Path) -> io::Result<Vec<ContentHash>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.called.notify_waiters();
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(io::Error::other)?.forget();
        }
        if let Some(script) = self.scripts.lock().get(path) {
            return match script {
                Script::Hashes(hashes) => Ok(hashes.clone()),
                Script::Fail(message) => Err(io::Error::other(message.clone())),
            };
        }
        if let Some(hashes) = self.primed.lock().get(path) {
            return Ok(hashes.clone());
        }
        Ok(vec![Self::default_hash(path)])
    }

    fn prime(&self, path: &Path, hashes: &[ContentHash]) {
        self.primed.lock().insert(path.to_path_buf(), hashes.to_vec());
    }

    fn forget(&self, path: &Path) {
        self.primed.lock().remove(path);
        self.forgotten.fetch_add(1, Ordering::SeqCst);
    }
}

/// Validator that flags explicitly listed paths and hashes.
#[derive(Default)]
pub(crate) struct BlockList {
    paths: Mutex<HashSet<PathBuf>>,
    hashes: Mutex<HashSet<ContentHash>>,
}

impl BlockList {
    pub(crate) fn block_path(&self, path: &Path) {
        self.paths.lock().insert(path.to_path_buf());
    }

    pub(crate) fn block_hash(&self, hash: ContentHash) {
        self.hashes.lock().insert(hash);
    }
}

impl Validator for BlockList {
    fn is_invalid(&self, hash: &ContentHash) -> bool {
        self.hashes.lock().contains(hash)
    }

    fn is_dangerous(&self, path: &Path) -> bool {
        self.paths.lock().contains(path)
    }
}

/// Records every event delivered to one listener.
pub(crate) struct EventLog<E = LibraryEvent> {
    events: Arc<Mutex<Vec<E>>>,
}

impl<E: Clone + Send + 'static> EventLog<E> {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn recorder(&self) -> impl Fn(&E) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |event: &E| events.lock().push(event.clone())
    }

    pub(crate) fn events(&self) -> Vec<E> {
        self.events.lock().clone()
    }
}

impl EventLog<LibraryEvent> {
    pub(crate) fn attach(library: &Library) -> Self {
        let log = Self::new();
        library.add_listener(log.recorder());
        log
    }

    pub(crate) fn added(&self) -> Vec<PathBuf> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                LibraryEvent::Added(entry) => Some(entry.path().to_path_buf()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn changed(&self) -> Vec<(SlotIndex, SlotIndex)> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                LibraryEvent::Changed { old, new } => Some((old.index(), new.index())),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn failures(&self) -> Vec<FailureReason> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                LibraryEvent::AddFailed { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect()
    }
}

impl EventLog<ViewEvent> {
    pub(crate) fn watch_collection(collection: &Collection) -> Self {
        let log = Self::new();
        collection.add_listener(log.recorder());
        log
    }

    pub(crate) fn watch_union(view: &UnionView) -> Self {
        let log = Self::new();
        view.add_listener(log.recorder());
        log
    }

    pub(crate) fn added(&self) -> Vec<SlotIndex> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                ViewEvent::Added(entry) => Some(entry.index()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn removed(&self) -> Vec<SlotIndex> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                ViewEvent::Removed(entry) => Some(entry.index()),
                _ => None,
            })
            .collect()
    }
}

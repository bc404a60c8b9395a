//! Full rescans and load-completion tracking.
//!
//! A rescan moves the library to a new revision, empties it and re-admits
//! every managed path. Each re-admission holds a [`LoadTicket`]; the rescan
//! itself holds one more until every admission was started. Whoever drops
//! the last ticket of a revision finishes the load, which happens exactly
//! once no matter which thread gets there.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::admission::{AdmissionHandle, AdmissionKind};
use super::{Library, LibraryShared};
use crate::events::LibraryEvent;
use crate::types::EntryMetadata;

#[derive(Debug, Default)]
pub(super) struct LoadTracker {
    state: Mutex<LoadState>,
}

#[derive(Debug, Default)]
struct LoadState {
    finished_revision: Option<u64>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl LoadTracker {
    fn start(&self) {
        self.state.lock().started_at = Some(Utc::now());
    }

    /// Returns false if `revision` already finished.
    fn finish(&self, revision: u64) -> bool {
        let mut state = self.state.lock();
        if state.finished_revision == Some(revision) {
            return false;
        }
        state.finished_revision = Some(revision);
        state.finished_at = Some(Utc::now());
        true
    }

    pub(super) fn is_finished(&self, revision: u64) -> bool {
        self.state.lock().finished_revision == Some(revision)
    }

    pub(super) fn timestamps(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let state = self.state.lock();
        (state.started_at, state.finished_at)
    }
}

/// Outstanding admissions of one revision.
struct LoadCounter {
    revision: u64,
    remaining: AtomicUsize,
}

impl LoadCounter {
    fn ticket(self: &Arc<Self>, library: &Library) -> LoadTicket {
        self.remaining.fetch_add(1, Ordering::AcqRel);
        LoadTicket {
            counter: Arc::clone(self),
            library: Arc::downgrade(&library.shared),
        }
    }
}

/// One unit of load work. Dropping it marks the work done.
pub(crate) struct LoadTicket {
    counter: Arc<LoadCounter>,
    library: Weak<LibraryShared>,
}

impl Drop for LoadTicket {
    fn drop(&mut self) {
        if self.counter.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some(shared) = self.library.upgrade() {
            Library { shared }.finish_load(self.counter.revision);
        }
    }
}

impl Library {
    /// Starts a new revision and reloads every managed path.
    ///
    /// Admissions still in flight from the previous revision fail with
    /// `RevisionChanged`. Returns one handle per managed path.
    pub fn rescan(&self) -> Vec<AdmissionHandle> {
        let revision = {
            let mut state = self.shared.state.write();
            let revision = self.shared.revisions.next_revision();
            state.clear();
            self.shared.events.enqueue(LibraryEvent::Cleared);
            self.shared
                .events
                .enqueue(LibraryEvent::LoadStarted { revision });
            revision
        };
        self.shared.load.start();
        self.shared.events.flush();

        // Read after the revision moved on, so an admission superseded by
        // this rescan has already recorded its path.
        let mut paths = self.shared.store.managed_paths();
        paths.sort();
        paths.dedup();
        log::info!(
            "library revision {} started, loading {} managed paths",
            revision,
            paths.len()
        );

        let counter = Arc::new(LoadCounter {
            revision,
            remaining: AtomicUsize::new(0),
        });
        let loader = counter.ticket(self);
        let handles = paths
            .iter()
            .map(|path| {
                self.begin_admission(
                    path,
                    EntryMetadata::default(),
                    AdmissionKind::Load,
                    Some(counter.ticket(self)),
                )
            })
            .collect();
        drop(loader);
        handles
    }

    fn finish_load(&self, revision: u64) {
        if self.revision() != revision {
            log::info!("load of revision {} was superseded", revision);
            return;
        }
        let events = &self.shared.events;
        events.publish(LibraryEvent::LoadFinishing { revision });
        if let Err(err) = self.shared.store.save() {
            log::warn!("failed to save managed paths: {}", err);
        }
        events.publish(LibraryEvent::Saved);
        if self.shared.load.finish(revision) {
            log::info!(
                "library revision {} loaded with {} entries",
                revision,
                self.len()
            );
            events.publish(LibraryEvent::LoadComplete { revision });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AdmissionError, Result};
    use crate::services::{HashService, ManagedStore, MemoryManagedStore};
    use crate::testing::{touch, EventLog, ScriptedHasher};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn build(hasher: &Arc<ScriptedHasher>, store: &Arc<MemoryManagedStore>) -> Library {
        Library::builder(Arc::clone(hasher) as Arc<dyn HashService>)
            .store(Arc::clone(store) as Arc<dyn ManagedStore>)
            .build()
            .expect("library")
    }

    fn load_complete_count(log: &EventLog) -> usize {
        log.events()
            .iter()
            .filter(|event| matches!(event, LibraryEvent::LoadComplete { .. }))
            .count()
    }

    #[tokio::test]
    async fn rescan_reloads_managed_paths_once() {
        let dir = TempDir::new().expect("tempdir");
        let paths: Vec<PathBuf> = ["a.txt", "b.txt", "c.txt"]
            .iter()
            .map(|name| touch(&dir, name, name.as_bytes()))
            .collect();
        let hasher = Arc::new(ScriptedHasher::new());
        let store = Arc::new(MemoryManagedStore::with_paths(paths.clone()));
        let library = build(&hasher, &store);
        let log = EventLog::attach(&library);

        for handle in library.rescan() {
            handle.await.expect("load");
        }
        assert_eq!(library.revision(), 1);
        assert_eq!(library.len(), 3);
        assert!(library.is_load_finished());
        assert_eq!(load_complete_count(&log), 1);
        assert_eq!(store.save_count(), 1);

        let events = log.events();
        assert!(matches!(events.first(), Some(LibraryEvent::Cleared)));
        let tail: Vec<&LibraryEvent> = events.iter().rev().take(3).collect();
        assert!(matches!(tail[0], LibraryEvent::LoadComplete { revision: 1 }));
        assert!(matches!(tail[1], LibraryEvent::Saved));
        assert!(matches!(tail[2], LibraryEvent::LoadFinishing { revision: 1 }));

        let status = library.status();
        assert!(status.load_finished);
        assert!(status.load_started_at.is_some());
        assert!(status.load_finished_at.is_some());
    }

    #[tokio::test]
    async fn rescan_of_empty_store_completes_immediately() {
        let hasher = Arc::new(ScriptedHasher::new());
        let store = Arc::new(MemoryManagedStore::new());
        let library = build(&hasher, &store);
        let log = EventLog::attach(&library);

        assert!(library.rescan().is_empty());
        assert!(library.is_load_finished());
        assert_eq!(load_complete_count(&log), 1);
    }

    #[tokio::test]
    async fn slot_indices_stay_monotonic_across_rescans() {
        let dir = TempDir::new().expect("tempdir");
        let path = touch(&dir, "a.txt", b"a");
        let hasher = Arc::new(ScriptedHasher::new());
        let store = Arc::new(MemoryManagedStore::new());
        let library = build(&hasher, &store);

        let before = library.admit(&path).await.expect("admit");
        let handles = library.rescan();
        assert!(library.get_by_index(before.index()).is_none());
        let mut after = Vec::new();
        for handle in handles {
            after.push(handle.await.expect("reload"));
        }
        assert_eq!(after.len(), 1);
        assert!(after[0].index() > before.index());
    }

    #[tokio::test]
    async fn unloadable_paths_stop_being_managed() {
        let dir = TempDir::new().expect("tempdir");
        let good = touch(&dir, "good.txt", b"g");
        let gone = dir.path().join("gone.txt");
        let program = touch(&dir, "tool.exe", b"MZ");
        let hasher = Arc::new(ScriptedHasher::new());
        let store = Arc::new(MemoryManagedStore::with_paths([
            good.clone(),
            gone.clone(),
            program.clone(),
        ]));
        let library = build(&hasher, &store);

        let mut failures = 0;
        for handle in library.rescan() {
            if handle.await.is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
        assert_eq!(store.managed_paths(), vec![good]);
        assert!(library.is_load_finished());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rescan_discards_every_in_flight_admission() {
        const IN_FLIGHT: usize = 5;
        let dir = TempDir::new().expect("tempdir");
        let hasher = Arc::new(ScriptedHasher::gated());
        let store = Arc::new(MemoryManagedStore::new());
        let library = build(&hasher, &store);
        let log = EventLog::attach(&library);

        let stale: Vec<AdmissionHandle> = (0..IN_FLIGHT)
            .map(|i| library.admit(touch(&dir, &format!("f{i}.txt"), b"data")))
            .collect();
        hasher.wait_for_calls(IN_FLIGHT).await;

        let reload = library.rescan();
        assert_eq!(reload.len(), IN_FLIGHT);

        let mut revision_changed = 0;
        for handle in stale {
            match handle.await {
                Err(AdmissionError::RevisionChanged { started: 0, current: 1, .. }) => {
                    revision_changed += 1
                }
                other => panic!("expected RevisionChanged, got {other:?}"),
            }
        }
        assert_eq!(revision_changed, IN_FLIGHT);
        assert!(library.is_empty(), "stale work must not admit into the new revision");

        hasher.release(IN_FLIGHT * 2);
        for handle in reload {
            let entry = handle.await.expect("reload");
            assert!(library.contains_index(entry.index()));
        }
        assert_eq!(library.len(), IN_FLIGHT);
        assert_eq!(load_complete_count(&log), 1);
        assert!(log
            .failures()
            .iter()
            .all(|reason| *reason == crate::error::FailureReason::RevisionChanged));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn superseded_rescan_never_completes() {
        let dir = TempDir::new().expect("tempdir");
        let path = touch(&dir, "a.txt", b"a");
        let hasher = Arc::new(ScriptedHasher::gated());
        let store = Arc::new(MemoryManagedStore::with_paths([path]));
        let library = build(&hasher, &store);
        let log = EventLog::attach(&library);

        let first = library.rescan();
        hasher.wait_for_calls(1).await;
        let second = library.rescan();
        for handle in first {
            assert!(matches!(handle.await, Err(AdmissionError::RevisionChanged { .. })));
        }
        hasher.release(4);
        for handle in second {
            handle.await.expect("second load");
        }
        let completed: Vec<u64> = log
            .events()
            .iter()
            .filter_map(|event| match event {
                LibraryEvent::LoadComplete { revision } => Some(*revision),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec![2]);
    }

    /// Store that admits one more path right after a rescan reads it.
    struct AdmittingStore {
        inner: MemoryManagedStore,
        late: PathBuf,
        library: Mutex<Option<Library>>,
        handle: Mutex<Option<AdmissionHandle>>,
    }

    impl ManagedStore for AdmittingStore {
        fn managed_paths(&self) -> Vec<PathBuf> {
            let paths = self.inner.managed_paths();
            let library = self.library.lock().take();
            if let Some(library) = library {
                *self.handle.lock() = Some(library.admit(&self.late));
            }
            paths
        }

        fn record_managed(&self, path: &Path, managed: bool) -> Result<()> {
            self.inner.record_managed(path, managed)
        }
    }

    fn admitting_store(managed: Vec<PathBuf>, late: &Path) -> Arc<AdmittingStore> {
        Arc::new(AdmittingStore {
            inner: MemoryManagedStore::with_paths(managed),
            late: late.to_path_buf(),
            library: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    fn attach(store: &Arc<AdmittingStore>, hasher: &Arc<ScriptedHasher>) -> Library {
        let library = Library::builder(Arc::clone(hasher) as Arc<dyn HashService>)
            .store(Arc::clone(store) as Arc<dyn ManagedStore>)
            .build()
            .expect("library");
        *store.library.lock() = Some(library.clone());
        library
    }

    #[tokio::test]
    async fn admission_racing_a_rescan_start_is_kept() {
        let dir = TempDir::new().expect("tempdir");
        let existing = touch(&dir, "a.txt", b"a");
        let late = touch(&dir, "late.txt", b"late");
        let store = admitting_store(vec![existing.clone()], &late);
        let library = attach(&store, &Arc::new(ScriptedHasher::new()));

        let reload = library.rescan();
        assert_eq!(reload.len(), 1);
        for handle in reload {
            handle.await.expect("reload");
        }
        let racing = store.handle.lock().take().expect("admission started");
        let entry = racing.await.expect("racing admission survives the rescan");

        assert_eq!(entry.path(), late.as_path());
        assert!(library.contains_path(&existing));
        assert!(library.contains_path(&late));
        assert!(store.inner.contains(&late));
        assert_eq!(library.len(), 2);
    }

    #[tokio::test]
    async fn reload_joins_admission_of_the_same_revision() {
        let dir = TempDir::new().expect("tempdir");
        let late = touch(&dir, "late.txt", b"late");
        let store = admitting_store(vec![late.clone()], &late);
        let hasher = Arc::new(ScriptedHasher::new());
        let library = attach(&store, &hasher);
        let log = EventLog::attach(&library);

        let reload = library.rescan();
        let racing = store.handle.lock().take().expect("admission started");
        let winner = racing.await.expect("admitted");
        for handle in reload {
            match handle.await {
                Err(AdmissionError::AlreadyManaged(entry)) => assert!(Arc::ptr_eq(&entry, &winner)),
                other => panic!("expected AlreadyManaged, got {other:?}"),
            }
        }
        assert_eq!(hasher.calls(), 1);
        assert!(library.is_load_finished());
        assert_eq!(load_complete_count(&log), 1);
    }
}

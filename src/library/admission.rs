//! Asynchronous admission pipeline.
//!
//! `Validating -> Hashing -> Finalizing -> Admitted | Failed`. Validation runs
//! on the caller's thread. Hashing is the only suspension point and runs as a
//! spawned task that is interrupted when the revision moves on. Finalization
//! runs on the blocking pool and re-checks the revision and the path under the
//! write lock before a slot is allocated.

use std::fmt;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::rescan::LoadTicket;
use super::Library;
use crate::cancel::RevisionToken;
use crate::config::Manageability;
use crate::error::{canonicalize_existing_path, AdmissionError, FailureReason};
use crate::events::LibraryEvent;
use crate::services::warn_on_store_error;
use crate::storage::{EntryRef, FileFacts};
use crate::types::{ContentHash, EntryMetadata};

pub type AdmissionResult = Result<EntryRef, AdmissionError>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type CheckedHashes = Result<Vec<ContentHash>, AdmissionError>;

/// Resolves when an admission, rename or change finishes.
///
/// The work runs whether or not the handle is awaited.
pub struct AdmissionHandle {
    path: PathBuf,
    inner: BoxFuture<AdmissionResult>,
}

impl AdmissionHandle {
    pub(crate) fn ready(path: PathBuf, result: AdmissionResult) -> Self {
        Self {
            path,
            inner: Box::pin(std::future::ready(result)),
        }
    }

    pub(crate) fn from_receiver(path: PathBuf, receiver: oneshot::Receiver<AdmissionResult>) -> Self {
        let fallback = path.clone();
        Self {
            path,
            inner: Box::pin(async move {
                receiver
                    .await
                    .unwrap_or(Err(AdmissionError::CantCreateEntry(fallback)))
            }),
        }
    }

    /// The path being admitted, canonical once validation passed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn map_result<F>(self, f: F) -> Self
    where
        F: FnOnce(AdmissionResult) -> AdmissionResult + Send + 'static,
    {
        let Self { path, inner } = self;
        Self {
            path,
            inner: Box::pin(async move { f(inner.await) }),
        }
    }

    /// Treats `AlreadyManaged` as success with the converged entry.
    pub fn converge(self) -> Self {
        self.map_result(|result| match result {
            Err(AdmissionError::AlreadyManaged(entry)) => Ok(entry),
            other => other,
        })
    }
}

impl Future for AdmissionHandle {
    type Output = AdmissionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for AdmissionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// What a finished admission reports as.
pub(crate) enum AdmissionKind {
    Add,
    /// Rename or content change; `old` was already detached.
    Change { old: EntryRef },
    /// Re-admission of a managed path during a rescan.
    Load,
}

/// An admission waiting for its hash. Later admissions of the same path in
/// the same revision wait on it instead of hashing again.
pub(crate) struct PendingAdmission {
    revision: u64,
    waiters: Mutex<Vec<Waiter>>,
}

struct Waiter {
    reply: oneshot::Sender<AdmissionResult>,
    ticket: Option<LoadTicket>,
}

struct AdmissionJob {
    facts: FileFacts,
    kind: AdmissionKind,
    token: RevisionToken,
    pending: Arc<PendingAdmission>,
    reply: oneshot::Sender<AdmissionResult>,
    ticket: Option<LoadTicket>,
}

enum Hashed {
    Computed(io::Result<Vec<ContentHash>>),
    Superseded,
}

enum Start {
    Rejected(AdmissionError),
    Joined(oneshot::Receiver<AdmissionResult>),
    Started(Arc<PendingAdmission>, RevisionToken),
}

impl Library {
    /// Admits `path` with default metadata.
    pub fn admit(&self, path: impl AsRef<Path>) -> AdmissionHandle {
        self.admit_with(path, EntryMetadata::default())
    }

    pub fn admit_with(&self, path: impl AsRef<Path>, metadata: EntryMetadata) -> AdmissionHandle {
        self.begin_admission(path.as_ref(), metadata, AdmissionKind::Add, None)
    }

    /// Moves an entry to a new path.
    ///
    /// The old entry is dropped at once and the new path is admitted from
    /// scratch, with the old hashes offered to the hash service as a hint.
    /// Success is reported as `Changed`; failure as `ChangeFailed` followed by
    /// `Removed` for the old entry.
    pub fn rename(&self, old_path: impl AsRef<Path>, new_path: impl AsRef<Path>) -> AdmissionHandle {
        let (old_path, new_path) = (old_path.as_ref(), new_path.as_ref());
        let Some(old) = self.detach(old_path) else {
            return self.fail_unmanaged_change(old_path, new_path);
        };
        warn_on_store_error(
            self.shared.store.record_managed(old.path(), false),
            "unmanage",
            old.path(),
        );
        self.shared
            .hasher
            .prime(&canonicalize_existing_path(new_path), &old.hashes());
        log::debug!("renaming {} to {}", old.path().display(), new_path.display());
        let metadata = EntryMetadata::with_flags(old.flags());
        self.begin_admission(new_path, metadata, AdmissionKind::Change { old }, None)
    }

    /// Re-hashes a file whose content changed on disk.
    pub fn file_changed(&self, path: impl AsRef<Path>) -> AdmissionHandle {
        let path = path.as_ref();
        let Some(old) = self.detach(path) else {
            return self.fail_unmanaged_change(path, path);
        };
        self.shared.hasher.forget(old.path());
        let metadata = EntryMetadata::with_flags(old.flags());
        let new_path = old.path().to_path_buf();
        self.begin_admission(&new_path, metadata, AdmissionKind::Change { old }, None)
    }

    fn fail_unmanaged_change(&self, old_path: &Path, new_path: &Path) -> AdmissionHandle {
        self.shared.events.publish(LibraryEvent::ChangeFailed {
            old: None,
            new_path: new_path.to_path_buf(),
            reason: FailureReason::OldEntryWasntManaged,
        });
        AdmissionHandle::ready(
            new_path.to_path_buf(),
            Err(AdmissionError::OldEntryWasntManaged(old_path.to_path_buf())),
        )
    }

    pub(crate) fn begin_admission(
        &self,
        path: &Path,
        metadata: EntryMetadata,
        kind: AdmissionKind,
        mut ticket: Option<LoadTicket>,
    ) -> AdmissionHandle {
        let canonical = match fs::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(err) => {
                log::debug!("cannot canonicalize {}: {}", path.display(), err);
                let error = AdmissionError::CantCanonicalize(path.to_path_buf());
                return self.fail_early(path.to_path_buf(), &kind, error);
            }
        };
        let file_meta = fs::metadata(&canonical).ok();
        let verdict = self.shared.config.manageability(&canonical, file_meta.as_ref());
        // Recorded before the revision is captured, so a rescan that
        // supersedes this admission finds the path in the store.
        if verdict == Manageability::Manageable && !matches!(kind, AdmissionKind::Load) {
            warn_on_store_error(
                self.shared.store.record_managed(&canonical, true),
                "record managed",
                &canonical,
            );
        }

        let start = {
            let mut state = self.shared.state.write();
            let revision = self.shared.revisions.current_revision();
            // A change must report its own outcome, so it never joins.
            let may_join = !matches!(kind, AdmissionKind::Change { .. });
            if let Some(existing) = state.entry_at_path(&canonical) {
                Start::Rejected(AdmissionError::AlreadyManaged(existing))
            } else if let Some(pending) = state
                .pending
                .get(&canonical)
                .filter(|pending| may_join && pending.revision == revision)
            {
                let (reply, receiver) = oneshot::channel();
                pending.waiters.lock().push(Waiter {
                    reply,
                    ticket: ticket.take(),
                });
                Start::Joined(receiver)
            } else {
                match verdict {
                    Manageability::NotManageable => {
                        Start::Rejected(AdmissionError::NotManageable(canonical.clone()))
                    }
                    Manageability::PolicyRejected => {
                        Start::Rejected(AdmissionError::PolicyRejected(canonical.clone()))
                    }
                    Manageability::Manageable => {
                        let pending = Arc::new(PendingAdmission {
                            revision,
                            waiters: Mutex::new(Vec::new()),
                        });
                        state.pending.insert(canonical.clone(), Arc::clone(&pending));
                        Start::Started(pending, self.shared.revisions.token_for_revision(revision))
                    }
                }
            }
        };

        let (pending, token) = match start {
            Start::Rejected(error) => return self.fail_early(canonical, &kind, error),
            Start::Joined(receiver) => {
                log::debug!("joining in-flight admission of {}", canonical.display());
                return AdmissionHandle::from_receiver(canonical, receiver);
            }
            Start::Started(pending, token) => (pending, token),
        };

        // Manageable implies the metadata was readable.
        let (size, modified) = file_meta
            .map(|meta| (meta.len(), meta.modified().ok().map(DateTime::<Utc>::from)))
            .unwrap_or((0, None));
        let facts = FileFacts {
            path: canonical.clone(),
            size,
            modified,
            flags: metadata.flags,
        };

        let (reply, receiver) = oneshot::channel();
        let job = AdmissionJob {
            facts,
            kind,
            token,
            pending,
            reply,
            ticket,
        };
        let library = self.clone();
        let hasher = Arc::clone(&self.shared.hasher);
        self.shared.runtime.spawn(async move {
            let hashed = tokio::select! {
                result = hasher.compute(&job.facts.path) => Hashed::Computed(result),
                _ = job.token.superseded() => Hashed::Superseded,
            };
            let finalizer = library.clone();
            if let Err(err) =
                tokio::task::spawn_blocking(move || finalizer.finalize(job, hashed)).await
            {
                log::warn!("admission finalizer failed: {}", err);
            }
        });
        AdmissionHandle::from_receiver(canonical, receiver)
    }

    fn fail_early(&self, path: PathBuf, kind: &AdmissionKind, error: AdmissionError) -> AdmissionHandle {
        log::debug!("admission of {} failed early: {}", path.display(), error);
        self.enqueue_failure(&path, kind, &error);
        self.shared.events.flush();
        self.after_failure(&path, &error);
        AdmissionHandle::ready(path, Err(error))
    }

    fn enqueue_failure(&self, path: &Path, kind: &AdmissionKind, error: &AdmissionError) {
        let reason = error.reason();
        let events = &self.shared.events;
        match kind {
            AdmissionKind::Add | AdmissionKind::Load => events.enqueue(LibraryEvent::AddFailed {
                path: path.to_path_buf(),
                reason,
                existing: error.existing().cloned(),
            }),
            AdmissionKind::Change { old } => {
                events.enqueue(LibraryEvent::ChangeFailed {
                    old: Some(Arc::clone(old)),
                    new_path: path.to_path_buf(),
                    reason,
                });
                events.enqueue(LibraryEvent::Removed(Arc::clone(old)));
            }
        }
    }

    /// Paths that can never load stop being managed.
    fn after_failure(&self, path: &Path, error: &AdmissionError) {
        if error.reason().is_permanent() {
            warn_on_store_error(
                self.shared.store.record_managed(path, false),
                "unmanage",
                path,
            );
        }
    }

    /// Validator checks, run before the write lock is taken.
    fn check_hashes(&self, path: &Path, hashes: Vec<ContentHash>) -> CheckedHashes {
        let Some(primary) = ContentHash::primary_of(&hashes) else {
            return Err(AdmissionError::CantCreateEntry(path.to_path_buf()));
        };
        if self.shared.validator.is_invalid(primary) {
            return Err(AdmissionError::CantCreateEntry(path.to_path_buf()));
        }
        if self.shared.validator.is_dangerous(path) {
            return Err(AdmissionError::DangerousFile(path.to_path_buf()));
        }
        Ok(hashes)
    }

    fn finalize(&self, job: AdmissionJob, hashed: Hashed) {
        let AdmissionJob {
            facts,
            kind,
            token,
            pending,
            reply,
            ticket,
        } = job;
        let path = facts.path.clone();
        let checked = match hashed {
            Hashed::Computed(Ok(hashes)) => self.check_hashes(&path, hashes),
            Hashed::Computed(Err(err)) => Err(AdmissionError::ErrorComputingHash {
                path: path.clone(),
                message: err.to_string(),
            }),
            Hashed::Superseded => Err(AdmissionError::RevisionChanged {
                path: path.clone(),
                started: token.revision(),
                current: token.current_revision(),
            }),
        };

        let (outcome, waiters) = {
            let mut state = self.shared.state.write();
            if state
                .pending
                .get(&path)
                .is_some_and(|current| Arc::ptr_eq(current, &pending))
            {
                state.pending.remove(&path);
            }
            let waiters = std::mem::take(&mut *pending.waiters.lock());

            let current = self.shared.revisions.current_revision();
            let outcome = if current != token.revision() {
                Err(AdmissionError::RevisionChanged {
                    path: path.clone(),
                    started: token.revision(),
                    current,
                })
            } else if let Some(existing) = state.entry_at_path(&path) {
                Err(AdmissionError::AlreadyManaged(existing))
            } else {
                checked.and_then(|hashes| {
                    state
                        .insert(facts, &hashes)
                        .ok_or_else(|| AdmissionError::CantCreateEntry(path.clone()))
                })
            };

            match (&outcome, &kind) {
                (Ok(entry), AdmissionKind::Change { old }) => {
                    self.shared.events.enqueue(LibraryEvent::Changed {
                        old: Arc::clone(old),
                        new: Arc::clone(entry),
                    })
                }
                (Ok(entry), _) => self
                    .shared
                    .events
                    .enqueue(LibraryEvent::Added(Arc::clone(entry))),
                (Err(error), kind) => self.enqueue_failure(&path, kind, error),
            }
            (outcome, waiters)
        };
        self.shared.events.flush();

        match &outcome {
            Ok(entry) => log::debug!("admitted {} at slot {}", path.display(), entry.index()),
            Err(error @ AdmissionError::RevisionChanged { .. }) => {
                log::debug!("dropping stale admission: {}", error)
            }
            Err(error) => {
                log::debug!("admission failed: {}", error);
                self.after_failure(&path, error);
            }
        }

        // Load bookkeeping settles before anyone observes the result, so the
        // last handle of a rescan resolves after LoadComplete.
        let (replies, tickets): (Vec<_>, Vec<_>) = waiters
            .into_iter()
            .map(|waiter| (waiter.reply, waiter.ticket))
            .unzip();
        drop(tickets);
        drop(ticket);

        for waiter in replies {
            let joined = match &outcome {
                Ok(entry) => Err(AdmissionError::AlreadyManaged(Arc::clone(entry))),
                Err(error) => Err(error.clone()),
            };
            let _ = waiter.send(joined);
        }
        let _ = reply.send(outcome);
    }
}

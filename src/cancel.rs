//! Library revisions for discarding superseded work.
//!
//! Every full rescan moves the library to a new revision. Work started under
//! an older revision holds a [`RevisionToken`] and checks it at each
//! resumption point; once the token is stale the work is dropped.
//!
//! Besides polling, a token can be awaited with [`RevisionToken::superseded`],
//! which lets a suspended hash computation be interrupted as soon as a rescan
//! starts instead of only when it finishes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Tracks the active library revision.
#[derive(Debug)]
pub struct RevisionTracker {
    active_revision: AtomicU64,
    notify: watch::Sender<u64>,
}

impl Default for RevisionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RevisionTracker {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            active_revision: AtomicU64::new(0),
            notify,
        }
    }

    /// Increments the active revision and returns the new revision number.
    ///
    /// Every token created for an older revision becomes stale.
    pub fn next_revision(&self) -> u64 {
        let next = self.active_revision.fetch_add(1, Ordering::SeqCst) + 1;
        // Two concurrent bumps may publish out of order; keep the largest.
        self.notify.send_modify(|published| *published = (*published).max(next));
        next
    }

    /// Returns the current revision without incrementing.
    pub fn current_revision(&self) -> u64 {
        self.active_revision.load(Ordering::SeqCst)
    }

    /// Creates a token bound to the current revision.
    pub fn token(self: &Arc<Self>) -> RevisionToken {
        self.token_for_revision(self.current_revision())
    }

    /// Creates a token bound to `revision`, which may already be stale.
    pub fn token_for_revision(self: &Arc<Self>, revision: u64) -> RevisionToken {
        RevisionToken {
            tracker: Arc::clone(self),
            revision,
        }
    }
}

/// Generation guard captured when a unit of work starts.
#[derive(Clone, Debug)]
pub struct RevisionToken {
    tracker: Arc<RevisionTracker>,
    revision: u64,
}

impl RevisionToken {
    /// The revision this token was created with.
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The library's revision right now.
    #[inline]
    pub fn current_revision(&self) -> u64 {
        self.tracker.current_revision()
    }

    #[inline]
    pub fn is_current(&self) -> bool {
        self.revision == self.tracker.current_revision()
    }

    /// Returns `Some(())` while the token is current, `None` once superseded.
    ///
    /// This enables use with the `?` operator for early returns.
    #[inline]
    pub fn still_current(&self) -> Option<()> {
        self.is_current().then_some(())
    }

    /// Resolves once the library has moved past this token's revision.
    pub async fn superseded(&self) {
        let mut receiver = self.tracker.notify.subscribe();
        let revision = self.revision;
        // The sender lives in the tracker this token keeps alive, so the
        // channel cannot close underneath us.
        let _ = receiver.wait_for(|published| *published != revision).await;
    }
}

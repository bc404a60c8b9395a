//! Collaborators the library consumes but does not implement.
//!
//! Hash computation, validity checks and persistence of the managed/member
//! decisions are supplied by the embedding application. In-memory versions of
//! the stores are provided for callers that do not persist anything.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::types::ContentHash;

/// Computes content hashes for a file.
#[async_trait]
pub trait HashService: Send + Sync {
    /// Returns every hash the service knows how to compute. An empty set is
    /// treated as an unusable file.
    async fn compute(&self, path: &Path) -> io::Result<Vec<ContentHash>>;

    /// Hint that `path` is expected to have `hashes` (used on rename).
    /// Services may cache it; the library never trusts it blindly.
    fn prime(&self, _path: &Path, _hashes: &[ContentHash]) {}

    /// Drops anything cached for `path` (its content changed).
    fn forget(&self, _path: &Path) {}
}

/// Synchronous checks consulted when an admission is finalized.
pub trait Validator: Send + Sync {
    fn is_invalid(&self, hash: &ContentHash) -> bool;

    /// May block.
    fn is_dangerous(&self, path: &Path) -> bool;
}

/// Validator that accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveValidator;

impl Validator for PermissiveValidator {
    fn is_invalid(&self, _hash: &ContentHash) -> bool {
        false
    }

    fn is_dangerous(&self, _path: &Path) -> bool {
        false
    }
}

/// Persists which paths the library manages. Source of paths for a rescan.
pub trait ManagedStore: Send + Sync {
    fn managed_paths(&self) -> Vec<PathBuf>;

    /// Must be idempotent.
    fn record_managed(&self, path: &Path, managed: bool) -> Result<()>;

    /// Called once a rescan has loaded every managed path.
    fn save(&self) -> Result<()> {
        Ok(())
    }
}

/// Persists one collection's membership decisions.
pub trait MembershipStore: Send + Sync {
    fn is_member(&self, path: &Path) -> bool;

    /// Must be idempotent; called both optimistically and to roll back.
    fn record_membership(&self, path: &Path, member: bool) -> Result<()>;

    fn members(&self) -> Vec<PathBuf>;
}

/// Store failures never undo an in-memory mutation; they are only logged.
pub(crate) fn warn_on_store_error(result: Result<()>, action: &str, path: &Path) {
    if let Err(err) = result {
        log::warn!("failed to {} {}: {}", action, path.display(), err);
    }
}

/// [`ManagedStore`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryManagedStore {
    paths: Mutex<BTreeSet<PathBuf>>,
    saves: Mutex<usize>,
}

impl MemoryManagedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: Mutex::new(paths.into_iter().map(Into::into).collect()),
            saves: Mutex::new(0),
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.lock().contains(path)
    }

    /// How many times [`ManagedStore::save`] ran.
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl ManagedStore for MemoryManagedStore {
    fn managed_paths(&self) -> Vec<PathBuf> {
        self.paths.lock().iter().cloned().collect()
    }

    fn record_managed(&self, path: &Path, managed: bool) -> Result<()> {
        let mut paths = self.paths.lock();
        if managed {
            paths.insert(path.to_path_buf());
        } else {
            paths.remove(path);
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        *self.saves.lock() += 1;
        Ok(())
    }
}

/// [`MembershipStore`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryMembershipStore {
    members: Mutex<BTreeSet<PathBuf>>,
}

impl MemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MembershipStore for MemoryMembershipStore {
    fn is_member(&self, path: &Path) -> bool {
        self.members.lock().contains(path)
    }

    fn record_membership(&self, path: &Path, member: bool) -> Result<()> {
        let mut members = self.members.lock();
        if member {
            members.insert(path.to_path_buf());
        } else {
            members.remove(path);
        }
        Ok(())
    }

    fn members(&self) -> Vec<PathBuf> {
        self.members.lock().iter().cloned().collect()
    }
}

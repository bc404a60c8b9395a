use std::fs;
use std::path::{Path, PathBuf};

use crate::storage::EntryRef;

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no tokio runtime available to drive the library")]
    NoRuntime,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, LibraryError>;

/// Why an admission, rename or change did not produce an entry.
///
/// This is the copyable tag carried by failure events; [`AdmissionError`]
/// carries the same information plus context for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    CantCanonicalize,
    NotManageable,
    PolicyRejected,
    AlreadyManaged,
    RevisionChanged,
    CantCreateEntry,
    ErrorComputingHash,
    DangerousFile,
    OldEntryWasntManaged,
    CantAddToCollection,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CantCanonicalize => "cant_canonicalize",
            Self::NotManageable => "not_manageable",
            Self::PolicyRejected => "policy_rejected",
            Self::AlreadyManaged => "already_managed",
            Self::RevisionChanged => "revision_changed",
            Self::CantCreateEntry => "cant_create_entry",
            Self::ErrorComputingHash => "error_computing_hash",
            Self::DangerousFile => "dangerous_file",
            Self::OldEntryWasntManaged => "old_entry_wasnt_managed",
            Self::CantAddToCollection => "cant_add_to_collection",
        }
    }

    /// True when the file itself can never become an entry, so a persisted
    /// "managed" decision for it should be dropped.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            Self::CantCanonicalize | Self::CantCreateEntry | Self::NotManageable | Self::PolicyRejected
        )
    }
}

/// Failure result of an admission handle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    #[error("cannot canonicalize {0}")]
    CantCanonicalize(PathBuf),

    #[error("not a manageable file: {0}")]
    NotManageable(PathBuf),

    #[error("rejected by library policy: {0}")]
    PolicyRejected(PathBuf),

    #[error("already managed: {}", .0.path().display())]
    AlreadyManaged(EntryRef),

    #[error("library revision changed from {started} to {current} while loading {path}")]
    RevisionChanged {
        path: PathBuf,
        started: u64,
        current: u64,
    },

    #[error("cannot create entry for {0}")]
    CantCreateEntry(PathBuf),

    #[error("hashing {path} failed: {message}")]
    ErrorComputingHash { path: PathBuf, message: String },

    #[error("dangerous file: {0}")]
    DangerousFile(PathBuf),

    #[error("old entry wasn't managed: {0}")]
    OldEntryWasntManaged(PathBuf),

    #[error("collection refused {0}")]
    CantAddToCollection(PathBuf),
}

impl AdmissionError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::CantCanonicalize(_) => FailureReason::CantCanonicalize,
            Self::NotManageable(_) => FailureReason::NotManageable,
            Self::PolicyRejected(_) => FailureReason::PolicyRejected,
            Self::AlreadyManaged(_) => FailureReason::AlreadyManaged,
            Self::RevisionChanged { .. } => FailureReason::RevisionChanged,
            Self::CantCreateEntry(_) => FailureReason::CantCreateEntry,
            Self::ErrorComputingHash { .. } => FailureReason::ErrorComputingHash,
            Self::DangerousFile(_) => FailureReason::DangerousFile,
            Self::OldEntryWasntManaged(_) => FailureReason::OldEntryWasntManaged,
            Self::CantAddToCollection(_) => FailureReason::CantAddToCollection,
        }
    }

    /// The path the failed operation was about.
    pub fn path(&self) -> &Path {
        match self {
            Self::AlreadyManaged(entry) => entry.path(),
            Self::CantCanonicalize(path)
            | Self::NotManageable(path)
            | Self::PolicyRejected(path)
            | Self::CantCreateEntry(path)
            | Self::DangerousFile(path)
            | Self::OldEntryWasntManaged(path)
            | Self::CantAddToCollection(path) => path,
            Self::RevisionChanged { path, .. } | Self::ErrorComputingHash { path, .. } => path,
        }
    }

    /// The entry a duplicate admission converged on.
    pub fn existing(&self) -> Option<&EntryRef> {
        match self {
            Self::AlreadyManaged(entry) => Some(entry),
            _ => None,
        }
    }
}

/// Canonicalizes a path, falling back to it unchanged if that fails.
pub fn canonicalize_existing_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

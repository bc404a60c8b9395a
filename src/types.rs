//! Value types shared across the library, its collections and views.

use std::fmt;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content digest identifying a file irrespective of its path.
///
/// SHA-1 is the primary identity every entry must have. Tiger tree roots are
/// auxiliary and may be attached to an entry after it was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "digest", rename_all = "lowercase")]
pub enum ContentHash {
    Sha1([u8; 20]),
    TigerTree([u8; 24]),
}

/// Hash algorithm of a [`ContentHash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    Sha1,
    TigerTree,
}

impl HashKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::TigerTree => "ttroot",
        }
    }
}

impl ContentHash {
    pub fn kind(&self) -> HashKind {
        match self {
            Self::Sha1(_) => HashKind::Sha1,
            Self::TigerTree(_) => HashKind::TigerTree,
        }
    }

    /// Whether this hash can serve as an entry's primary identity.
    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Sha1(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(digest) => digest,
            Self::TigerTree(digest) => digest,
        }
    }

    /// Picks the primary hash out of a computed hash set.
    pub fn primary_of<'a, I>(hashes: I) -> Option<&'a ContentHash>
    where
        I: IntoIterator<Item = &'a ContentHash>,
    {
        hashes.into_iter().find(|hash| hash.is_primary())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.kind().as_str())?;
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

bitflags! {
    /// Per-entry markers consulted by collection membership filters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct EntryFlags: u8 {
        /// Placeholder for a download that has not finished.
        const INCOMPLETE = 1 << 0;
        /// Purchased from the store; never shared with the network.
        const STORE_PURCHASE = 1 << 1;
    }
}

/// Caller-supplied metadata attached to an admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    pub flags: EntryFlags,
}

impl EntryMetadata {
    pub fn with_flags(flags: EntryFlags) -> Self {
        Self { flags }
    }
}

/// Identifier of a remote peer a collection can be shared with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Library status information.
#[derive(Debug, Clone, Serialize)]
pub struct LibraryStatus {
    /// Number of live entries.
    pub entries: usize,
    /// Current revision (bumped by each rescan).
    pub revision: u64,
    /// Admissions still waiting for a hash or finalization.
    pub pending_admissions: usize,
    /// Whether the current revision has finished loading.
    pub load_finished: bool,
    /// When the current revision's rescan started.
    pub load_started_at: Option<DateTime<Utc>>,
    /// When the last revision finished loading.
    pub load_finished_at: Option<DateTime<Utc>>,
}

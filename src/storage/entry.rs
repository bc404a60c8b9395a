//! Metadata record for one tracked file.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::index_types::SlotIndex;
use crate::types::{ContentHash, EntryFlags};

/// Shared handle to a live or formerly live entry.
pub type EntryRef = Arc<Entry>;

/// A file the library tracks.
///
/// Identity fields are immutable. Auxiliary hashes can only be added, and the
/// counters are plain atomics so bumping them never needs the library lock.
#[derive(Debug)]
pub struct Entry {
    index: SlotIndex,
    path: PathBuf,
    size: u64,
    modified: Option<DateTime<Utc>>,
    flags: EntryFlags,
    primary_hash: ContentHash,
    extra_hashes: RwLock<Vec<ContentHash>>,
    hits: AtomicU32,
    attempted_uploads: AtomicU32,
    completed_uploads: AtomicU32,
    share_count: AtomicU32,
}

/// File facts gathered before hashing.
#[derive(Debug, Clone)]
pub(crate) struct FileFacts {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub flags: EntryFlags,
}

impl Entry {
    /// Builds the entry for slot `index`; `None` without a primary hash.
    pub(crate) fn new(index: SlotIndex, facts: FileFacts, hashes: &[ContentHash]) -> Option<Self> {
        let primary_hash = *ContentHash::primary_of(hashes)?;
        let mut extra_hashes: Vec<ContentHash> = Vec::new();
        for hash in hashes {
            if !hash.is_primary() && !extra_hashes.contains(hash) {
                extra_hashes.push(*hash);
            }
        }
        Some(Self {
            index,
            path: facts.path,
            size: facts.size,
            modified: facts.modified,
            flags: facts.flags,
            primary_hash,
            extra_hashes: RwLock::new(extra_hashes),
            hits: AtomicU32::new(0),
            attempted_uploads: AtomicU32::new(0),
            completed_uploads: AtomicU32::new(0),
            share_count: AtomicU32::new(0),
        })
    }

    #[inline]
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> Option<&OsStr> {
        self.path.file_name()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    pub fn is_incomplete(&self) -> bool {
        self.flags.contains(EntryFlags::INCOMPLETE)
    }

    pub fn is_store_purchase(&self) -> bool {
        self.flags.contains(EntryFlags::STORE_PURCHASE)
    }

    pub fn primary_hash(&self) -> ContentHash {
        self.primary_hash
    }

    /// All hashes, primary first.
    pub fn hashes(&self) -> Vec<ContentHash> {
        let extra = self.extra_hashes.read();
        let mut hashes = Vec::with_capacity(extra.len() + 1);
        hashes.push(self.primary_hash);
        hashes.extend(extra.iter().copied());
        hashes
    }

    pub fn has_hash(&self, hash: &ContentHash) -> bool {
        self.primary_hash == *hash || self.extra_hashes.read().contains(hash)
    }

    /// Attaches an auxiliary hash. Primary-kind hashes are refused so the
    /// entry's identity cannot change after admission.
    pub fn add_hash(&self, hash: ContentHash) -> bool {
        if hash.is_primary() {
            return false;
        }
        let mut extra = self.extra_hashes.write();
        if extra.contains(&hash) {
            return false;
        }
        extra.push(hash);
        true
    }

    /// Records a query hit, returning the new count.
    pub fn increment_hits(&self) -> u32 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn hit_count(&self) -> u32 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn increment_attempted_uploads(&self) -> u32 {
        self.attempted_uploads.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn attempted_uploads(&self) -> u32 {
        self.attempted_uploads.load(Ordering::Relaxed)
    }

    pub fn increment_completed_uploads(&self) -> u32 {
        self.completed_uploads.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn completed_uploads(&self) -> u32 {
        self.completed_uploads.load(Ordering::Relaxed)
    }

    /// How many collections currently hold this entry.
    pub fn share_count(&self) -> u32 {
        self.share_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_share_count(&self) {
        self.share_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_share_count(&self) {
        let _ = self
            .share_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    }

    pub(crate) fn reset_share_count(&self) {
        self.share_count.store(0, Ordering::Release);
    }
}

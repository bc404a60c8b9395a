//! Library configuration.
//!
//! Passed explicitly to [`crate::Library::builder`]; the library keeps no
//! global settings.

use std::fs::Metadata;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Default upper bound for a manageable file (the wire protocol addresses
/// file offsets with 63 bits, but anything past 2^40 bytes is nonsense).
const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 40;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Tunables for admission policy and event delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Files larger than this are not manageable.
    pub max_file_size: u64,
    /// Whether executables and scripts may be admitted.
    pub allow_programs: bool,
    /// Extensions treated as programs, lowercase, without the dot.
    pub program_extensions: Vec<String>,
    /// Extensions that are never admitted.
    pub banned_extensions: Vec<String>,
    /// Buffer size of each event bus's async broadcast channel.
    pub event_capacity: usize,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allow_programs: false,
            program_extensions: ["exe", "com", "bat", "cmd", "msi", "app", "sh", "scr"]
                .into_iter()
                .map(String::from)
                .collect(),
            banned_extensions: ["tmp", "part", "lnk", "url"]
                .into_iter()
                .map(String::from)
                .collect(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Outcome of the synchronous manageability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Manageability {
    Manageable,
    NotManageable,
    PolicyRejected,
}

impl LibraryConfig {
    pub fn is_program(&self, path: &Path) -> bool {
        has_extension_in(path, &self.program_extensions)
    }

    pub fn is_banned(&self, path: &Path) -> bool {
        has_extension_in(path, &self.banned_extensions)
    }

    /// Physical checks first (regular file, size), then policy.
    pub(crate) fn manageability(&self, path: &Path, metadata: Option<&Metadata>) -> Manageability {
        let Some(metadata) = metadata else {
            return Manageability::NotManageable;
        };
        if !metadata.is_file() || metadata.len() > self.max_file_size {
            return Manageability::NotManageable;
        }
        if self.is_banned(path) || (!self.allow_programs && self.is_program(path)) {
            return Manageability::PolicyRejected;
        }
        Manageability::Manageable
    }
}

fn has_extension_in(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return false;
    };
    extensions.iter().any(|candidate| candidate.eq_ignore_ascii_case(ext))
}

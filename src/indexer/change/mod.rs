
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

use crate::database::IndexMetadata;

/// Hex sha256 of raw content
#[inline]
pub fn content_fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Unchanged,
    Modified,
    New,
    Deleted,
}

/// Compares current file fingerprints against those recorded for one repository
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    previous: BTreeMap<String, String>,
}

impl ChangeDetector {
    #[inline]
    pub fn new(previous: BTreeMap<String, String>) -> Self {
        Self { previous }
    }

    /// Detector seeded from the stored metadata; a missing entry means every file is new
    #[inline]
    pub fn from_metadata(metadata: Option<&IndexMetadata>, repo_path: &str) -> Self {
        Self::new(
            metadata
                .and_then(|m| m.repo_hashes(repo_path))
                .cloned()
                .unwrap_or_default(),
        )
    }

    /// Classify a file that exists now.
    ///
    /// A path that vanished and came back with other content between two runs is `Modified`.
    #[inline]
    pub fn classify(&self, path: &str, fingerprint: &str) -> ChangeKind {
        match self.previous.get(path) {
            None => ChangeKind::New,
            Some(stored) if stored == fingerprint => ChangeKind::Unchanged,
            Some(_) => ChangeKind::Modified,
        }
    }

    /// Previously indexed paths that are no longer present
    #[inline]
    pub fn deleted_paths(&self, present: &HashSet<String>) -> Vec<String> {
        self.previous
            .keys()
            .filter(|path| !present.contains(*path))
            .cloned()
            .collect()
    }

    #[inline]
    pub fn previous_fingerprint(&self, path: &str) -> Option<&str> {
        self.previous.get(path).map(String::as_str)
    }
}

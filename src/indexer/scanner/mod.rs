
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::IndexingConfig;
use crate::{Result, WeaveError};

const BINARY_SNIFF_BYTES: usize = 2048;

/// A file that passed the pattern and size filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// `/`-separated path relative to the repository root
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge { size: u64, limit: u64 },
    Binary,
    Unreadable(String),
}

impl std::fmt::Display for SkipReason {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::TooLarge { size, limit } => {
                write!(f, "file is {size} bytes, limit is {limit}")
            }
            SkipReason::Binary => write!(f, "binary content"),
            SkipReason::Unreadable(reason) => write!(f, "unreadable: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub relative_path: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Sorted by relative path
    pub files: Vec<ScannedFile>,
    pub skipped: Vec<SkippedFile>,
}

/// Enumerates the indexable files of a repository
#[derive(Debug, Clone)]
pub struct FileScanner {
    include: GlobSet,
    exclude: GlobSet,
    max_file_size: u64,
}

impl FileScanner {
    #[inline]
    pub fn new(config: &IndexingConfig) -> Result<Self> {
        Ok(Self {
            include: build_glob_set(&config.include_patterns)?,
            exclude: build_glob_set(&config.exclude_patterns)?,
            max_file_size: config.max_file_size_kb * 1024,
        })
    }

    /// Whether a relative path passes the include/exclude patterns
    #[inline]
    pub fn is_candidate(&self, relative_path: &str) -> bool {
        self.include.is_match(relative_path) && !self.exclude.is_match(relative_path)
    }

    /// Walk `root` and collect candidate files.
    ///
    /// Failing to read the root itself is an error; unreadable entries below it are reported as
    /// skipped.
    #[inline]
    pub fn scan(&self, root: &Path) -> Result<ScanResult> {
        if !root.is_dir() {
            return Err(WeaveError::Indexing(format!(
                "Repository root {} is not a readable directory",
                root.display()
            )));
        }

        let mut result = ScanResult::default();
        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || relative_path(root, entry.path())
                    .is_none_or(|rel| !self.exclude.is_match(rel.as_str()))
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(WeaveError::Indexing(format!(
                        "Failed to enumerate {}: {}",
                        root.display(),
                        e
                    )));
                }
                Err(e) => {
                    let path = e
                        .path()
                        .and_then(|p| relative_path(root, p))
                        .unwrap_or_default();
                    warn!("Skipping unreadable entry {}: {}", path, e);
                    result.skipped.push(SkippedFile {
                        relative_path: path,
                        reason: SkipReason::Unreadable(e.to_string()),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = relative_path(root, entry.path()) else {
                continue;
            };
            if !self.is_candidate(&rel) {
                continue;
            }

            let size = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    result.skipped.push(SkippedFile {
                        relative_path: rel,
                        reason: SkipReason::Unreadable(e.to_string()),
                    });
                    continue;
                }
            };

            if size > self.max_file_size {
                debug!("Skipping oversized file {} ({} bytes)", rel, size);
                result.skipped.push(SkippedFile {
                    relative_path: rel,
                    reason: SkipReason::TooLarge {
                        size,
                        limit: self.max_file_size,
                    },
                });
                continue;
            }

            result.files.push(ScannedFile {
                relative_path: rel,
                absolute_path: entry.into_path(),
                size,
            });
        }

        result
            .files
            .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        debug!(
            "Scanned {}: {} candidate files, {} skipped",
            root.display(),
            result.files.len(),
            result.skipped.len()
        );
        Ok(result)
    }
}

/// NUL byte within the first 2 KiB
#[inline]
pub fn is_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(BINARY_SNIFF_BYTES).any(|b| *b == 0)
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Patterns are rooted at the repository but also apply at any depth, and `dir/**` also names the
/// directory itself so the walk can prune it
fn expand_pattern(pattern: &str) -> Vec<String> {
    let trimmed = pattern.trim_start_matches("./").trim_start_matches('/');
    let mut expanded = vec![trimmed.to_string()];
    if !trimmed.starts_with("**/") {
        expanded.push(format!("**/{trimmed}"));
    }
    if let Some(dir) = trimmed.strip_suffix("/**") {
        expanded.push(dir.to_string());
        if !dir.starts_with("**/") {
            expanded.push(format!("**/{dir}"));
        }
    }
    expanded
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        for expanded in expand_pattern(pattern) {
            let glob = GlobBuilder::new(&expanded)
                .literal_separator(true)
                .build()
                .map_err(|e| WeaveError::Config(format!("Invalid pattern '{pattern}': {e}")))?;
            builder.add(glob);
        }
    }
    builder
        .build()
        .map_err(|e| WeaveError::Config(format!("Failed to compile patterns: {e}")))
}

#[cfg(test)]
mod tests;

pub mod parser;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::Result;
use crate::indexer::change::content_fingerprint;

pub use parser::TreeSitterParser;

/// Configuration for line-bounded chunking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Upper bound on the number of lines in any chunk
    pub max_chunk_lines: usize,
    /// Lines shared by adjacent windows when a region is split
    pub overlap_lines: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_chunk_lines: 120,
            overlap_lines: 20,
        }
    }
}

/// Source language as far as structural parsing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Rust,
    Python,
    TypeScript,
    Tsx,
    JavaScript,
    Go,
    Java,
    Unknown,
}

impl Language {
    #[inline]
    pub fn from_path(path: &Path) -> Self {
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            return Self::Unknown;
        };

        match extension.to_ascii_lowercase().as_str() {
            "rs" => Self::Rust,
            "py" | "pyi" => Self::Python,
            "ts" | "mts" | "cts" => Self::TypeScript,
            "tsx" => Self::Tsx,
            "js" | "mjs" | "cjs" | "jsx" => Self::JavaScript,
            "go" => Self::Go,
            "java" => Self::Java,
            _ => Self::Unknown,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match *self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::TypeScript => "typescript",
            Self::Tsx => "tsx",
            Self::JavaScript => "javascript",
            Self::Go => "go",
            Self::Java => "java",
            Self::Unknown => "unknown",
        }
    }
}

/// Inclusive, 1-based line range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LineSpan {
    pub start: usize,
    pub end: usize,
}

impl LineSpan {
    #[inline]
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Syntax-aware boundary provider keyed by language
pub trait StructuralParser: Send + Sync {
    fn supports(&self, language: Language) -> bool;

    /// Line spans of the top-level definitions in `text`, in any order.
    ///
    /// An error means the parser could not produce trustworthy boundaries; callers fall back to
    /// line windows.
    fn top_level_spans(&self, text: &str, language: Language) -> Result<Vec<LineSpan>>;
}

/// One contiguous slice of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

impl Chunk {
    #[inline]
    pub fn line_count(&self) -> usize {
        self.end_line + 1 - self.start_line
    }

    /// Fingerprint of the exact chunk text
    #[inline]
    pub fn chunk_hash(&self) -> String {
        content_fingerprint(self.text.as_bytes())
    }
}

/// Chunks of one file plus the non-fatal parser warning, if structural chunking had to be
/// abandoned
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkOutcome {
    pub chunks: Vec<Chunk>,
    pub fallback_warning: Option<String>,
}

#[derive(Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    parser: Option<Arc<dyn StructuralParser>>,
}

impl std::fmt::Debug for Chunker {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("config", &self.config)
            .field("structural", &self.parser.is_some())
            .finish()
    }
}

impl Chunker {
    /// Chunker backed by the bundled tree-sitter grammars
    #[inline]
    pub fn new(config: ChunkingConfig) -> Self {
        Self::with_parser(config, Arc::new(TreeSitterParser))
    }

    #[inline]
    pub fn with_parser(config: ChunkingConfig, parser: Arc<dyn StructuralParser>) -> Self {
        Self {
            config,
            parser: Some(parser),
        }
    }

    /// Chunker that only ever produces fixed-size line windows
    #[inline]
    pub fn line_based(config: ChunkingConfig) -> Self {
        Self {
            config,
            parser: None,
        }
    }

    #[inline]
    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split one file into ordered chunks.
    ///
    /// Files that fit in a single window are kept whole. Otherwise boundaries follow top-level
    /// definitions when a parser handles `language`, and fixed windows with overlap when it does not
    /// or when parsing fails. The result only lacks chunks when the file has no non-whitespace
    /// content.
    #[inline]
    pub fn chunk(&self, text: &str, language: Language) -> ChunkOutcome {
        let lines: Vec<&str> = text.lines().collect();
        let mut outcome = ChunkOutcome::default();

        if lines.is_empty() {
            return outcome;
        }

        if lines.len() <= self.config.max_chunk_lines {
            outcome.chunks = build_chunks(&lines, &[LineSpan::new(1, lines.len())]);
            return outcome;
        }

        let structural = self
            .parser
            .as_ref()
            .filter(|parser| parser.supports(language));

        let spans = match structural {
            Some(parser) => match parser.top_level_spans(text, language) {
                Ok(units) => self.pack_units(units, lines.len()),
                Err(e) => {
                    warn!(
                        "Structural parsing failed for {} source, using line windows: {}",
                        language.as_str(),
                        e
                    );
                    outcome.fallback_warning = Some(e.to_string());
                    line_windows(LineSpan::new(1, lines.len()), &self.config)
                }
            },
            None => line_windows(LineSpan::new(1, lines.len()), &self.config),
        };

        outcome.chunks = build_chunks(&lines, &spans);
        debug!(
            "Chunked {} lines of {} into {} chunks",
            lines.len(),
            language.as_str(),
            outcome.chunks.len()
        );
        outcome
    }

    /// Turn definition spans into chunk spans that cover the whole file: gaps between definitions
    /// become their own segments, neighbouring segments are packed while they fit, and segments
    /// longer than the window are split into overlapping windows.
    fn pack_units(&self, mut units: Vec<LineSpan>, total_lines: usize) -> Vec<LineSpan> {
        units.retain(|span| span.start >= 1 && span.start <= total_lines);
        for span in &mut units {
            span.end = span.end.clamp(span.start, total_lines);
        }
        units.sort_unstable();

        let mut merged: Vec<LineSpan> = Vec::with_capacity(units.len());
        for span in units {
            match merged.last_mut() {
                Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
                _ => merged.push(span),
            }
        }

        let mut segments = Vec::with_capacity(merged.len() * 2 + 1);
        let mut cursor = 1;
        for span in merged {
            if span.start > cursor {
                segments.push(LineSpan::new(cursor, span.start - 1));
            }
            segments.push(span);
            cursor = span.end + 1;
        }
        if cursor <= total_lines {
            segments.push(LineSpan::new(cursor, total_lines));
        }

        let max = self.config.max_chunk_lines;
        let mut packed = Vec::new();
        let mut current: Option<LineSpan> = None;

        for segment in segments {
            if segment.len() > max {
                packed.extend(current.take());
                packed.extend(line_windows(segment, &self.config));
                continue;
            }

            current = match current {
                Some(open) if segment.end + 1 - open.start <= max => {
                    Some(LineSpan::new(open.start, segment.end))
                }
                Some(open) => {
                    packed.push(open);
                    Some(segment)
                }
                None => Some(segment),
            };
        }
        packed.extend(current);
        packed
    }
}

/// Fixed-size windows over `region`; adjacent windows share exactly `overlap_lines` lines.
#[inline]
pub fn line_windows(region: LineSpan, config: &ChunkingConfig) -> Vec<LineSpan> {
    if region.is_empty() {
        return Vec::new();
    }

    let max = config.max_chunk_lines.max(1);
    let step = max.saturating_sub(config.overlap_lines).max(1);

    let mut windows = Vec::new();
    let mut start = region.start;
    loop {
        let end = (start + max - 1).min(region.end);
        windows.push(LineSpan::new(start, end));
        if end == region.end {
            break;
        }
        start += step;
    }
    windows
}

fn build_chunks(lines: &[&str], spans: &[LineSpan]) -> Vec<Chunk> {
    spans
        .iter()
        .filter_map(|span| {
            let slice = lines.get(span.start - 1..span.end)?;
            if slice.iter().all(|line| line.trim().is_empty()) {
                return None;
            }
            Some(Chunk {
                start_line: span.start,
                end_line: span.end,
                text: slice.join("\n"),
            })
        })
        .collect()
}

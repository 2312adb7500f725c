// Retrieval module
// Similarity search across the repositories of a subproject, merged with explicit attachments

pub mod attachment;


use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::database::{SearchHit, VectorStore};
use crate::embeddings::Embedder;
use crate::{Result, WeaveError};

pub use attachment::{AttachmentRequest, ResolvedAttachment, parse_query, resolve};

const KEYWORD_BOOST: f32 = 0.1;
const BOOST_OVERFETCH: usize = 3;
const ATTACHMENT_SCORE: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemSource {
    Attachment,
    Search,
}

/// One entry of the merged, ranked context sequence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextItem {
    pub repo_path: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub score: f32,
    pub source: ItemSource,
}

impl ContextItem {
    #[inline]
    pub fn overlaps(&self, other: &ContextItem) -> bool {
        self.repo_path == other.repo_path
            && self.file_path == other.file_path
            && self.start_line <= other.end_line
            && other.start_line <= self.end_line
    }

    /// Widen this item to also cover an overlapping range of the same file
    fn absorb(&mut self, other: ContextItem) {
        let own: Vec<&str> = self.text.split('\n').collect();
        let theirs: Vec<&str> = other.text.split('\n').collect();
        let start = self.start_line.min(other.start_line);
        let end = self.end_line.max(other.end_line);

        let text = (start..=end)
            .map(|line| {
                let taken = if (self.start_line..=self.end_line).contains(&line) {
                    own.get(line - self.start_line)
                } else {
                    theirs.get(line - other.start_line)
                };
                taken.copied().unwrap_or_default()
            })
            .join("\n");

        self.text = text;
        self.start_line = start;
        self.end_line = end;
        self.score = self.score.max(other.score);
    }
}

impl From<ResolvedAttachment> for ContextItem {
    #[inline]
    fn from(attachment: ResolvedAttachment) -> Self {
        Self {
            repo_path: attachment.repo_path,
            file_path: attachment.file_path,
            start_line: attachment.start_line,
            end_line: attachment.end_line,
            text: attachment.text,
            score: ATTACHMENT_SCORE,
            source: ItemSource::Attachment,
        }
    }
}

impl From<SearchHit> for ContextItem {
    #[inline]
    fn from(hit: SearchHit) -> Self {
        Self {
            repo_path: hit.record.repo_path,
            file_path: hit.record.file_path,
            start_line: hit.record.start_line,
            end_line: hit.record.end_line,
            text: hit.record.text,
            score: hit.score,
            source: ItemSource::Search,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOptions {
    pub top_k: usize,
    /// Repositories to search; empty means the whole subproject
    pub repos: Vec<String>,
    pub keyword_boost: bool,
}

impl Default for SearchOptions {
    #[inline]
    fn default() -> Self {
        Self {
            top_k: 10,
            repos: Vec::new(),
            keyword_boost: false,
        }
    }
}

/// Read-only view of one subproject collection
pub struct Retriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    #[inline]
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Ranked hits for `query`, best first
    #[inline]
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        if options.top_k == 0 {
            return Err(WeaveError::InvalidInput(
                "top_k must be at least 1".to_string(),
            ));
        }
        if query.trim().is_empty() {
            return Err(WeaveError::InvalidInput("Query is empty".to_string()));
        }
        if !self.store.exists().await? {
            return Err(WeaveError::IndexMissing(self.store.collection().to_string()));
        }

        let vector = self.embedder.embed(query).await?;
        let fetch = if options.keyword_boost {
            options.top_k.saturating_mul(BOOST_OVERFETCH)
        } else {
            options.top_k
        };

        let mut hits = if options.repos.is_empty() {
            self.store.search(&vector, fetch, None).await?
        } else {
            let mut merged = Vec::new();
            for repo in options.repos.iter().map(String::as_str).unique() {
                merged.extend(self.store.search(&vector, fetch, Some(repo)).await?);
            }
            // Stable, so equal scores keep the per-repository store order
            merged.sort_by(|a, b| b.score.total_cmp(&a.score));
            merged
        };

        if options.keyword_boost {
            apply_keyword_boost(&mut hits, query);
        }
        hits.truncate(options.top_k);

        debug!(
            "Search in '{}' returned {} hits",
            self.store.collection(),
            hits.len()
        );
        Ok(hits)
    }

    /// Attachments first, then search hits, with overlapping ranges of the same file collapsed
    /// onto the earlier item.
    ///
    /// An empty query skips the search and returns only the attachments.
    #[inline]
    pub async fn retrieve(
        &self,
        query: &str,
        attachments: &[AttachmentRequest],
        repo_roots: &[String],
        options: &SearchOptions,
    ) -> Result<Vec<ContextItem>> {
        let mut resolved = Vec::with_capacity(attachments.len());
        for request in attachments {
            resolved.push(ContextItem::from(resolve(request, repo_roots).await?));
        }

        let hits = if query.trim().is_empty() {
            if resolved.is_empty() {
                return Err(WeaveError::InvalidInput(
                    "A query or at least one attachment is required".to_string(),
                ));
            }
            Vec::new()
        } else {
            self.search(query, options).await?
        };

        Ok(merge(resolved, hits.into_iter().map(ContextItem::from)))
    }
}

/// Attachments first, then hits that do not overlap any kept item.
///
/// Overlapping attachments of the same file are joined into one span rather than dropped.
#[inline]
pub fn merge(
    attachments: Vec<ContextItem>,
    hits: impl IntoIterator<Item = ContextItem>,
) -> Vec<ContextItem> {
    let mut merged: Vec<ContextItem> = Vec::with_capacity(attachments.len());
    for mut attachment in attachments {
        let overlapping: Vec<usize> = merged
            .iter()
            .positions(|kept| kept.overlaps(&attachment))
            .collect();
        let Some((&first, rest)) = overlapping.split_first() else {
            merged.push(attachment);
            continue;
        };
        for &index in rest.iter().rev() {
            attachment.absorb(merged.remove(index));
        }
        debug!(
            "Joining attachment {}:{}-{} with an overlapping one",
            attachment.file_path, attachment.start_line, attachment.end_line
        );
        merged[first].absorb(attachment);
    }

    for item in hits {
        if merged.iter().any(|kept| kept.overlaps(&item)) {
            debug!(
                "Dropping duplicate {}/{}:{}-{}",
                item.repo_path, item.file_path, item.start_line, item.end_line
            );
            continue;
        }
        merged.push(item);
    }
    merged
}

/// Add a fixed bonus per distinct query keyword found in the chunk, capped at 1.0, then re-rank
#[inline]
pub fn apply_keyword_boost(hits: &mut [SearchHit], query: &str) {
    let keywords = keywords(query);
    if keywords.is_empty() {
        return;
    }

    for hit in hits.iter_mut() {
        let text = hit.record.text.to_lowercase();
        let found = keywords.iter().filter(|k| text.contains(k.as_str())).count();
        if found > 0 {
            hit.score = (hit.score + KEYWORD_BOOST * found as f32).min(1.0);
        }
    }
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
}

/// Lowercased query words of at least three characters; `snake_case` and `camelCase`
/// identifiers also contribute their parts
fn keywords(query: &str) -> BTreeSet<String> {
    let mut keywords = BTreeSet::new();
    for word in query.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        keywords.insert(word.to_lowercase());
        keywords.extend(identifier_parts(word));
    }
    keywords.retain(|keyword| keyword.chars().count() >= 3);
    keywords
}

fn identifier_parts(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for piece in word.split('_') {
        let mut current = String::new();
        let mut previous: Option<char> = None;
        for c in piece.chars() {
            let boundary = c.is_uppercase()
                && previous.is_some_and(|p| p.is_lowercase() || p.is_numeric());
            if boundary && !current.is_empty() {
                parts.push(std::mem::take(&mut current).to_lowercase());
            }
            current.push(c);
            previous = Some(c);
        }
        if !current.is_empty() {
            parts.push(current.to_lowercase());
        }
    }
    parts
}

// Prompt module
// Packs ranked context into prompt parts that each fit a token budget

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

use crate::retrieval::ContextItem;
use crate::tokenizer::{TokenCounter, TokenizerKind, token_counter};
use crate::{Result, WeaveError};

const DEFAULT_TASK: &str =
    "Answer the question using the code context provided. Quote file paths and line numbers when you refer to code.";
const ROLE: &str = "You are an expert software engineer who knows this codebase well.";
const FOOTER: &str = "## Response Format\nAnswer in Markdown. Cite code as `repo/path:start-end`. If the context does not contain the answer, say so instead of guessing.\n";
const CONTINUATION: &str = "\n... (continued in next part)\n";
const TRUNCATION_MARKER: &str = "... (truncated)";
const EMPTY_CONTEXT: &str = "\n(no matching context found)\n";

/// What happens to a single block that cannot fit in one part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizedPolicy {
    /// Emit the block whole, alone in its own part
    #[default]
    Isolate,
    /// Cut the block's code until it fits
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub token_budget: usize,
    /// Tokens of every part kept free for the model's answer
    pub reserve_reply_tokens: usize,
    pub tokenizer: TokenizerKind,
    pub oversized_policy: OversizedPolicy,
    pub task: String,
}

impl Default for PromptConfig {
    #[inline]
    fn default() -> Self {
        Self {
            token_budget: 32_000,
            reserve_reply_tokens: 1200,
            tokenizer: TokenizerKind::default(),
            oversized_policy: OversizedPolicy::default(),
            task: DEFAULT_TASK.to_string(),
        }
    }
}

/// Assembled prompt parts, in the order they are meant to be sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextParts {
    pub parts: Vec<String>,
    pub tokens_per_part: Vec<usize>,
    pub total_tokens: usize,
}

pub struct ContextAssembler {
    config: PromptConfig,
    counter: Arc<dyn TokenCounter>,
}

impl ContextAssembler {
    #[inline]
    pub fn new(config: PromptConfig, counter: Arc<dyn TokenCounter>) -> Self {
        Self { config, counter }
    }

    /// Assembler using the tokenizer named in the configuration
    #[inline]
    pub fn from_config(config: &PromptConfig) -> Result<Self> {
        Ok(Self::new(config.clone(), token_counter(config.tokenizer)?))
    }

    #[inline]
    pub fn config(&self) -> &PromptConfig {
        &self.config
    }

    /// Tokens available to one part
    #[inline]
    pub fn part_budget(&self) -> usize {
        self.config
            .token_budget
            .saturating_sub(self.config.reserve_reply_tokens)
    }

    #[inline]
    pub fn render_block(item: &ContextItem) -> String {
        render_block_text(item, &item.text)
    }

    /// Pack `items` greedily, in order, into as few parts as the budget allows.
    ///
    /// A block is never split between parts. Every part fits the budget except one holding a
    /// single block that cannot be made to fit: any oversized block under `isolate`, or one
    /// that `truncate` cannot cut down far enough.
    #[inline]
    pub fn assemble(&self, query: &str, items: &[ContextItem]) -> Result<ContextParts> {
        let budget = self.part_budget();
        let worst_case_parts = items.len().max(1);
        let overhead = self.count(&self.skeleton(query, worst_case_parts));

        let mut blocks: Vec<String> = items.iter().map(Self::render_block).collect();
        let smallest = blocks
            .iter()
            .map(|block| self.count(block))
            .min()
            .unwrap_or_else(|| self.count(EMPTY_CONTEXT));

        if budget < overhead + smallest {
            return Err(WeaveError::InvalidInput(format!(
                "Token budget of {} ({} per part after the {} token reply reserve) cannot hold the {} token prompt frame plus a {} token block",
                self.config.token_budget,
                budget,
                self.config.reserve_reply_tokens,
                overhead,
                smallest
            )));
        }
        let capacity = budget - overhead;

        if self.config.oversized_policy == OversizedPolicy::Truncate {
            for (block, item) in blocks.iter_mut().zip(items) {
                let truncated = (self.count(block) > capacity)
                    .then(|| self.truncate(item, capacity))
                    .flatten();
                if let Some(truncated) = truncated {
                    *block = truncated;
                }
            }
        }

        let block_tokens: Vec<usize> = blocks.iter().map(|block| self.count(block)).collect();
        let mut groups = pack(&block_tokens, capacity);

        // Token counts of joined text can differ from the sum of the pieces. Move trailing blocks
        // forward until every multi-block part fits; a lone block can only shrink
        let mut settled: HashSet<usize> = HashSet::new();
        let parts = loop {
            let parts = self.render_parts(query, &groups, &blocks);
            let overflow = parts
                .iter()
                .zip(&groups)
                .enumerate()
                .find_map(|(index, (part, group))| {
                    let tokens = self.count(part);
                    let alone_and_settled = group.len() == 1 && settled.contains(&group[0]);
                    (tokens > budget && !alone_and_settled).then_some((index, tokens - budget))
                });
            let Some((index, excess)) = overflow else {
                break parts;
            };

            if let &[block] = groups[index].as_slice() {
                let current = self.count(&blocks[block]);
                let shrunk = (self.config.oversized_policy == OversizedPolicy::Truncate)
                    .then(|| self.truncate(&items[block], current.saturating_sub(excess)))
                    .flatten()
                    .filter(|shorter| self.count(shorter) < current);
                match shrunk {
                    Some(shorter) => blocks[block] = shorter,
                    None => {
                        settled.insert(block);
                    }
                }
                continue;
            }
            if let Some(moved) = groups[index].pop() {
                match groups.get_mut(index + 1) {
                    Some(next) => next.insert(0, moved),
                    None => groups.push(vec![moved]),
                }
            }
        };

        let tokens_per_part: Vec<usize> = parts.iter().map(|part| self.count(part)).collect();
        let total_tokens = tokens_per_part.iter().sum();
        debug!(
            "Assembled {} blocks into {} parts ({} tokens, {} per part budget)",
            items.len(),
            parts.len(),
            total_tokens,
            budget
        );

        Ok(ContextParts {
            parts,
            tokens_per_part,
            total_tokens,
        })
    }

    fn count(&self, text: &str) -> usize {
        self.counter.count_tokens(text)
    }

    fn header(&self, query: &str) -> String {
        let mut header = format!("{ROLE}\n\n## Task\n{}\n", self.config.task);
        if !query.trim().is_empty() {
            let _ = write!(header, "\n## Question\n{}\n", query.trim());
        }
        header
    }

    /// Every fixed piece a part can carry, numbered as wide as the largest possible part count
    fn skeleton(&self, query: &str, parts: usize) -> String {
        let mut skeleton = self.header(query);
        skeleton.push('\n');
        skeleton.push_str(&part_heading(parts, parts));
        skeleton.push_str(&wait_instruction(parts, parts));
        skeleton.push_str(CONTINUATION);
        skeleton.push('\n');
        skeleton.push_str(FOOTER);
        skeleton
    }

    fn render_parts(&self, query: &str, groups: &[Vec<usize>], blocks: &[String]) -> Vec<String> {
        let total = groups.len().max(1);
        let mut parts = Vec::with_capacity(total);

        for index in 1..=total {
            let mut part = String::new();
            if index == 1 {
                part.push_str(&self.header(query));
                part.push('\n');
            }

            if total > 1 {
                part.push_str(&part_heading(index, total));
            } else {
                part.push_str("# Context Data\n");
            }
            if index < total {
                part.push_str(&wait_instruction(index, total));
            }

            match groups.get(index - 1) {
                Some(group) if !group.is_empty() => {
                    for block in group {
                        part.push_str(&blocks[*block]);
                    }
                }
                _ => part.push_str(EMPTY_CONTEXT),
            }

            if index < total {
                part.push_str(CONTINUATION);
            } else {
                part.push('\n');
                part.push_str(FOOTER);
            }
            parts.push(part);
        }
        parts
    }

    /// Largest prefix of the item's lines whose block fits `capacity`, if any does
    fn truncate(&self, item: &ContextItem, capacity: usize) -> Option<String> {
        let lines: Vec<&str> = item.text.lines().collect();
        let render = |keep: usize| {
            let mut text = lines[..keep].join("\n");
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(TRUNCATION_MARKER);
            render_block_text(item, &text)
        };

        if self.count(&render(0)) > capacity {
            return None;
        }

        let (mut fits, mut too_many) = (0, lines.len());
        while fits + 1 < too_many {
            let mid = (fits + too_many) / 2;
            if self.count(&render(mid)) <= capacity {
                fits = mid;
            } else {
                too_many = mid;
            }
        }
        Some(render(fits))
    }
}

fn render_block_text(item: &ContextItem, text: &str) -> String {
    format!(
        "\n### {}/{}:{}-{} (score={:.4})\n```\n{}\n```\n",
        item.repo_path.trim_end_matches('/'),
        item.file_path,
        item.start_line,
        item.end_line,
        item.score,
        text
    )
}

fn part_heading(index: usize, total: usize) -> String {
    format!("# [PART {index}/{total}] Context Data\n")
}

fn wait_instruction(index: usize, total: usize) -> String {
    format!(
        "This is part {index} of {total}. Do not answer yet; reply only with \"Received part {index}/{total}\" and wait for the next part.\n"
    )
}

/// Greedy grouping by summed block tokens; a block above `capacity` gets a group of its own
fn pack(block_tokens: &[usize], capacity: usize) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut used = 0;

    for (index, tokens) in block_tokens.iter().copied().enumerate() {
        if !current.is_empty() && used + tokens > capacity {
            groups.push(std::mem::take(&mut current));
            used = 0;
        }
        current.push(index);
        used += tokens;
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

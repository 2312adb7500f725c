
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::{Result, WeaveError};

/// A file or line range the caller wants in the context regardless of ranking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRequest {
    /// Repository root; `None` lets resolution pick the repository holding `path`
    pub repo: Option<String>,
    pub path: String,
    pub start_line: Option<usize>,
    pub end_line: Option<usize>,
}

impl AttachmentRequest {
    #[inline]
    pub fn whole_file(path: &str) -> Self {
        Self {
            repo: None,
            path: path.to_string(),
            start_line: None,
            end_line: None,
        }
    }

    #[inline]
    pub fn lines(path: &str, start_line: usize, end_line: usize) -> Self {
        Self {
            repo: None,
            path: path.to_string(),
            start_line: Some(start_line),
            end_line: Some(end_line),
        }
    }

    /// Parse `path`, `path:start-end` or `path:line`, with or without the leading `@`
    #[inline]
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let reference = reference.strip_prefix('@').unwrap_or(reference);
        if reference.is_empty() {
            return Err(WeaveError::InvalidInput(
                "Attachment path cannot be empty".to_string(),
            ));
        }
        parse_reference(reference)
    }
}

/// Literal slice of a file, taken from disk at request time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAttachment {
    pub repo_path: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

/// Split `@path`, `@path:start-end` and `@path:line` tokens out of a query.
///
/// Returns the remaining query text and the attachments in order of appearance.
#[inline]
pub fn parse_query(query: &str) -> Result<(String, Vec<AttachmentRequest>)> {
    let mut words = Vec::new();
    let mut attachments = Vec::new();

    for token in query.split_whitespace() {
        match token.strip_prefix('@') {
            Some(reference) if !reference.is_empty() => {
                attachments.push(parse_reference(reference)?);
            }
            _ => words.push(token),
        }
    }

    Ok((words.join(" "), attachments))
}

fn parse_reference(reference: &str) -> Result<AttachmentRequest> {
    let Some((path, range)) = reference.rsplit_once(':') else {
        return Ok(AttachmentRequest::whole_file(reference));
    };
    if path.is_empty() || !range.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return Ok(AttachmentRequest::whole_file(reference));
    }

    let parse = |value: &str| {
        value.parse::<usize>().map_err(|_| {
            WeaveError::InvalidInput(format!("Invalid line range '{range}' in @{reference}"))
        })
    };

    let (start, end) = match range.split_once('-') {
        Some((start, end)) => (parse(start)?, parse(end)?),
        None => {
            let line = parse(range)?;
            (line, line)
        }
    };

    Ok(AttachmentRequest::lines(path, start, end))
}

/// Read the requested lines of an attachment.
///
/// `start` must be at least 1, no greater than `end`, and inside the file; `end` is clamped to
/// the last line.
#[inline]
pub async fn resolve(request: &AttachmentRequest, repos: &[String]) -> Result<ResolvedAttachment> {
    let (repo_path, file_path) = locate(request, repos)?;
    let absolute = Path::new(&repo_path).join(&file_path);

    let bytes = tokio::fs::read(&absolute).await.map_err(|e| {
        WeaveError::InvalidInput(format!(
            "Cannot read attachment {}: {}",
            absolute.display(),
            e
        ))
    })?;
    let content = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Err(WeaveError::InvalidInput(format!(
            "Attachment {file_path} is empty"
        )));
    }

    let start = request.start_line.unwrap_or(1);
    let end = request.end_line.unwrap_or(lines.len());
    if start == 0 {
        return Err(WeaveError::InvalidInput(format!(
            "Line numbers of {file_path} start at 1"
        )));
    }
    if end < start {
        return Err(WeaveError::InvalidInput(format!(
            "Line range {start}-{end} of {file_path} ends before it starts"
        )));
    }
    if start > lines.len() {
        return Err(WeaveError::InvalidInput(format!(
            "Line {} is past the end of {} ({} lines)",
            start,
            file_path,
            lines.len()
        )));
    }
    let end = end.min(lines.len());

    debug!("Attached {}/{}:{}-{}", repo_path, file_path, start, end);
    Ok(ResolvedAttachment {
        text: lines[start - 1..end].join("\n"),
        repo_path,
        file_path,
        start_line: start,
        end_line: end,
    })
}

/// Find the repository and repository-relative path an attachment refers to
fn locate(request: &AttachmentRequest, repos: &[String]) -> Result<(String, String)> {
    if has_parent_component(&request.path) {
        return Err(WeaveError::InvalidInput(format!(
            "Attachment path {} must stay inside its repository",
            request.path
        )));
    }

    let candidates: Vec<&String> = match &request.repo {
        Some(repo) => {
            let known = repos.iter().find(|r| *r == repo).ok_or_else(|| {
                WeaveError::InvalidInput(format!("{repo} is not a repository of this subproject"))
            })?;
            vec![known]
        }
        None => repos.iter().collect(),
    };

    let requested = Path::new(&request.path);
    for repo in &candidates {
        let root = Path::new(repo.as_str());

        if requested.is_absolute() {
            if let Ok(relative) = requested.strip_prefix(root) {
                return Ok(((*repo).clone(), to_relative_string(relative)));
            }
            continue;
        }

        if root.join(requested).is_file() {
            return Ok(((*repo).clone(), to_relative_string(requested)));
        }

        // `@repo-name/path` form
        let named = root
            .file_name()
            .and_then(|name| requested.strip_prefix(name).ok())
            .filter(|relative| root.join(relative).is_file());
        if let Some(relative) = named {
            return Ok(((*repo).clone(), to_relative_string(relative)));
        }
    }

    Err(WeaveError::InvalidInput(format!(
        "Attachment {} was not found in any repository of this subproject",
        request.path
    )))
}

fn has_parent_component(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

fn to_relative_string(path: &Path) -> String {
    let normal: PathBuf = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    normal
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

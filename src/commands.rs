use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Config;
use crate::database::sqlite::IndexStatus;
use crate::indexer::{IssueKind, ProgressEvent, ProgressStatus, RepoOutcome, RunSummary};
use crate::retrieval::SearchOptions;
use crate::service::{ContextRequest, WeaveService};

/// Register a subproject and any repositories given with it
#[inline]
pub async fn add_repositories(config: Config, subproject: &str, repos: &[PathBuf]) -> Result<()> {
    let service = WeaveService::new(config).await?;

    let record = service.add_subproject(subproject).await?;
    println!("Subproject: {} ({})", record.name, record.status);

    for repo in repos {
        let added = service.add_repository(subproject, repo).await?;
        println!("  Added repository: {}", added.path);
    }

    if repos.is_empty() {
        println!("Use 'codeweave add {subproject} <path>' to register repositories.");
    }
    Ok(())
}

#[inline]
pub async fn remove_repository(config: Config, subproject: &str, repo: &Path) -> Result<()> {
    let service = WeaveService::new(config).await?;

    // Rows hold canonical paths; fall back to the literal argument for repositories that are gone
    let path = fs::canonicalize(repo).unwrap_or_else(|_| repo.to_path_buf());
    if service
        .remove_repository(subproject, &path.display().to_string())
        .await?
    {
        println!("Removed repository: {}", path.display());
    } else {
        println!("Repository not registered: {}", path.display());
    }
    Ok(())
}

#[inline]
pub async fn list_subprojects(config: Config) -> Result<()> {
    let service = WeaveService::new(config).await?;
    let subprojects = service.list_subprojects().await?;

    if subprojects.is_empty() {
        println!("No subprojects have been added yet.");
        println!("Use 'codeweave add <subproject> <path>...' to add one.");
        return Ok(());
    }

    println!("Subprojects ({} total):", subprojects.len());
    println!();
    for subproject in &subprojects {
        println!("{} {}", status_marker(subproject.status), style(&subproject.name).bold());
        println!("   Status: {}", subproject.status);
        println!(
            "   Files: {}/{}  Chunks: {}",
            subproject.indexed_files, subproject.total_files, subproject.total_chunks
        );
        if let Some(indexed_at) = subproject.last_indexed_at {
            println!("   Last Indexed: {}", indexed_at.format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(error) = &subproject.error_message {
            println!("   ⚠️  Error: {}", error);
        }
        println!();
    }
    Ok(())
}

/// Run indexing in the foreground with a progress bar; Ctrl+C cancels the run
#[inline]
pub async fn index_subproject(config: Config, subproject: &str, full: bool) -> Result<()> {
    let service = WeaveService::new(config).await?;
    let handle = service.index_subproject(subproject, !full).await?;
    info!("Indexing '{}' (full rebuild requested: {})", subproject, full);

    let bar = if console::user_attended_stderr() {
        ProgressBar::new(0).with_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] {wide_msg}")
                .context("Invalid progress template")?,
        )
    } else {
        ProgressBar::hidden()
    };

    let mut events = handle.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                update_bar(&bar, &event);
            }
            _ = tokio::signal::ctrl_c() => {
                bar.set_message("cancelling after in-flight files...");
                handle.cancel();
            }
        }
    }
    bar.finish_and_clear();

    let summary = handle.wait().await?;
    print_summary(&summary);
    Ok(())
}

fn update_bar(bar: &ProgressBar, event: &ProgressEvent) {
    bar.set_length(event.files_total as u64);
    bar.set_position(event.files_done as u64);
    let message = match (&event.status, &event.repo) {
        (ProgressStatus::Scanning, _) => "scanning repositories".to_string(),
        (ProgressStatus::Indexing, Some(repo)) => {
            format!("{} chunks, finished {}", event.chunks_total, repo)
        }
        (ProgressStatus::Indexing, None) => format!("{} chunks", event.chunks_total),
        (ProgressStatus::Indexed, _) => "done".to_string(),
        (ProgressStatus::Error, _) => event.error.clone().unwrap_or_default(),
    };
    bar.set_message(message);
}

fn print_summary(summary: &RunSummary) {
    let headline = match summary.status {
        ProgressStatus::Indexed => style("✅ Indexed").green(),
        _ if summary.cancelled => style("🛑 Cancelled").yellow(),
        _ => style("⚠️  Indexed with errors").red(),
    };
    println!("{} '{}' in {:.1?}", headline, summary.subproject, summary.elapsed);
    if summary.full_rebuild {
        println!("   Full rebuild");
    }
    println!(
        "   Files: {} scanned, {} indexed, {} unchanged, {} deleted, {} skipped, {} failed",
        summary.files_scanned,
        summary.files_indexed,
        summary.files_unchanged,
        summary.files_deleted,
        summary.files_skipped,
        summary.files_failed
    );
    println!(
        "   Chunks stored: {}  Embedding calls: {}",
        summary.chunks_stored, summary.embedding_calls
    );

    for repo in &summary.repos {
        let outcome = match &repo.outcome {
            RepoOutcome::Indexed => style("ok".to_string()).green(),
            RepoOutcome::PartiallyFailed { failed_files } => {
                style(format!("{failed_files} files failed")).yellow()
            }
            RepoOutcome::Failed(reason) => style(format!("failed: {reason}")).red(),
            RepoOutcome::Cancelled => style("cancelled".to_string()).yellow(),
        };
        println!("   📁 {} ({})", repo.repo_path, outcome);
    }

    for issue in &summary.issues {
        let kind = match issue.kind {
            IssueKind::Skipped => "skipped",
            IssueKind::ParserFallback => "line windows",
            IssueKind::Failed => "failed",
        };
        println!(
            "   {} {}/{}: {}",
            style(kind).dim(),
            issue.repo_path,
            issue.file_path,
            issue.message
        );
    }
}

#[inline]
pub async fn search(
    config: Config,
    subproject: &str,
    query: &str,
    options: &SearchOptions,
    json: bool,
) -> Result<()> {
    let service = WeaveService::new(config).await?;
    let hits = service.search(subproject, query, options).await?;

    if json {
        let rows: Vec<serde_json::Value> = hits
            .iter()
            .map(|hit| {
                serde_json::json!({
                    "repo_path": hit.record.repo_path,
                    "file_path": hit.record.file_path,
                    "start_line": hit.record.start_line,
                    "end_line": hit.record.end_line,
                    "score": hit.score,
                    "text": hit.record.text,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if hits.is_empty() {
        println!("No matches.");
        return Ok(());
    }
    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "{:>2}. {} {}/{}:{}-{}",
            rank + 1,
            style(format!("{:.4}", hit.score)).cyan(),
            hit.record.repo_path,
            hit.record.file_path,
            hit.record.start_line,
            hit.record.end_line
        );
        if let Some(first) = hit.record.text.lines().find(|line| !line.trim().is_empty()) {
            println!("    {}", style(first.trim()).dim());
        }
    }
    Ok(())
}

/// Assemble the prompt parts; printed to stdout or written as `part_NN.md` files
#[inline]
pub async fn build_context(
    config: Config,
    subproject: &str,
    request: &ContextRequest,
    output_dir: Option<&Path>,
) -> Result<()> {
    let service = WeaveService::new(config).await?;
    let context = service.build_context(subproject, request).await?;

    match output_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            for (index, part) in context.parts.iter().enumerate() {
                let path = dir.join(format!("part_{:02}.md", index + 1));
                fs::write(&path, part)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                eprintln!(
                    "Wrote {} ({} tokens)",
                    path.display(),
                    context.tokens_per_part[index]
                );
            }
        }
        None => {
            let total = context.parts.len();
            for (index, part) in context.parts.iter().enumerate() {
                if total > 1 {
                    eprintln!(
                        "{}",
                        style(format!(
                            "----- part {}/{} ({} tokens) -----",
                            index + 1,
                            total,
                            context.tokens_per_part[index]
                        ))
                        .dim()
                    );
                }
                println!("{part}");
            }
        }
    }
    eprintln!(
        "{} parts, {} tokens total",
        context.parts.len(),
        context.total_tokens
    );
    Ok(())
}

#[inline]
pub async fn list_backends(config: Config) -> Result<()> {
    let configured = config.vector_store.backend.clone();
    let service = WeaveService::new(config).await?;

    for backend in service.list_available_backends() {
        if backend == configured {
            println!("{} {}", style(&backend).bold(), style("(configured)").green());
        } else {
            println!("{backend}");
        }
    }
    Ok(())
}

/// Show bookkeeping rows and collection state of one subproject, or of all of them
#[inline]
pub async fn show_status(config: Config, subproject: Option<&str>) -> Result<()> {
    let service = WeaveService::new(config).await?;

    let names: Vec<String> = match subproject {
        Some(name) => vec![name.to_string()],
        None => service
            .list_subprojects()
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect(),
    };

    if names.is_empty() {
        println!("No subprojects have been added yet.");
        return Ok(());
    }

    for name in &names {
        let status = match service.status(name).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Status of '{}' unavailable: {}", name, e);
                println!("❌ {}: {}", name, e);
                continue;
            }
        };

        println!(
            "{} {} [{}]",
            status_marker(status.subproject.status),
            style(name).bold(),
            status.subproject.status
        );
        println!(
            "   Collection: {} on {} ({} records)",
            status.collection, status.backend, status.record_count
        );
        if let Some(metadata) = &status.metadata {
            println!(
                "   Files tracked: {}  Updated: {}",
                metadata.files_seen,
                metadata.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        for repo in &status.repositories {
            println!(
                "   📁 {} [{}] {}/{} files, {} chunks",
                repo.path, repo.status, repo.indexed_files, repo.total_files, repo.total_chunks
            );
            if let Some(error) = &repo.error_message {
                println!("      ⚠️  {}", error);
            }
        }
        if let Some(error) = &status.subproject.error_message {
            println!("   ⚠️  Error: {}", error);
        }
        println!();
    }
    Ok(())
}

fn status_marker(status: IndexStatus) -> &'static str {
    match status {
        IndexStatus::New => "🆕",
        IndexStatus::Indexing => "🔄",
        IndexStatus::Indexed => "✅",
        IndexStatus::Error => "❌",
    }
}

use clap::{Parser, Subcommand};
use codeweave::Result;
use codeweave::commands::{
    add_repositories, build_context, index_subproject, list_backends, list_subprojects,
    remove_repository, search, show_status,
};
use codeweave::config::{Config, get_config_dir, run_interactive_config, show_config};
use codeweave::retrieval::{AttachmentRequest, SearchOptions};
use codeweave::service::ContextRequest;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codeweave")]
#[command(about = "Incremental code indexing, vector search and prompt assembly across repositories")]
#[command(version)]
struct Cli {
    /// Use this directory for configuration and local indexes
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the embedder, vector store and prompt settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Create a subproject and register repositories with it
    Add {
        subproject: String,
        /// Repository root directories
        repos: Vec<PathBuf>,
    },
    /// Unregister a repository from a subproject
    Remove { subproject: String, repo: PathBuf },
    /// List subprojects
    List,
    /// Index every repository of a subproject
    Index {
        subproject: String,
        /// Re-index every file instead of only changed ones
        #[arg(long)]
        full: bool,
    },
    /// Search indexed chunks
    Search {
        subproject: String,
        query: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        /// Only search these repositories
        #[arg(long = "repo")]
        repos: Vec<String>,
        /// Favour chunks that contain the query's keywords
        #[arg(long)]
        keyword_boost: bool,
        #[arg(long)]
        json: bool,
    },
    /// Build token-bounded prompt parts for a question
    Context {
        subproject: String,
        /// Question; may contain inline `@path:start-end` attachments
        query: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        #[arg(long = "repo")]
        repos: Vec<String>,
        /// Attach a file or line range, as `path`, `path:start-end` or `path:line`
        #[arg(long = "attach")]
        attachments: Vec<String>,
        #[arg(long)]
        keyword_boost: bool,
        /// Override the configured token budget
        #[arg(long)]
        budget: Option<usize>,
        /// Write each part to `part_NN.md` in this directory instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List vector store backends
    Backends,
    /// Show index status of one or all subprojects
    Status { subproject: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_dir = get_config_dir(cli.config_dir.as_deref())
        .map_err(|e| codeweave::WeaveError::Config(e.to_string()))?;

    if let Commands::Config { show } = cli.command {
        if show {
            show_config(&config_dir)?;
        } else {
            run_interactive_config(&config_dir)?;
        }
        return Ok(());
    }

    let config = Config::load(&config_dir)?;
    match cli.command {
        Commands::Config { .. } => {}
        Commands::Add { subproject, repos } => {
            add_repositories(config, &subproject, &repos).await?;
        }
        Commands::Remove { subproject, repo } => {
            remove_repository(config, &subproject, &repo).await?;
        }
        Commands::List => {
            list_subprojects(config).await?;
        }
        Commands::Index { subproject, full } => {
            index_subproject(config, &subproject, full).await?;
        }
        Commands::Search {
            subproject,
            query,
            top_k,
            repos,
            keyword_boost,
            json,
        } => {
            let options = SearchOptions {
                top_k,
                repos,
                keyword_boost,
            };
            search(config, &subproject, &query, &options, json).await?;
        }
        Commands::Context {
            subproject,
            query,
            top_k,
            repos,
            attachments,
            keyword_boost,
            budget,
            output,
        } => {
            let request = ContextRequest {
                attachments: attachments
                    .iter()
                    .map(|reference| AttachmentRequest::parse(reference))
                    .collect::<Result<Vec<_>>>()?,
                repo_filter: repos,
                top_k,
                keyword_boost,
                token_budget: budget,
                ..ContextRequest::new(&query)
            };
            build_context(config, &subproject, &request, output.as_deref()).await?;
        }
        Commands::Backends => {
            list_backends(config).await?;
        }
        Commands::Status { subproject } => {
            show_status(config, subproject.as_deref()).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn add_command_with_repositories() {
        let cli = Cli::try_parse_from(["codeweave", "add", "shop", "/src/api", "/src/web"])
            .expect("should parse");

        let Commands::Add { subproject, repos } = cli.command else {
            panic!("expected add command");
        };
        assert_eq!(subproject, "shop");
        assert_eq!(repos, vec![PathBuf::from("/src/api"), PathBuf::from("/src/web")]);
    }

    #[test]
    fn index_defaults_to_incremental() {
        let cli = Cli::try_parse_from(["codeweave", "index", "shop"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Index { full: false, .. }));

        let cli =
            Cli::try_parse_from(["codeweave", "index", "shop", "--full"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Index { full: true, .. }));
    }

    #[test]
    fn search_options() {
        let cli = Cli::try_parse_from([
            "codeweave",
            "search",
            "shop",
            "parse request",
            "--top-k",
            "3",
            "--repo",
            "/src/api",
            "--keyword-boost",
        ])
        .expect("should parse");

        let Commands::Search {
            top_k,
            repos,
            keyword_boost,
            json,
            ..
        } = cli.command
        else {
            panic!("expected search command");
        };
        assert_eq!(top_k, 3);
        assert_eq!(repos, vec!["/src/api".to_string()]);
        assert!(keyword_boost);
        assert!(!json);
    }

    #[test]
    fn context_with_attachments_and_budget() {
        let cli = Cli::try_parse_from([
            "codeweave",
            "context",
            "shop",
            "why?",
            "--attach",
            "src/lib.rs:10-20",
            "--budget",
            "8000",
            "--config-dir",
            "/tmp/weave",
        ])
        .expect("should parse");

        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/weave")));
        let Commands::Context {
            attachments,
            budget,
            output,
            ..
        } = cli.command
        else {
            panic!("expected context command");
        };
        assert_eq!(attachments, vec!["src/lib.rs:10-20".to_string()]);
        assert_eq!(budget, Some(8000));
        assert_eq!(output, None);
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["codeweave", "config", "--show"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Config { show: true }));
    }

    #[test]
    fn invalid_command() {
        let err = Cli::try_parse_from(["codeweave", "serve"])
            .err()
            .expect("should fail");
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn help_message() {
        let err = Cli::try_parse_from(["codeweave", "--help"])
            .err()
            .expect("should fail");
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }
}

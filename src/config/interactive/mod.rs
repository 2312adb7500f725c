
use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select};
use std::path::Path;

use super::{Config, ConfigError, OllamaConfig};
use crate::database::BackendRegistry;
use crate::embeddings::EmbeddingProvider;

#[inline]
pub fn run_interactive_config(config_dir: &Path) -> Result<()> {
    eprintln!("{}", style("🔧 codeweave Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config(config_dir);

    eprintln!("{}", style("Embedding Configuration").bold().yellow());
    configure_embedding(&mut config)?;

    if config.embedding.provider == EmbeddingProvider::Ollama {
        eprintln!();
        eprintln!("{}", style("Ollama Configuration").bold().yellow());
        eprintln!("Configure your local Ollama instance for embedding generation.");
        eprintln!();

        configure_ollama(&mut config.ollama)?;

        eprintln!();
        eprintln!("{}", style("Testing configuration...").yellow());

        if test_ollama_connection(&config.ollama) {
            eprintln!("{}", style("✓ Ollama connection successful!").green());
        } else {
            eprintln!(
                "{}",
                style("⚠ Warning: Could not connect to Ollama").yellow()
            );
            eprintln!("You can continue, but make sure Ollama is running before indexing.");
        }
    }

    eprintln!();
    eprintln!("{}", style("Vector Store Configuration").bold().yellow());
    configure_vector_store(&mut config)?;

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;

    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Embedding:").bold().yellow());
    eprintln!(
        "  Provider: {}",
        style(config.embedding.provider.as_str()).cyan()
    );
    eprintln!("  Dimension: {}", style(config.embedding.dimension).cyan());
    if config.embedding.provider == EmbeddingProvider::Ollama {
        match config.ollama_url() {
            Ok(url) => eprintln!("  Ollama URL: {}", style(url).cyan()),
            Err(e) => eprintln!("  Ollama URL: {} ({})", style("Invalid").red(), e),
        }
        eprintln!("  Model: {}", style(&config.ollama.model).cyan());
        eprintln!("  Batch Size: {}", style(config.ollama.batch_size).cyan());
    }

    eprintln!();
    eprintln!("{}", style("Chunking:").bold().yellow());
    eprintln!(
        "  Max lines: {} (overlap {})",
        style(config.chunking.max_chunk_lines).cyan(),
        style(config.chunking.overlap_lines).cyan()
    );

    eprintln!();
    eprintln!("{}", style("Indexing:").bold().yellow());
    eprintln!(
        "  Max file size: {} KB",
        style(config.indexing.max_file_size_kb).cyan()
    );
    eprintln!("  Workers: {}", style(config.indexing.workers).cyan());
    eprintln!(
        "  Include: {}",
        style(config.indexing.include_patterns.join(" ")).dim()
    );
    eprintln!(
        "  Exclude: {}",
        style(config.indexing.exclude_patterns.join(" ")).dim()
    );

    eprintln!();
    eprintln!("{}", style("Vector Store:").bold().yellow());
    eprintln!("  Backend: {}", style(&config.vector_store.backend).cyan());
    if config.vector_store.backend == "qdrant" {
        eprintln!("  Qdrant URL: {}", style(&config.vector_store.qdrant_url).cyan());
    }

    eprintln!();
    eprintln!("{}", style("Prompt:").bold().yellow());
    eprintln!(
        "  Token budget: {} (reserve {})",
        style(config.prompt.token_budget).cyan(),
        style(config.prompt.reserve_reply_tokens).cyan()
    );
    eprintln!(
        "  Tokenizer: {}",
        style(config.prompt.tokenizer.as_str()).cyan()
    );

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );

    Ok(())
}

fn load_existing_config(config_dir: &Path) -> Config {
    Config::load(config_dir).map_or_else(
        |_| {
            eprintln!(
                "{}",
                style("No existing configuration found. Using defaults.").yellow()
            );
            Config {
                base_dir: config_dir.to_path_buf(),
                ..Config::default()
            }
        },
        |config| {
            eprintln!("{}", style("Found existing configuration.").green());
            config
        },
    )
}

fn configure_embedding(config: &mut Config) -> Result<()> {
    let providers = [EmbeddingProvider::Ollama, EmbeddingProvider::Hashing];
    let labels: Vec<&str> = providers.iter().map(|p| p.as_str()).collect();
    let default_index = providers
        .iter()
        .position(|p| *p == config.embedding.provider)
        .unwrap_or(0);

    let index = Select::new()
        .with_prompt("Embedding provider")
        .default(default_index)
        .items(&labels)
        .interact()?;
    config.embedding.provider = providers[index];

    let dimension: usize = Input::new()
        .with_prompt("Embedding dimension")
        .default(config.embedding.dimension)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if (8..=4096).contains(input) {
                Ok(())
            } else {
                Err("Dimension must be between 8 and 4096")
            }
        })
        .interact_text()?;
    config.embedding.dimension = dimension;

    Ok(())
}

fn configure_ollama(ollama: &mut OllamaConfig) -> Result<()> {
    let protocols = &["http", "https"];
    let default_index = protocols
        .iter()
        .position(|&p| p == ollama.protocol)
        .unwrap_or(0);

    let protocol_index = Select::new()
        .with_prompt("Ollama protocol")
        .default(default_index)
        .items(protocols)
        .interact()?;

    let protocol = protocols[protocol_index].to_string();

    let host: String = Input::new()
        .with_prompt("Ollama host")
        .default(ollama.host.clone())
        .validate_with(|input: &String| -> Result<(), ConfigError> {
            let temp_config = OllamaConfig {
                protocol: protocol.clone(),
                host: input.clone(),
                ..OllamaConfig::default()
            };
            temp_config.validate()
        })
        .interact_text()?;

    let port: u16 = Input::new()
        .with_prompt("Ollama port")
        .default(ollama.port)
        .validate_with(|input: &u16| -> Result<(), &str> {
            if *input == 0 {
                Err("Port must be greater than 0")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let model: String = Input::new()
        .with_prompt("Embedding model")
        .default(ollama.model.clone())
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.trim().is_empty() {
                Err("Model name cannot be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let batch_size: u32 = Input::new()
        .with_prompt("Batch size for embedding generation")
        .default(ollama.batch_size)
        .validate_with(|input: &u32| -> Result<(), &str> {
            if *input == 0 {
                Err("Batch size must be greater than 0")
            } else if *input > 1000 {
                Err("Batch size must be 1000 or less")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    ollama.set_protocol(protocol)?;
    ollama.set_host(host)?;
    ollama.set_port(port)?;
    ollama.set_model(model)?;
    ollama.set_batch_size(batch_size)?;

    Ok(())
}

fn configure_vector_store(config: &mut Config) -> Result<()> {
    let backends = BackendRegistry::default().list_available_backends();
    let default_index = backends
        .iter()
        .position(|name| *name == config.vector_store.backend)
        .unwrap_or(0);

    let index = Select::new()
        .with_prompt("Vector store backend")
        .default(default_index)
        .items(&backends)
        .interact()?;
    config.vector_store.backend = backends[index].clone();

    if config.vector_store.backend == "qdrant" {
        let url: String = Input::new()
            .with_prompt("Qdrant gRPC URL")
            .default(config.vector_store.qdrant_url.clone())
            .validate_with(|input: &String| -> Result<(), String> {
                url::Url::parse(input)
                    .map(|_| ())
                    .map_err(|e| format!("Invalid URL: {e}"))
            })
            .interact_text()?;
        config.vector_store.qdrant_url = url;
    }

    Ok(())
}

fn test_ollama_connection(ollama: &OllamaConfig) -> bool {
    let url = format!(
        "{}://{}:{}/api/version",
        ollama.protocol, ollama.host, ollama.port
    );

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(std::time::Duration::from_secs(5)))
        .build()
        .into();

    match agent.get(&url).call() {
        Ok(_) => true,
        Err(ureq::Error::StatusCode(code)) if (400..500).contains(&code) => true,
        Err(_) => false,
    }
}

// Configuration management
// TOML settings plus the interactive `config` command

pub mod interactive;
pub mod settings;


pub use interactive::{run_interactive_config, show_config};
pub use settings::{Config, ConfigError, OllamaConfig};

/// Get the configuration directory path, preferring an explicit override
#[inline]
pub fn get_config_dir(
    override_dir: Option<&std::path::Path>,
) -> Result<std::path::PathBuf, ConfigError> {
    override_dir.map_or_else(Config::default_dir, |dir| Ok(dir.to_path_buf()))
}

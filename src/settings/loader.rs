//! Configuration loading
//!
//! Layers, lowest priority first: embedded defaults, `config/default`,
//! `config/{EXECSTREAM_ENV}`, `config/local`, then `EXECSTREAM_*` variables.

use super::AppConfig;
use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Load configuration from files and environment
pub fn load_config() -> Result<AppConfig> {
    let env_name = std::env::var("EXECSTREAM_ENV").unwrap_or_else(|_| "development".to_string());

    let config = file_layers(&env_name)
        // EXECSTREAM_DATABASE__URL: single `_` after the prefix, `__` between levels.
        .add_source(
            Environment::with_prefix("EXECSTREAM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

fn file_layers(env_name: &str) -> ConfigBuilder<DefaultState> {
    Config::builder()
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{env_name}")).required(false))
        .add_source(File::with_name("config/local").required(false))
}

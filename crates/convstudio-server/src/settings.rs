//! Layered configuration loading

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use convstudio_core::StudioConfig;
use std::path::Path;

const DEFAULT_CONFIG_FILE: &str = "studio.toml";

/// Defaults, then the config file, then `STUDIO_<SECTION>__<KEY>` variables.
///
/// An explicit `path` must exist; the default `studio.toml` is optional.
pub fn load_config(path: Option<&Path>) -> Result<StudioConfig> {
    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::from(Path::new(DEFAULT_CONFIG_FILE)).required(false),
    };

    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix("STUDIO")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to read configuration sources")?;

    config
        .try_deserialize::<StudioConfig>()
        .context("Invalid configuration")
}

// Configuration module for the telemetry pipeline
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

mod loader;
pub mod types;

pub use loader::{ConfigLoader, MAX_FRAME_RATE_HZ};
pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Allow environment variables to override config values
pub fn apply_env_overrides(config: &mut PipelineConfig) {
    if let Ok(user_id) = std::env::var("PIPELINE_USER_ID") {
        config.source.user_id = user_id;
    }

    if let Ok(relay_url) = std::env::var("PIPELINE_RELAY_URL") {
        config.client.relay_url = relay_url;
    }
}

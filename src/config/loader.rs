// Configuration loader with environment variable substitution

use super::types::*;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;

/// Highest demo frame rate accepted; the generator clamps to it as well
pub const MAX_FRAME_RATE_HZ: u32 = 1000;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        Self::parse(&content)
    }

    /// Parse YAML text, substituting environment variables first
    pub fn parse(content: &str) -> Result<PipelineConfig> {
        let content = Self::substitute_env_vars(content)?;

        let config: PipelineConfig = serde_yaml::from_str(&content)
            .context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${PIPELINE_USER_ID:-local} -> local (if PIPELINE_USER_ID not set)
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}")
            .context("Invalid substitution pattern")?;

        Ok(re
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match std::env::var(var_name) {
                    Ok(value) => value,
                    Err(_) => match default_value {
                        Some(default) => default.to_string(),
                        // Keep original if no default and var not found
                        None => format!("${{{}}}", var_name),
                    },
                }
            })
            .to_string())
    }

    /// Validate configuration
    fn validate(config: &PipelineConfig) -> Result<()> {
        match config.broker.backend.as_str() {
            "memory" | "zenoh" => {}
            unknown => bail!("Unknown broker backend: '{}'. Supported: memory, zenoh", unknown),
        }

        let topics = &config.broker.topics;
        if topics.prefix.is_empty() {
            bail!("broker.topics.prefix cannot be empty");
        }
        if topics.partitions == 0 {
            bail!("broker.topics.partitions must be > 0");
        }
        if topics.retention_seconds == 0 {
            bail!("broker.topics.retention_seconds must be > 0");
        }

        let producer = &config.producer;
        if producer.batch_size == 0 {
            bail!("producer.batch_size must be > 0");
        }
        if producer.flush_interval_ms == 0 {
            bail!("producer.flush_interval_ms must be > 0");
        }
        if producer.max_buffered_messages < producer.batch_size {
            bail!("producer.max_buffered_messages must be >= producer.batch_size");
        }

        let consumer = &config.consumer;
        if consumer.group_id.is_empty() {
            bail!("consumer.group_id cannot be empty");
        }
        if consumer.poll_batch_size == 0 || consumer.frame_batch_size == 0 {
            bail!("consumer batch sizes must be > 0");
        }
        if consumer.heartbeat_interval_ms == 0 {
            bail!("consumer.heartbeat_interval_ms must be > 0");
        }
        if consumer.max_pending_rows < consumer.frame_batch_size {
            bail!("consumer.max_pending_rows must be >= consumer.frame_batch_size");
        }

        match config.source.mode.as_str() {
            "live" | "demo" => {}
            unknown => bail!("Unknown source mode: '{}'. Supported: live, demo", unknown),
        }
        if config.source.user_id.is_empty() {
            bail!("source.user_id cannot be empty");
        }
        if !(1..=MAX_FRAME_RATE_HZ).contains(&config.source.demo.frame_rate_hz) {
            bail!("source.demo.frame_rate_hz must be 1-{}", MAX_FRAME_RATE_HZ);
        }

        if config.relay.liveness_timeout_ms == 0 {
            bail!("relay.liveness_timeout_ms must be > 0");
        }
        if config.relay.viewer_channel_capacity == 0 {
            bail!("relay.viewer_channel_capacity must be > 0");
        }

        let client = &config.client;
        if client.reconnect_base_ms == 0 || client.reconnect_max_ms < client.reconnect_base_ms {
            bail!("client reconnect delays must satisfy 0 < reconnect_base_ms <= reconnect_max_ms");
        }
        if client.lock_refresh_ms >= client.lock_ttl_ms {
            bail!("client.lock_refresh_ms must be shorter than client.lock_ttl_ms");
        }
        if client.render_max_hz == 0 {
            bail!("client.render_max_hz must be > 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("PIPELINE_TEST_VAR", "test_value");

        let input = "url: ${PIPELINE_TEST_VAR}";
        let output = ConfigLoader::substitute_env_vars(input).unwrap();
        assert_eq!(output, "url: test_value");

        std::env::remove_var("PIPELINE_TEST_VAR");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("PIPELINE_TEST_VAR2");

        let input = "user_id: ${PIPELINE_TEST_VAR2:-driver-7}";
        let output = ConfigLoader::substitute_env_vars(input).unwrap();
        assert_eq!(output, "user_id: driver-7");
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigLoader::validate(&PipelineConfig::default()).is_ok());
    }

    #[test]
    fn test_validation_zero_batch_size() {
        let mut config = PipelineConfig::default();
        config.producer.batch_size = 0;

        let result = ConfigLoader::validate(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("batch_size"));
    }

    #[test]
    fn test_validation_frame_rate_bounds() {
        let mut config = PipelineConfig::default();
        config.source.demo.frame_rate_hz = 2_000_000;

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("frame_rate_hz"));

        config.source.demo.frame_rate_hz = MAX_FRAME_RATE_HZ;
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_validation_pending_rows_cover_a_batch() {
        let mut config = PipelineConfig::default();
        config.consumer.max_pending_rows = config.consumer.frame_batch_size - 1;

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("max_pending_rows"));
    }

    #[test]
    fn test_validation_zero_liveness_timeout() {
        let mut config = PipelineConfig::default();
        config.relay.liveness_timeout_ms = 0;

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("liveness_timeout_ms"));
    }

    #[test]
    fn test_validation_lock_refresh_must_be_shorter_than_ttl() {
        let mut config = PipelineConfig::default();
        config.client.lock_refresh_ms = config.client.lock_ttl_ms;

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("lock_refresh_ms"));
    }
}

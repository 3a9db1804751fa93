// Configuration system integration tests

use std::fs;
use std::path::PathBuf;
use telemetry_pipeline::config::{load_config, load_config_with_env, PipelineConfig};
use telemetry_pipeline::Encoding;

#[test]
fn test_load_default_config() {
    let config_path = PathBuf::from("config/default.yaml");

    if config_path.exists() {
        let result = load_config(&config_path);
        assert!(result.is_ok(), "Failed to load default config: {:?}", result.err());

        let config = result.unwrap();

        // Verify defaults
        assert_eq!(config.broker.backend, "memory");
        assert_eq!(config.broker.topics.prefix, "telemetry-user-");
        assert!(!config.broker.zenoh.allow_split_roles);
        assert_eq!(config.consumer.max_pending_rows, 50_000);
        assert_eq!(config.consumer.group_id, "telemetry-persistence");
        assert_eq!(config.relay.liveness_timeout_ms, 30_000);
        assert_eq!(config.client.render_max_hz, 15);
        assert_eq!(config.logging.level, "info");
    }
}

#[test]
fn test_config_with_env_vars() {
    let temp_config = r#"
broker:
  backend: memory
  topics:
    prefix: ${CFG_TEST_PREFIX:-telemetry-user-}
    partitions: 4
    retention_seconds: 600

producer:
  batch_size: 50
  encoding: json

relay:
  bind: ${CFG_TEST_BIND:-0.0.0.0:8080}
  group_id: ${CFG_TEST_GROUP:-telemetry-relay}

client:
  relay_url: ${CFG_TEST_URL:-ws://default:8080/ws}

source:
  mode: live
  user_id: ${CFG_TEST_USER:-driver}
  live:
    broadcast_addr: 10.0.0.5:9000

logging:
  level: debug
  format: compact
"#;

    let dir = tempfile::tempdir().unwrap();
    let temp_path = dir.path().join("pipeline.yaml");
    fs::write(&temp_path, temp_config).expect("Failed to write temp config");

    std::env::set_var("CFG_TEST_URL", "ws://testhost:9000/ws");
    std::env::set_var("CFG_TEST_USER", "driver-44");

    let result = load_config(&temp_path);
    assert!(result.is_ok(), "Failed to load config with env vars: {:?}", result.err());
    let config = result.unwrap();

    assert_eq!(config.client.relay_url, "ws://testhost:9000/ws");
    assert_eq!(config.relay.bind, "0.0.0.0:8080"); // Uses default

    assert_eq!(config.broker.topics.partitions, 4);
    assert_eq!(config.producer.batch_size, 50);
    assert_eq!(config.producer.encoding, Encoding::Json);
    // Unset fields keep their defaults
    assert_eq!(config.producer.flush_interval_ms, 100);
    assert_eq!(config.source.user_id, "driver-44");
    assert_eq!(config.source.live.broadcast_addr, "10.0.0.5:9000");
    assert_eq!(config.logging.format, "compact");

    std::env::remove_var("CFG_TEST_URL");
    std::env::remove_var("CFG_TEST_USER");
}

#[test]
fn test_env_overrides_relay_url() {
    let temp_config = r#"
client:
  relay_url: ws://localhost:8080/ws
"#;
    let dir = tempfile::tempdir().unwrap();
    let temp_path = dir.path().join("pipeline.yaml");
    fs::write(&temp_path, temp_config).unwrap();

    std::env::set_var("PIPELINE_RELAY_URL", "ws://relay.internal:8080/ws");
    let config = load_config_with_env(&temp_path).unwrap();
    std::env::remove_var("PIPELINE_RELAY_URL");

    assert_eq!(config.client.relay_url, "ws://relay.internal:8080/ws");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let temp_path = dir.path().join("minimal.yaml");
    fs::write(&temp_path, "logging:\n  level: warn\n").unwrap();

    let config = load_config(&temp_path).unwrap();
    let defaults = PipelineConfig::default();
    assert_eq!(config.consumer.max_pending_rows, defaults.consumer.max_pending_rows);
    assert_eq!(config.source.mode, defaults.source.mode);
    assert_eq!(config.client.lock_ttl_ms, defaults.client.lock_ttl_ms);
    assert_eq!(config.logging.level, "warn");
}

#[test]
fn test_invalid_configs_are_rejected() {
    let cases = [
        ("broker:\n  backend: kafka\n", "broker backend"),
        ("source:\n  demo:\n    frame_rate_hz: 5000\n", "frame_rate_hz"),
        ("source:\n  mode: replay\n", "source mode"),
        ("consumer:\n  heartbeat_interval_ms: 0\n", "heartbeat_interval_ms"),
        ("client:\n  lock_ttl_ms: 1000\n  lock_refresh_ms: 2000\n", "lock_refresh_ms"),
    ];

    let dir = tempfile::tempdir().unwrap();
    for (i, (yaml, expected)) in cases.iter().enumerate() {
        let path = dir.path().join(format!("bad-{}.yaml", i));
        fs::write(&path, yaml).unwrap();
        let err = load_config(&path).unwrap_err();
        let message = format!("{:#}", err);
        assert!(
            message.contains(expected),
            "expected '{}' in error: {}",
            expected,
            message
        );
    }
}

#[test]
fn test_missing_file_is_an_error() {
    let result = load_config("/nonexistent/pipeline.yaml");
    assert!(result.is_err());
}

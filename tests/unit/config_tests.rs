//! Unit tests for bridge configuration parsing and validation.

use std::time::Duration;

use agent_relay::config::{BridgeConfig, StdinMode};
use agent_relay::AppError;

/// A minimal TOML config parses with defaults applied.
#[test]
fn minimal_config_applies_defaults() {
    let config = BridgeConfig::from_toml_str(
        r#"
        agent_cmd = "claude"
        workspace_root = "/tmp/work"
        "#,
    )
    .expect("minimal config must parse");

    assert!(config.agent_args.is_empty());
    assert_eq!(config.stdin_mode, StdinMode::Piped);
    assert_eq!(config.stderr_tail_lines, 20);
    assert_eq!(config.hold_back(), Duration::from_millis(250));
}

/// Full fields round-trip.
#[test]
fn full_config_parses() {
    let config = BridgeConfig::from_toml_str(
        r#"
        agent_cmd = "claude"
        agent_args = ["--output-format", "stream-json"]
        workspace_root = "/srv/project"
        stdin_mode = "closed"
        stderr_tail_lines = 5

        [queue]
        hold_back_ms = 400
        "#,
    )
    .expect("full config must parse");

    assert_eq!(config.agent_args.len(), 2);
    assert_eq!(config.stdin_mode, StdinMode::Closed);
    assert_eq!(config.stderr_tail_lines, 5);
    assert_eq!(config.hold_back(), Duration::from_millis(400));
}

/// Malformed TOML maps to a config error.
#[test]
fn malformed_toml_is_a_config_error() {
    let err = BridgeConfig::from_toml_str("agent_cmd = [broken").expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)));
}

/// An empty agent command fails validation.
#[test]
fn empty_agent_cmd_is_rejected() {
    let err = BridgeConfig::from_toml_str(
        r#"
        agent_cmd = "  "
        workspace_root = "/tmp"
        "#,
    )
    .expect_err("blank command must fail validation");

    assert!(
        matches!(err, AppError::Config(ref msg) if msg.contains("agent_cmd")),
        "got {err:?}"
    );
}

/// A zero stderr tail fails validation.
#[test]
fn zero_stderr_tail_is_rejected() {
    let err = BridgeConfig::from_toml_str(
        r#"
        agent_cmd = "claude"
        workspace_root = "/tmp"
        stderr_tail_lines = 0
        "#,
    )
    .expect_err("zero tail must fail validation");

    assert!(matches!(err, AppError::Config(_)));
}

use super::*;
use serial_test::serial;
use std::env;

// These tests mutate process-global environment variables, so `#[serial]`
// keeps them from racing each other under `cargo test`.

fn cleanup_test_env() {
    env::remove_var("WORKSPACE_BASE");
    env::remove_var("MAX_AGENTS");
    env::remove_var("MAX_CONCURRENT");
    env::remove_var("MAX_DEPTH");
    env::remove_var("AGENT_BACKEND");
    env::remove_var("ENABLE_THINKING_CAPTURE");
}

#[test]
#[serial]
fn defaults_apply_when_unset() {
    cleanup_test_env();
    let config = Config::load().unwrap();
    assert_eq!(config.max_agents, DEFAULT_MAX_AGENTS);
    assert_eq!(config.max_concurrent, DEFAULT_MAX_CONCURRENT);
    assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
    assert_eq!(config.agent_backend, AgentBackendKind::Session);
    assert!(!config.enable_thinking_capture);
    cleanup_test_env();
}

#[test]
#[serial]
fn overrides_are_read_from_environment() {
    cleanup_test_env();
    env::set_var("WORKSPACE_BASE", "/tmp/custom-base");
    env::set_var("MAX_AGENTS", "10");
    env::set_var("MAX_CONCURRENT", "4");
    env::set_var("MAX_DEPTH", "2");
    env::set_var("AGENT_BACKEND", "process");
    env::set_var("ENABLE_THINKING_CAPTURE", "true");

    let config = Config::load().unwrap();
    assert_eq!(config.workspace_base, "/tmp/custom-base");
    assert_eq!(config.max_agents, 10);
    assert_eq!(config.max_concurrent, 4);
    assert_eq!(config.max_depth, 2);
    assert_eq!(config.agent_backend, AgentBackendKind::Process);
    assert!(config.enable_thinking_capture);

    cleanup_test_env();
}

#[test]
#[serial]
fn invalid_agent_backend_is_a_configuration_error() {
    cleanup_test_env();
    env::set_var("AGENT_BACKEND", "carrier-pigeon");

    let result = Config::load();
    assert!(matches!(result, Err(SpiralError::ConfigurationError(_))));

    cleanup_test_env();
}

#[test]
#[serial]
fn non_numeric_limit_is_a_configuration_error() {
    cleanup_test_env();
    env::set_var("MAX_AGENTS", "not-a-number");

    let result = Config::load();
    assert!(matches!(result, Err(SpiralError::ConfigurationError(_))));

    cleanup_test_env();
}

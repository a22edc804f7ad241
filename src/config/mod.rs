//! Environment-driven configuration (§6 "Configuration (environment)").

use crate::error::{Result, SpiralError};
use crate::constants::{DEFAULT_MAX_AGENTS, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_DEPTH};
use serde::{Deserialize, Serialize};
use std::env;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentBackendKind {
    Session,
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub workspace_base: String,
    pub max_agents: u32,
    pub max_concurrent: u32,
    pub max_depth: u32,
    pub agent_backend: AgentBackendKind,
    pub enable_thinking_capture: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!(path = ?path, "loaded .env file"),
            Err(e) => tracing::debug!(error = %e, "no .env file loaded"),
        }

        let workspace_base = env::var("WORKSPACE_BASE")
            .unwrap_or_else(|_| "{workspaceFolder}/.agent-workspace".to_string());

        let max_agents = parse_env_or("MAX_AGENTS", DEFAULT_MAX_AGENTS)?;
        let max_concurrent = parse_env_or("MAX_CONCURRENT", DEFAULT_MAX_CONCURRENT)?;
        let max_depth = parse_env_or("MAX_DEPTH", DEFAULT_MAX_DEPTH)?;

        let agent_backend = match env::var("AGENT_BACKEND").as_deref() {
            Ok("session") | Err(_) => AgentBackendKind::Session,
            Ok("process") => AgentBackendKind::Process,
            Ok(other) => {
                return Err(SpiralError::ConfigurationError(format!(
                    "AGENT_BACKEND must be 'session' or 'process', got {other:?}"
                )))
            }
        };

        let enable_thinking_capture = match env::var("ENABLE_THINKING_CAPTURE").as_deref() {
            Ok("true") => true,
            Ok("false") | Err(_) => false,
            Ok(other) => {
                return Err(SpiralError::ConfigurationError(format!(
                    "ENABLE_THINKING_CAPTURE must be 'true' or 'false', got {other:?}"
                )))
            }
        };

        Ok(Config {
            workspace_base,
            max_agents,
            max_concurrent,
            max_depth,
            agent_backend,
            enable_thinking_capture,
        })
    }
}

fn parse_env_or(key: &str, default: u32) -> Result<u32> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| SpiralError::ConfigurationError(format!("{key} must be a positive integer, got {value:?}"))),
        Err(_) => Ok(default),
    }
}

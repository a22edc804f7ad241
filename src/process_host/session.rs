//! Backend S: agent runs inside a named detached multiplexer session.
//! The multiplexer itself is an external collaborator (spec §1
//! non-goals); this backend only shells out to its CLI the way any other
//! invoked tool is shelled out to elsewhere in this codebase.

use super::{Handle, KillResult, ProcessHost};
use crate::constants::PROCESS_PROBE_TIMEOUT;
use crate::error::{Result, SpiralError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

const MULTIPLEXER_BIN: &str = "tmux";

pub struct SessionBackend;

impl SessionBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SessionBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessHost for SessionBackend {
    async fn spawn(
        &self,
        cwd: &Path,
        argv: &[String],
        env: &HashMap<String, String>,
        log_path: &Path,
    ) -> Result<Handle> {
        super::preflight_checks(cwd)?;

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let session_name = format!("spiral-{}", uuid_like_suffix());
        let shell_cmd = format!(
            "{} 2>&1 | tee -a {}",
            shell_quote_argv(argv),
            shell_quote(&log_path.display().to_string())
        );

        let status = Command::new(MULTIPLEXER_BIN)
            .arg("new-session")
            .arg("-d")
            .arg("-s")
            .arg(&session_name)
            .arg("-c")
            .arg(cwd)
            .envs(env)
            .arg(shell_cmd)
            .status()
            .await
            .map_err(|e| SpiralError::SpawnFailed {
                reason: format!("failed to invoke {MULTIPLEXER_BIN}: {e}"),
            })?;

        if !status.success() {
            return Err(SpiralError::SpawnFailed {
                reason: format!("{MULTIPLEXER_BIN} new-session exited with {status}"),
            });
        }

        debug!(session = %session_name, "session backend spawned agent");
        Ok(Handle::Session { name: session_name })
    }

    async fn alive(&self, handle: &Handle) -> bool {
        let Handle::Session { name } = handle else {
            return false;
        };
        let probe = Command::new(MULTIPLEXER_BIN)
            .arg("has-session")
            .arg("-t")
            .arg(name)
            .status();
        match tokio::time::timeout(PROCESS_PROBE_TIMEOUT, probe).await {
            Ok(result) => result.map(|s| s.success()).unwrap_or(false),
            Err(_) => {
                warn!(session = %name, "liveness probe timed out, treating session as dead");
                false
            }
        }
    }

    async fn kill(&self, handle: &Handle, reason: &str) -> Result<KillResult> {
        let Handle::Session { name } = handle else {
            return Err(SpiralError::InvalidArgument(
                "session backend given a process handle".to_string(),
            ));
        };
        if !self.alive(handle).await {
            return Ok(KillResult::AlreadyDead);
        }
        debug!(session = %name, reason, "killing multiplexer session");
        let kill = Command::new(MULTIPLEXER_BIN)
            .arg("kill-session")
            .arg("-t")
            .arg(name)
            .status();
        let status = match tokio::time::timeout(PROCESS_PROBE_TIMEOUT, kill).await {
            Ok(result) => result.map_err(|e| SpiralError::SpawnFailed {
                reason: e.to_string(),
            })?,
            Err(_) => {
                return Err(SpiralError::SpawnFailed {
                    reason: format!("{MULTIPLEXER_BIN} kill-session timed out"),
                })
            }
        };
        Ok(if status.success() {
            KillResult::Terminated
        } else {
            KillResult::ForceKilled
        })
    }

    async fn last_output(&self, handle: &Handle) -> Option<String> {
        let Handle::Session { name } = handle else {
            return None;
        };
        let capture = Command::new(MULTIPLEXER_BIN)
            .arg("capture-pane")
            .arg("-t")
            .arg(name)
            .arg("-p")
            .output();
        let output = tokio::time::timeout(PROCESS_PROBE_TIMEOUT, capture)
            .await
            .ok()?
            .ok()?;
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn uuid_like_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..10)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn shell_quote_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

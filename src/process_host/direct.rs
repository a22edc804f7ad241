//! Backend P: agent spawned as a detached child process with its own
//! process group. Liveness is a signal-0 probe; termination signals the
//! whole group so grandchildren die with the agent.
//!
//! Grounded on `examples/gyasis-dev-kid/rust-watchdog/src/process.rs`'s
//! `is_alive`/`kill_process`/`kill_process_group` (SIGTERM, sleep, SIGKILL
//! if still alive, `killpg` for group signaling).

use super::{Handle, KillResult, ProcessHost};
use crate::constants::KILL_GRACE_PERIOD;
use crate::error::{Result, SpiralError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use tracing::{debug, warn};

pub struct DirectProcessBackend;

impl DirectProcessBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DirectProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessHost for DirectProcessBackend {
    async fn spawn(
        &self,
        cwd: &Path,
        argv: &[String],
        env: &HashMap<String, String>,
        log_path: &Path,
    ) -> Result<Handle> {
        super::preflight_checks(cwd)?;

        let Some((program, args)) = argv.split_first() else {
            return Err(SpiralError::SpawnFailed {
                reason: "empty argv".to_string(),
            });
        };

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stdout_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| SpiralError::SpawnFailed {
                reason: format!("could not open log file: {e}"),
            })?;
        let stderr_file = stdout_file.try_clone().map_err(|e| SpiralError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file));

        // Own process group: pgid == pid of the leader, so killpg(pid)
        // reaches children the agent CLI itself spawns.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| SpiralError::SpawnFailed {
            reason: e.to_string(),
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SpiralError::SpawnFailed {
                reason: "child exited before pid was observable".to_string(),
            })? as i32;

        // The controller supervises via pid/liveness probes, not via a
        // Rust-owned process handle, so the agent survives controller
        // restarts. Still reap it in the background on exit, otherwise a
        // self-forked child lingers as a zombie that a signal-0 probe
        // continues to report as alive.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(Handle::Process { pid, pgid: pid })
    }

    async fn alive(&self, handle: &Handle) -> bool {
        let Handle::Process { pid, .. } = handle else {
            return false;
        };
        is_process_alive(*pid)
    }

    async fn kill(&self, handle: &Handle, reason: &str) -> Result<KillResult> {
        let Handle::Process { pgid, .. } = handle else {
            return Err(SpiralError::InvalidArgument(
                "direct backend given a session handle".to_string(),
            ));
        };
        if !is_process_alive(*pgid) {
            return Ok(KillResult::AlreadyDead);
        }

        debug!(pgid, reason, "sending SIGTERM to process group");
        send_group_signal(*pgid, nix::sys::signal::Signal::SIGTERM);
        tokio::time::sleep(KILL_GRACE_PERIOD).await;

        if !is_process_alive(*pgid) {
            return Ok(KillResult::Terminated);
        }

        warn!(pgid, "process group survived SIGTERM, sending SIGKILL");
        send_group_signal(*pgid, nix::sys::signal::Signal::SIGKILL);
        Ok(KillResult::ForceKilled)
    }

    async fn last_output(&self, _handle: &Handle) -> Option<String> {
        // No pane buffer analog for a direct child; the caller falls back
        // to whatever is in the stream log, however partial.
        None
    }
}

fn is_process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

fn send_group_signal(pgid: i32, signal: nix::sys::signal::Signal) {
    // Negative pid targets the whole process group under POSIX semantics.
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(-pgid), signal);
}

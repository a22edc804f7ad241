//! Process Host Abstraction (§4.D): a uniform capability interface over
//! two backends — a session-multiplexer-hosted shell (Backend S) and a
//! direct detached child process with its own process group (Backend P).
//!
//! Grounded on `examples/gyasis-dev-kid/rust-watchdog/src/process.rs` for
//! the liveness/kill primitives (`kill(pid, None)` probing, SIGTERM then
//! SIGKILL after a grace period, process-group signaling) and on the
//! teacher's `claude_code/cli_client.rs` for the "spawn a CLI reading a
//! prompt file, capture its stdout" shape — generalized here from a
//! blocking one-shot `wait_with_output()` call into a handle-based
//! spawn/alive/kill capability so the controller never blocks on agent
//! completion.

pub mod direct;
pub mod session;

use crate::error::Result;
use crate::models::BackendHandle;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

/// Opaque handle identifying a running agent process/session. Carries
/// enough to reconstruct a `BackendHandle` for the registry record.
#[derive(Debug, Clone)]
pub enum Handle {
    Session { name: String },
    Process { pid: i32, pgid: i32 },
}

impl Handle {
    pub fn to_backend_handle(&self) -> BackendHandle {
        match self {
            Handle::Session { name } => BackendHandle {
                session_name: Some(name.clone()),
                pid: None,
            },
            Handle::Process { pid, .. } => BackendHandle {
                session_name: None,
                pid: Some(*pid),
            },
        }
    }

    pub fn from_backend_handle(handle: &BackendHandle) -> Option<Handle> {
        if let Some(name) = &handle.session_name {
            Some(Handle::Session { name: name.clone() })
        } else {
            handle.pid.map(|pid| Handle::Process { pid, pgid: pid })
        }
    }
}

pub enum KillResult {
    AlreadyDead,
    Terminated,
    ForceKilled,
}

/// The capability interface all higher-level code is written against
/// (spec §9 "Dual backends via capability interface").
#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// Spawns the agent CLI with `argv`/`env` in `cwd`, directing its
    /// stdout/stderr into `log_path` (the raw `stream` log).
    async fn spawn(
        &self,
        cwd: &Path,
        argv: &[String],
        env: &HashMap<String, String>,
        log_path: &Path,
    ) -> Result<Handle>;

    async fn alive(&self, handle: &Handle) -> bool;

    async fn kill(&self, handle: &Handle, reason: &str) -> Result<KillResult>;

    /// Fallback last-output capture used by the Output Reader when the
    /// `stream` log is missing (§4.H).
    async fn last_output(&self, handle: &Handle) -> Option<String>;
}

/// Minimum free disk space required on the workspace filesystem before a
/// spawn is attempted (§4.D).
pub const MIN_FREE_DISK_BYTES: u64 = 100 * 1024 * 1024;

/// Pre-flight checks both backends must run before spawning: free disk
/// space and a write probe (create + remove a temp file).
pub fn preflight_checks(cwd: &Path) -> Result<()> {
    let available = available_disk_bytes(cwd)?;
    if available < MIN_FREE_DISK_BYTES {
        return Err(crate::error::SpiralError::InsufficientDisk {
            path: cwd.display().to_string(),
            available_bytes: available,
            required_bytes: MIN_FREE_DISK_BYTES,
        });
    }

    let probe_path = cwd.join(format!(".spiral_write_probe_{}", std::process::id()));
    std::fs::write(&probe_path, b"probe").map_err(|e| {
        crate::error::SpiralError::WorkspaceUnwritable {
            path: cwd.display().to_string(),
            reason: e.to_string(),
        }
    })?;
    let _ = std::fs::remove_file(&probe_path);
    Ok(())
}

fn available_disk_bytes(path: &Path) -> Result<u64> {
    // `sysinfo`'s Disks API only enumerates mount points, so we resolve the
    // mount that contains `path` by taking the longest matching prefix.
    use sysinfo::Disks;
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(&Path, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let is_better = match best {
                Some((current, _)) => mount.as_os_str().len() > current.as_os_str().len(),
                None => true,
            };
            if is_better {
                best = Some((mount, disk.available_space()));
            }
        }
    }
    Ok(best.map(|(_, avail)| avail).unwrap_or(u64::MAX))
}

/// Selects a backend from the `AGENT_BACKEND` configuration value.
pub fn backend_from_config(kind: &str) -> Result<Box<dyn ProcessHost>> {
    match kind {
        "session" => Ok(Box::new(session::SessionBackend::new())),
        "process" => Ok(Box::new(direct::DirectProcessBackend::new())),
        other => Err(crate::error::SpiralError::MissingBackend(other.to_string())),
    }
}

//! Status State Machine + Validator (§4.G): active/terminal transitions,
//! the four-layer completion validator invocation, post-terminal cleanup,
//! and the drift-reconciliation sweep used by `get_task_status` and the
//! liveness daemon.

use crate::constants::{
    CLEANUP_STABILITY_WAIT, COORDINATION_RECENT_FINDINGS, COORDINATION_RECENT_PROGRESS,
};
use crate::eventlog::{self, StreamKind};
use crate::error::Result;
use crate::models::{
    Agent, AgentStatusKind, CleanupResult, CoordinationSnapshot, FindingEntry, FindingType,
    ProgressEntry, Severity, TaskRecord,
};
use crate::process_host::{Handle, KillResult, ProcessHost};
use crate::registry::global::GlobalRegistryStore;
use crate::registry::TaskRegistryStore;
use crate::validator::{self, ValidationInput};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct StatusController {
    process_host: Arc<dyn ProcessHost>,
}

impl StatusController {
    pub fn new(process_host: Arc<dyn ProcessHost>) -> Self {
        Self { process_host }
    }

    /// Self-report ingestion (`update_progress`, §4.G). Appends to the
    /// progress log unconditionally (so progress is never lost even if
    /// the subsequent registry mutation hits lock contention), then
    /// performs the atomic registry update and, on an Active→Terminal
    /// transition, the post-terminal cleanup sequence.
    pub async fn update_progress(
        &self,
        registry: &TaskRegistryStore,
        global: &GlobalRegistryStore,
        workspace: &Path,
        agent_id: &str,
        status: AgentStatusKind,
        message: String,
        progress: u8,
    ) -> Result<CoordinationSnapshot> {
        let entry = ProgressEntry {
            timestamp: chrono::Utc::now(),
            agent_id: agent_id.to_string(),
            status,
            message: message.clone(),
            progress,
        };
        eventlog::append_line(
            &eventlog::log_path(workspace, agent_id, StreamKind::Progress),
            &entry,
        )?;

        let transition = registry.with_registry(|doc| {
            let Some(agent) = doc.find_agent_mut(agent_id) else {
                return Err(crate::error::SpiralError::AgentNotFound {
                    task_id: doc.task_id.clone(),
                    agent_id: agent_id.to_string(),
                });
            };

            if agent.is_terminal() {
                // Terminal→* is forbidden; a second terminal report is a
                // documented no-op.
                return Ok(None);
            }

            let previous_status = agent.status;
            agent.status = status;
            agent.progress = progress;
            agent.message = message.clone();
            agent.updated_at = chrono::Utc::now();

            if previous_status.is_active() && status.is_terminal() {
                agent.terminal_at = Some(agent.updated_at);
                let task_id = doc.task_id.clone();
                let agent = doc.find_agent_mut(agent_id).unwrap();
                let verdict = run_completion_validator(agent, task_id.as_str(), workspace)?;
                let blocked = !verdict.blocking_issues.is_empty();
                let agent = doc.find_agent_mut(agent_id).unwrap();
                agent.completion_verdict = Some(verdict.clone());
                if blocked {
                    agent.status = AgentStatusKind::Failed;
                    agent.message = format!(
                        "{} [normalized to failed: {}]",
                        agent.message,
                        verdict.blocking_issues.join("; ")
                    );
                }
                let result_agent_id = agent.agent_id.clone();
                let result_backend = agent.backend.clone();
                doc.recompute_counters();
                Ok(Some((result_agent_id, result_backend)))
            } else {
                Ok(None)
            }
        })?;

        if let Some((terminal_agent_id, backend)) = transition {
            self.finalize_terminal_agent(registry, global, workspace, &terminal_agent_id, &backend)
                .await;
        }

        let snapshot = registry.read_snapshot()?;
        Ok(build_coordination_snapshot(&snapshot, workspace))
    }

    /// Appends a findings-log entry and returns the coordination snapshot;
    /// does not itself change agent status.
    pub fn report_finding(
        &self,
        registry: &TaskRegistryStore,
        workspace: &Path,
        agent_id: &str,
        finding_type: FindingType,
        severity: Severity,
        message: String,
        data: Option<serde_json::Value>,
    ) -> Result<CoordinationSnapshot> {
        let entry = FindingEntry {
            timestamp: chrono::Utc::now(),
            agent_id: agent_id.to_string(),
            finding_type,
            severity,
            message,
            data,
        };
        eventlog::append_line(
            &eventlog::log_path(workspace, agent_id, StreamKind::Findings),
            &entry,
        )?;

        let snapshot = registry.read_snapshot()?;
        Ok(build_coordination_snapshot(&snapshot, workspace))
    }

    /// `kill_agent`: idempotent caller-driven cancellation (§4.I).
    /// Returns `true` if the agent was already terminal (no-op).
    pub async fn kill_agent(
        &self,
        registry: &TaskRegistryStore,
        global: &GlobalRegistryStore,
        workspace: &Path,
        agent_id: &str,
        reason: &str,
    ) -> Result<bool> {
        let snapshot = registry.read_snapshot()?;
        let Some(agent) = snapshot.find_agent(agent_id) else {
            return Err(crate::error::SpiralError::AgentNotFound {
                task_id: snapshot.task_id.clone(),
                agent_id: agent_id.to_string(),
            });
        };
        if agent.is_terminal() {
            return Ok(true);
        }

        if let Some(handle) = Handle::from_backend_handle(&agent.backend) {
            let _ = self.process_host.kill(&handle, reason).await;
        }

        let backend = agent.backend.clone();
        let transitioned = registry.with_registry(|doc| {
            let Some(agent) = doc.find_agent_mut(agent_id) else {
                return Ok(false);
            };
            if agent.is_terminal() {
                return Ok(false);
            }
            agent.status = AgentStatusKind::Terminated;
            agent.message = format!("killed: {reason}");
            agent.terminal_at = Some(chrono::Utc::now());
            agent.updated_at = agent.terminal_at.unwrap();
            doc.recompute_counters();
            Ok(true)
        })?;

        if transitioned {
            self.finalize_terminal_agent(registry, global, workspace, agent_id, &backend)
                .await;
        }
        Ok(false)
    }

    /// Drift reconciliation on read (§4.G): for each active agent, probe
    /// liveness; dead agents are driven through the same terminal-transition
    /// path with a synthetic completion message.
    pub async fn get_task_status(
        &self,
        registry: &TaskRegistryStore,
        global: &GlobalRegistryStore,
        workspace: &Path,
    ) -> Result<TaskRecord> {
        let snapshot = registry.read_snapshot()?;
        let active_handles: Vec<(String, u8, Handle)> = snapshot
            .agents
            .iter()
            .filter(|a| a.is_active())
            .filter_map(|a| {
                Handle::from_backend_handle(&a.backend)
                    .map(|h| (a.agent_id.clone(), a.progress, h))
            })
            .collect();

        let mut to_complete = Vec::new();
        for (agent_id, progress, handle) in active_handles {
            if !self.process_host.alive(&handle).await {
                to_complete.push((agent_id, progress));
            }
        }

        for (agent_id, progress) in to_complete {
            if let Err(e) = self
                .update_progress(
                    registry,
                    global,
                    workspace,
                    &agent_id,
                    AgentStatusKind::Completed,
                    "agent process is no longer alive (drift reconciliation)".to_string(),
                    progress,
                )
                .await
            {
                warn!(agent_id, error = %e, "drift reconciliation failed for agent");
            }
        }

        registry.read_snapshot()
    }

    async fn finalize_terminal_agent(
        &self,
        registry: &TaskRegistryStore,
        global: &GlobalRegistryStore,
        workspace: &Path,
        agent_id: &str,
        backend: &crate::models::BackendHandle,
    ) {
        let cleanup_result = self.cleanup(workspace, agent_id, backend).await;

        let write_result = registry.with_registry(|doc| {
            if let Some(agent) = doc.find_agent_mut(agent_id) {
                match &cleanup_result {
                    Ok(result) => agent.cleanup_result = Some(result.clone()),
                    Err(e) => agent.auto_cleanup_error = Some(e.to_string()),
                }
            }
            Ok(())
        });
        if let Err(e) = write_result {
            error!(agent_id, error = %e, "failed to persist cleanup result");
        }

        if let Err(e) = crate::registry::global::set_agent_status(
            global,
            agent_id,
            AgentStatusKind::Completed,
        ) {
            warn!(agent_id, error = %e, "failed to update global registry after terminal transition");
        }
    }

    /// Post-terminal cleanup (§4.G point 4). Errors are captured in the
    /// returned `Result` by the caller and MUST NOT propagate further —
    /// `finalize_terminal_agent` stores them on `auto_cleanup_error`.
    async fn cleanup(
        &self,
        workspace: &Path,
        agent_id: &str,
        backend: &crate::models::BackendHandle,
    ) -> Result<CleanupResult> {
        let mut killed = false;
        if let Some(handle) = Handle::from_backend_handle(backend) {
            if self.process_host.alive(&handle).await {
                match self.process_host.kill(&handle, "agent reached terminal status").await {
                    Ok(KillResult::AlreadyDead) => {}
                    Ok(_) => killed = true,
                    Err(e) => warn!(agent_id, error = %e, "cleanup kill failed"),
                }
            }
        }

        // Stability wait: give the agent's last writes time to land before
        // archiving (§4.G: "wait briefly (~200ms) and verify file-size
        // stability").
        let stream_path = eventlog::log_path(workspace, agent_id, StreamKind::Stream);
        let size_before = std::fs::metadata(&stream_path).map(|m| m.len()).ok();
        tokio::time::sleep(CLEANUP_STABILITY_WAIT).await;
        let size_after = std::fs::metadata(&stream_path).map(|m| m.len()).ok();
        if size_before != size_after {
            debug_unstable_log(agent_id);
        }

        let archived = eventlog::archive_agent_logs(workspace, agent_id).is_ok();

        let prompt_path = workspace.join(format!("agent_prompt_{agent_id}.txt"));
        let prompt_removed = if prompt_path.exists() {
            std::fs::remove_file(&prompt_path).is_ok()
        } else {
            true
        };

        let stray_processes = scan_stray_processes(backend);

        info!(agent_id, killed, archived, prompt_removed, "agent cleanup complete");
        Ok(CleanupResult {
            killed,
            archived,
            prompt_removed,
            stray_processes,
        })
    }
}

fn debug_unstable_log(agent_id: &str) {
    tracing::debug!(agent_id, "stream log size changed during stability wait");
}

/// Scans for processes whose parent is the agent's pid, which would have
/// been orphaned by an incomplete process-group kill (§4.G point e).
fn scan_stray_processes(backend: &crate::models::BackendHandle) -> Vec<i32> {
    let Some(pid) = backend.pid else {
        return vec![];
    };
    use sysinfo::{Pid, System};
    let mut system = System::new_all();
    system.refresh_all();
    system
        .processes()
        .iter()
        .filter(|(_, proc)| proc.parent() == Some(Pid::from_u32(pid as u32)))
        .map(|(p, _)| p.as_u32() as i32)
        .collect()
}

fn run_completion_validator(
    agent: &Agent,
    _task_id: &str,
    workspace: &Path,
) -> Result<crate::models::CompletionVerdict> {
    let files_modified = validator::count_modified_files(workspace, agent.started_at);
    let findings = read_agent_findings(workspace, &agent.agent_id)?;
    let progress_history = read_agent_progress_values(workspace, &agent.agent_id)?;

    let input = ValidationInput {
        agent,
        files_modified,
        findings: &findings,
        progress_entries_count: progress_history.len(),
        progress_history: &progress_history,
    };
    Ok(validator::validate(&input))
}

fn read_agent_findings(workspace: &Path, agent_id: &str) -> Result<Vec<FindingEntry>> {
    let path = eventlog::log_path(workspace, agent_id, StreamKind::Findings);
    let (lines, _) = eventlog::read_full(&path)?;
    Ok(lines
        .iter()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

fn read_agent_progress_values(workspace: &Path, agent_id: &str) -> Result<Vec<u8>> {
    let path = eventlog::log_path(workspace, agent_id, StreamKind::Progress);
    let (lines, _) = eventlog::read_full(&path)?;
    Ok(lines
        .iter()
        .filter_map(|l| serde_json::from_str::<ProgressEntry>(l).ok())
        .map(|e| e.progress)
        .collect())
}

/// Builds the minimal coordination snapshot piggy-backed on
/// `update_progress`/`report_finding` responses (§9).
pub fn build_coordination_snapshot(task: &TaskRecord, workspace: &Path) -> CoordinationSnapshot {
    let mut all_progress: Vec<ProgressEntry> = Vec::new();
    let mut all_findings: Vec<FindingEntry> = Vec::new();

    for agent in &task.agents {
        if let Ok((lines, _)) =
            eventlog::read_full(&eventlog::log_path(workspace, &agent.agent_id, StreamKind::Progress))
        {
            all_progress.extend(lines.iter().filter_map(|l| serde_json::from_str(l).ok()));
        }
        if let Ok((lines, _)) =
            eventlog::read_full(&eventlog::log_path(workspace, &agent.agent_id, StreamKind::Findings))
        {
            all_findings.extend(lines.iter().filter_map(|l| serde_json::from_str(l).ok()));
        }
    }

    all_progress.sort_by_key(|e| e.timestamp);
    all_findings.sort_by_key(|e| e.timestamp);

    let recent_progress = tail_n(all_progress, COORDINATION_RECENT_PROGRESS);
    let recent_findings = tail_n(all_findings, COORDINATION_RECENT_FINDINGS);

    CoordinationSnapshot {
        active_count: task.active_count,
        completed_count: task.completed_count,
        total_spawned: task.total_spawned,
        recent_progress,
        recent_findings,
    }
}

fn tail_n<T>(mut v: Vec<T>, n: usize) -> Vec<T> {
    if v.len() > n {
        v.drain(0..v.len() - n);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        BackendHandle, Priority, SpiralLimits, TaskContext, TaskStatus, ORCHESTRATOR_PARENT,
    };
    use crate::process_host::direct::DirectProcessBackend;

    fn registry_with_one_agent(workspace: &Path) -> TaskRegistryStore {
        let store = TaskRegistryStore::new(workspace.join("AGENT_REGISTRY.json"));
        store
            .init_if_absent(|| TaskRecord {
                task_id: "task-1".into(),
                description: "d".into(),
                priority: Priority::Medium,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
                workspace: workspace.display().to_string(),
                status: TaskStatus::Active,
                limits: SpiralLimits::default(),
                total_spawned: 1,
                active_count: 1,
                completed_count: 0,
                agents: vec![Agent {
                    agent_id: "builder-000000-aaaaaa".into(),
                    agent_type: "builder".into(),
                    parent: ORCHESTRATOR_PARENT.into(),
                    depth: 0,
                    status: AgentStatusKind::Running,
                    progress: 0,
                    message: String::new(),
                    prompt: String::new(),
                    started_at: chrono::Utc::now() - chrono::Duration::seconds(30),
                    updated_at: chrono::Utc::now(),
                    terminal_at: None,
                    backend: BackendHandle {
                        session_name: None,
                        pid: None,
                    },
                    completion_verdict: None,
                    cleanup_result: None,
                    auto_cleanup_error: None,
                }],
                context: TaskContext::default(),
                client_cwd: None,
            })
            .unwrap();
        store
    }

    #[tokio::test]
    async fn update_progress_active_to_active_does_not_invoke_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_one_agent(dir.path());
        let global = crate::registry::global::open(dir.path()).unwrap();
        let controller = StatusController::new(Arc::new(DirectProcessBackend::new()));

        controller
            .update_progress(
                &registry,
                &global,
                dir.path(),
                "builder-000000-aaaaaa",
                AgentStatusKind::Working,
                "halfway there, files created".into(),
                50,
            )
            .await
            .unwrap();

        let snapshot = registry.read_snapshot().unwrap();
        let agent = snapshot.find_agent("builder-000000-aaaaaa").unwrap();
        assert_eq!(agent.status, AgentStatusKind::Working);
        assert!(agent.cleanup_result.is_none());
    }

    #[tokio::test]
    async fn terminal_report_triggers_cleanup_and_archival() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_one_agent(dir.path());
        let global = crate::registry::global::open(dir.path()).unwrap();
        let controller = StatusController::new(Arc::new(DirectProcessBackend::new()));

        // Give the validator workspace evidence so it isn't normalized to
        // failed by the type-specific/workspace-evidence layers.
        std::fs::write(dir.path().join("output.txt"), b"done").unwrap();

        controller
            .update_progress(
                &registry,
                &global,
                dir.path(),
                "builder-000000-aaaaaa",
                AgentStatusKind::Completed,
                "Created output.txt and verified the result".into(),
                100,
            )
            .await
            .unwrap();

        let snapshot = registry.read_snapshot().unwrap();
        let agent = snapshot.find_agent("builder-000000-aaaaaa").unwrap();
        assert!(agent.is_terminal());
        assert!(agent.cleanup_result.is_some());
        assert_eq!(snapshot.active_count, 0);
        assert_eq!(snapshot.completed_count, 1);
    }

    #[tokio::test]
    async fn second_terminal_report_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_one_agent(dir.path());
        let global = crate::registry::global::open(dir.path()).unwrap();
        let controller = StatusController::new(Arc::new(DirectProcessBackend::new()));
        std::fs::write(dir.path().join("output.txt"), b"done").unwrap();

        for _ in 0..2 {
            controller
                .update_progress(
                    &registry,
                    &global,
                    dir.path(),
                    "builder-000000-aaaaaa",
                    AgentStatusKind::Completed,
                    "Created output.txt and verified the result".into(),
                    100,
                )
                .await
                .unwrap();
        }

        let snapshot = registry.read_snapshot().unwrap();
        assert_eq!(snapshot.completed_count, 1);
        assert_eq!(snapshot.total_spawned, 1);
    }

    #[tokio::test]
    async fn kill_agent_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_one_agent(dir.path());
        let global = crate::registry::global::open(dir.path()).unwrap();
        let controller = StatusController::new(Arc::new(DirectProcessBackend::new()));

        let first = controller
            .kill_agent(&registry, &global, dir.path(), "builder-000000-aaaaaa", "user requested")
            .await
            .unwrap();
        assert!(!first);

        let second = controller
            .kill_agent(&registry, &global, dir.path(), "builder-000000-aaaaaa", "user requested")
            .await
            .unwrap();
        assert!(second);
    }

    #[test]
    fn coordination_snapshot_caps_recent_entries() {
        let dir = tempfile::tempdir().unwrap();
        let agent_id = "a-000000-aaaaaa";
        for i in 0..10 {
            eventlog::append_line(
                &eventlog::log_path(dir.path(), agent_id, StreamKind::Progress),
                &ProgressEntry {
                    timestamp: chrono::Utc::now() + chrono::Duration::milliseconds(i),
                    agent_id: agent_id.into(),
                    status: AgentStatusKind::Working,
                    message: format!("step {i}"),
                    progress: i as u8,
                },
            )
            .unwrap();
        }

        let task = TaskRecord {
            task_id: "task-1".into(),
            description: "d".into(),
            priority: Priority::Medium,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            workspace: dir.path().display().to_string(),
            status: TaskStatus::Active,
            limits: SpiralLimits::default(),
            total_spawned: 1,
            active_count: 1,
            completed_count: 0,
            agents: vec![Agent {
                agent_id: agent_id.into(),
                agent_type: "builder".into(),
                parent: ORCHESTRATOR_PARENT.into(),
                depth: 0,
                status: AgentStatusKind::Working,
                progress: 9,
                message: String::new(),
                prompt: String::new(),
                started_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
                terminal_at: None,
                backend: BackendHandle::default(),
                completion_verdict: None,
                cleanup_result: None,
                auto_cleanup_error: None,
            }],
            context: TaskContext::default(),
            client_cwd: None,
        };

        let snapshot = build_coordination_snapshot(&task, dir.path());
        assert_eq!(snapshot.recent_progress.len(), 5);
        assert_eq!(snapshot.recent_progress.last().unwrap().progress, 9);
    }
}

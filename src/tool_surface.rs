//! Tool Surface (§4.I): the small fixed set of externally callable
//! operations built on components A-H. This is what a transport layer
//! (RPC marshaling, request framing) would sit in front of; none of that
//! is this crate's concern.

use crate::config::Config;
use crate::constants::{
    LIVENESS_INACTIVITY_TIMEOUT, LIVENESS_SWEEP_INTERVAL, REGISTRY_SWEEP_TIMEOUT,
};
use crate::error::Result;
use crate::lifecycle::{DeployRequest, LifecycleController};
use crate::models::{
    AgentStatusKind, CoordinationSnapshot, FindingType, Priority, Severity, SpiralLimits,
    TaskContext, TaskRecord, TaskStatus,
};
use crate::output_reader::{self, OutputRequest, OutputResponse};
use crate::process_host::ProcessHost;
use crate::registry::global::GlobalRegistryStore;
use crate::registry::TaskRegistryStore;
use crate::status::StatusController;
use crate::validation::{validate_conversation_history, TaskContentValidator};
use crate::workspace::{WorkspaceLocator, WorkspaceLocatorConfig};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// `get_task_status`'s response: the reconciled task plus the current
/// Anti-Spiral Gate headroom, so a caller can see why a subsequent
/// `deploy_agent` might be rejected before it tries.
#[derive(Debug, Clone, Serialize)]
pub struct SpiralChecks {
    pub active_count: u32,
    pub max_concurrent: u32,
    pub total_spawned: u32,
    pub max_agents: u32,
    pub max_depth: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub task: TaskRecord,
    pub spiral_checks: SpiralChecks,
}

/// Holds one task's open registry handles so repeat calls against the same
/// task don't re-locate its workspace from scratch.
struct TaskHandles {
    workspace: PathBuf,
    registry: TaskRegistryStore,
    global: GlobalRegistryStore,
}

/// The orchestrator core: wires the Workspace Locator, Lifecycle
/// Controller, Status Controller and Output Reader into the fixed surface
/// from §4.I, plus the optional in-process liveness daemon.
pub struct OrchestratorCore {
    locator: WorkspaceLocator,
    lifecycle: LifecycleController,
    status: StatusController,
    process_host: Arc<dyn ProcessHost>,
    validator: TaskContentValidator,
    config: Config,
}

impl OrchestratorCore {
    pub fn new(config: Config, process_host: Arc<dyn ProcessHost>) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let default_base =
            WorkspaceLocatorConfig::resolve_placeholders(&config.workspace_base, &cwd);
        let locator = WorkspaceLocator::new(WorkspaceLocatorConfig::new(default_base));
        let validator = TaskContentValidator::new()?;
        Ok(Self {
            locator,
            lifecycle: LifecycleController::new(process_host.clone()),
            status: StatusController::new(process_host.clone()),
            process_host,
            validator,
            config,
        })
    }

    /// Opens (creating the workspace if needed) the handles for an
    /// existing task.
    fn open_existing(&self, task_id: &str) -> Result<TaskHandles> {
        let workspace = self.locator.locate(task_id)?;
        let registry = TaskRegistryStore::new(workspace.join("AGENT_REGISTRY.json"));
        let global = self.locator.default_global_registry()?;
        Ok(TaskHandles {
            workspace,
            registry,
            global,
        })
    }

    /// `create_task(description, priority?, client_cwd?, context?)` (§4.I).
    /// Validates and sanitizes `context`, creates the workspace, and
    /// initializes both the per-task and global registries.
    pub fn create_task(
        &self,
        description: &str,
        priority: Priority,
        client_cwd: Option<&str>,
        context: TaskContext,
    ) -> Result<TaskRecord> {
        self.validator.validate_task_content(description)?;
        let context = self.sanitize_context(context)?;

        let task_id = new_task_id();
        let workspace = self.locator.workspace_for_new_task(&task_id);
        std::fs::create_dir_all(&workspace)?;
        crate::process_host::preflight_checks(&workspace)?;

        let registry = TaskRegistryStore::new(workspace.join("AGENT_REGISTRY.json"));
        let record = TaskRecord {
            task_id: task_id.clone(),
            description: description.to_string(),
            priority,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            workspace: workspace.display().to_string(),
            status: TaskStatus::Initialized,
            limits: SpiralLimits {
                max_concurrent: self.config.max_concurrent,
                max_agents: self.config.max_agents,
                max_depth: self.config.max_depth,
            },
            total_spawned: 0,
            active_count: 0,
            completed_count: 0,
            agents: vec![],
            context,
            client_cwd: client_cwd.map(|s| s.to_string()),
        };
        registry.init_if_absent(|| record.clone())?;

        let default_global = self.locator.default_global_registry()?;
        crate::registry::global::record_task(
            &default_global,
            &task_id,
            description,
            &workspace.display().to_string(),
            &self.config.workspace_base,
            client_cwd,
        )?;

        // Tasks created with an explicit client working directory are also
        // recorded in a registry local to that directory, so a future
        // lookup from there resolves the task even if the server's default
        // base differs (§3 "Global Registry").
        if let Some(cwd) = client_cwd {
            let local_base = PathBuf::from(cwd);
            if let Ok(local_global) = crate::registry::global::open(&local_base) {
                if let Err(e) = crate::registry::global::record_task(
                    &local_global,
                    &task_id,
                    description,
                    &workspace.display().to_string(),
                    &self.config.workspace_base,
                    Some(cwd),
                ) {
                    warn!(task_id = %task_id, error = %e, "failed to record task in client-local global registry");
                }
            }
        }

        info!(task_id = %task_id, "task created");
        Ok(record)
    }

    fn sanitize_context(&self, mut context: TaskContext) -> Result<TaskContext> {
        if let Some(history) = context.conversation_history.take() {
            let validated = validate_conversation_history(history)?;
            for warning in &validated.warnings {
                warn!(warning, "conversation history validation warning");
            }
            context.conversation_history = Some(validated.messages);
            context.truncation_summary = validated.truncation_summary;
        }
        for value in context
            .deliverables
            .iter()
            .chain(context.success_criteria.iter())
            .chain(context.constraints.iter())
            .chain(context.relevant_files.iter())
            .flatten()
        {
            self.validator.validate_context_value(value)?;
        }
        for key in context.extra.keys() {
            self.validator.validate_context_key(key)?;
        }
        Ok(context)
    }

    /// `deploy_agent(task_id, agent_type, prompt, parent?)` (§4.I / §4.F).
    pub async fn deploy_agent(
        &self,
        task_id: &str,
        agent_type: &str,
        prompt: &str,
        parent: Option<&str>,
    ) -> Result<crate::models::Agent> {
        self.validator.validate_task_content(prompt)?;
        let handles = self.open_existing(task_id)?;
        crate::process_host::preflight_checks(&handles.workspace)?;

        self.lifecycle
            .deploy_agent(
                &handles.registry,
                &handles.global,
                &handles.workspace,
                &self.config.workspace_base,
                DeployRequest {
                    agent_type,
                    prompt,
                    parent,
                    argv: self.agent_argv(agent_type),
                    env: self.agent_env(),
                },
            )
            .await
    }

    /// `spawn_child(task_id, parent_agent_id, child_agent_type, child_prompt)`:
    /// pure delegation to `deploy_agent` with `parent` set (§4.I).
    pub async fn spawn_child(
        &self,
        task_id: &str,
        parent_agent_id: &str,
        child_agent_type: &str,
        child_prompt: &str,
    ) -> Result<crate::models::Agent> {
        self.deploy_agent(task_id, child_agent_type, child_prompt, Some(parent_agent_id))
            .await
    }

    /// The argv an agent's configured backend invokes. Left generic: the
    /// concrete CLI binary and its flags are an external collaborator per
    /// §1's non-goals, so this just names the placeholder entry point the
    /// backend is pointed at and leaves real wiring to deployment config.
    fn agent_argv(&self, agent_type: &str) -> Vec<String> {
        vec!["agent-cli".to_string(), "--type".to_string(), agent_type.to_string()]
    }

    fn agent_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if self.config.enable_thinking_capture {
            env.insert("SPIRAL_CAPTURE_THINKING".to_string(), "1".to_string());
        }
        env
    }

    /// `get_task_status(task_id)` (§4.I): reconciled snapshot plus the
    /// Anti-Spiral Gate headroom.
    pub async fn get_task_status(&self, task_id: &str) -> Result<TaskStatusView> {
        let handles = self.open_existing(task_id)?;
        let task = self
            .status
            .get_task_status(&handles.registry, &handles.global, &handles.workspace)
            .await?;
        let spiral_checks = SpiralChecks {
            active_count: task.active_count,
            max_concurrent: task.limits.max_concurrent,
            total_spawned: task.total_spawned,
            max_agents: task.limits.max_agents,
            max_depth: task.limits.max_depth,
        };
        Ok(TaskStatusView { task, spiral_checks })
    }

    /// `get_agent_output(task_id, agent_id, ...)` (§4.H via §4.I).
    pub async fn get_agent_output(
        &self,
        task_id: &str,
        request: OutputRequest<'_>,
    ) -> Result<OutputResponse> {
        let handles = self.open_existing(task_id)?;
        let snapshot = handles.registry.read_snapshot()?;
        let handle = snapshot
            .find_agent(request.agent_id)
            .and_then(|a| crate::process_host::Handle::from_backend_handle(&a.backend));

        output_reader::read_agent_output(
            self.process_host.as_ref(),
            &handles.workspace,
            handle.as_ref(),
            request,
        )
        .await
    }

    /// `kill_agent(task_id, agent_id, reason)` (§4.I).
    pub async fn kill_agent(&self, task_id: &str, agent_id: &str, reason: &str) -> Result<bool> {
        let handles = self.open_existing(task_id)?;
        self.status
            .kill_agent(&handles.registry, &handles.global, &handles.workspace, agent_id, reason)
            .await
    }

    /// `update_progress(task_id, agent_id, status, message, progress=0)` (§4.I / §4.G).
    pub async fn update_progress(
        &self,
        task_id: &str,
        agent_id: &str,
        status: AgentStatusKind,
        message: String,
        progress: u8,
    ) -> Result<CoordinationSnapshot> {
        let handles = self.open_existing(task_id)?;
        self.status
            .update_progress(
                &handles.registry,
                &handles.global,
                &handles.workspace,
                agent_id,
                status,
                message,
                progress,
            )
            .await
    }

    /// `report_finding(task_id, agent_id, finding_type, severity, message, data?)` (§4.I).
    pub fn report_finding(
        &self,
        task_id: &str,
        agent_id: &str,
        finding_type: FindingType,
        severity: Severity,
        message: String,
        data: Option<serde_json::Value>,
    ) -> Result<CoordinationSnapshot> {
        let handles = self.open_existing(task_id)?;
        self.status
            .report_finding(&handles.registry, &handles.workspace, agent_id, finding_type, severity, message, data)
    }

    /// The optional liveness daemon (§5, Open Questions: "in-process
    /// tokio::spawn loop"). Sweeps every agent across every known task at
    /// `LIVENESS_SWEEP_INTERVAL` and force-terminates any active agent that
    /// has not self-reported in `LIVENESS_INACTIVITY_TIMEOUT`.
    pub async fn run_liveness_daemon(self: Arc<Self>) {
        let mut interval = tokio::time::interval(LIVENESS_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match tokio::time::timeout(REGISTRY_SWEEP_TIMEOUT, self.sweep_inactive_agents()).await
            {
                Ok(Err(e)) => warn!(error = %e, "liveness sweep failed"),
                Err(_) => warn!("liveness sweep exceeded its wall-clock budget, abandoning this round"),
                Ok(Ok(())) => {}
            }
        }
    }

    async fn sweep_inactive_agents(&self) -> Result<()> {
        let global = self.locator.default_global_registry()?;
        let doc = global.read_snapshot()?;
        let now = chrono::Utc::now();

        let mut by_task: HashMap<&str, Vec<&str>> = HashMap::new();
        for (agent_id, entry) in &doc.agents {
            if entry.status.is_active() {
                by_task.entry(entry.task_id.as_str()).or_default().push(agent_id.as_str());
            }
        }

        for (task_id, agent_ids) in by_task {
            let handles = match self.open_existing(task_id) {
                Ok(h) => h,
                Err(e) => {
                    warn!(task_id, error = %e, "liveness sweep could not resolve task workspace");
                    continue;
                }
            };
            let snapshot = handles.registry.read_snapshot()?;
            for agent_id in agent_ids {
                let Some(agent) = snapshot.find_agent(agent_id) else {
                    continue;
                };
                let idle = now - agent.updated_at;
                if idle.to_std().unwrap_or_default() > LIVENESS_INACTIVITY_TIMEOUT {
                    info!(task_id, agent_id, "liveness sweep force-terminating inactive agent");
                    if let Err(e) = self
                        .status
                        .kill_agent(
                            &handles.registry,
                            &handles.global,
                            &handles.workspace,
                            agent_id,
                            "liveness sweep: inactivity timeout exceeded",
                        )
                        .await
                    {
                        warn!(task_id, agent_id, error = %e, "liveness sweep kill failed");
                    }
                }
            }
        }
        Ok(())
    }
}

fn new_task_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    format!("task-{millis}-{}", hex_suffix(6))
}

fn hex_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_host::direct::DirectProcessBackend;
    use serial_test::serial;

    fn core(base: &std::path::Path) -> OrchestratorCore {
        let config = Config {
            workspace_base: base.display().to_string(),
            max_agents: 10,
            max_concurrent: 5,
            max_depth: 3,
            agent_backend: crate::config::AgentBackendKind::Process,
            enable_thinking_capture: false,
        };
        OrchestratorCore::new(config, Arc::new(DirectProcessBackend::new())).unwrap()
    }

    #[test]
    #[serial]
    fn create_task_rejects_dangerous_description() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(dir.path());
        let result = core.create_task(
            "rm -rf / && echo pwned",
            Priority::Medium,
            None,
            TaskContext::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn create_task_initializes_workspace_and_registries() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(dir.path());
        let task = core
            .create_task("investigate the failing build", Priority::High, None, TaskContext::default())
            .unwrap();

        assert_eq!(task.status, TaskStatus::Initialized);
        assert!(PathBuf::from(&task.workspace).join("AGENT_REGISTRY.json").exists());

        let global = crate::registry::global::open(dir.path()).unwrap();
        let snapshot = global.read_snapshot().unwrap();
        assert!(snapshot.tasks.contains_key(&task.task_id));
    }

    #[tokio::test]
    #[serial]
    async fn deploy_and_status_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(dir.path());
        let task = core
            .create_task("demo task", Priority::Medium, None, TaskContext::default())
            .unwrap();

        let agent = core
            .deploy_agent(&task.task_id, "investigator", "find the bug", None)
            .await
            .unwrap();
        assert_eq!(agent.status, AgentStatusKind::Running);

        let view = core.get_task_status(&task.task_id).await.unwrap();
        assert_eq!(view.spiral_checks.active_count, 1);
        assert_eq!(view.task.agents.len(), 1);

        let killed = core.kill_agent(&task.task_id, &agent.agent_id, "test teardown").await.unwrap();
        assert!(!killed);
    }

    #[tokio::test]
    #[serial]
    async fn update_progress_and_report_finding_return_coordination_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(dir.path());
        let task = core
            .create_task("demo task", Priority::Medium, None, TaskContext::default())
            .unwrap();
        let agent = core
            .deploy_agent(&task.task_id, "investigator", "find the bug", None)
            .await
            .unwrap();

        let snapshot = core
            .update_progress(&task.task_id, &agent.agent_id, AgentStatusKind::Working, "halfway".into(), 50)
            .await
            .unwrap();
        assert_eq!(snapshot.active_count, 1);

        let snapshot = core
            .report_finding(
                &task.task_id,
                &agent.agent_id,
                FindingType::Insight,
                Severity::Low,
                "found something".into(),
                None,
            )
            .unwrap();
        assert_eq!(snapshot.recent_findings.len(), 1);

        let _ = core.kill_agent(&task.task_id, &agent.agent_id, "test teardown").await;
    }

    #[tokio::test]
    #[serial]
    async fn spawn_child_inherits_depth_from_parent() {
        let dir = tempfile::tempdir().unwrap();
        let core = core(dir.path());
        let task = core
            .create_task("demo task", Priority::Medium, None, TaskContext::default())
            .unwrap();
        let parent = core
            .deploy_agent(&task.task_id, "orchestrator-agent", "coordinate", None)
            .await
            .unwrap();

        let child = core
            .spawn_child(&task.task_id, &parent.agent_id, "fixer", "apply the fix")
            .await
            .unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent, parent.agent_id);

        let _ = core.kill_agent(&task.task_id, &parent.agent_id, "test teardown").await;
        let _ = core.kill_agent(&task.task_id, &child.agent_id, "test teardown").await;
    }
}

//! Agent Lifecycle Controller (§4.F): turns a gate-approved deployment
//! request into a running agent record, with rollback on any failure
//! after the prompt file or process handle has been created.

use crate::error::Result;
use crate::models::{Agent, AgentStatusKind, ORCHESTRATOR_PARENT};
use crate::process_host::{Handle, ProcessHost};
use crate::registry::global::GlobalRegistryStore;
use crate::registry::TaskRegistryStore;
use crate::spiral_gate;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub struct LifecycleController {
    process_host: Arc<dyn ProcessHost>,
}

pub struct DeployRequest<'a> {
    pub agent_type: &'a str,
    pub prompt: &'a str,
    pub parent: Option<&'a str>,
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
}

impl LifecycleController {
    pub fn new(process_host: Arc<dyn ProcessHost>) -> Self {
        Self { process_host }
    }

    /// Runs the full deployment sequence from §4.F. `workspace` must
    /// already exist (the caller resolved it via the Workspace Locator).
    pub async fn deploy_agent(
        &self,
        registry: &TaskRegistryStore,
        global: &GlobalRegistryStore,
        workspace: &Path,
        workspace_base: &str,
        request: DeployRequest<'_>,
    ) -> Result<Agent> {
        let snapshot = registry.read_snapshot()?;
        let parent_depth = match request.parent {
            Some(parent_id) => snapshot.find_agent(parent_id).map(|a| a.depth),
            None => None,
        };
        // Fast-fail against a plain snapshot before paying for a process
        // spawn. This snapshot can go stale under concurrent deployers, so
        // it rejects obvious violations early but is not itself the gate:
        // the authoritative check below runs inside the locked append.
        spiral_gate::check(&snapshot, request.agent_type, parent_depth)?;

        let agent_id = self.generate_unique_agent_id(&snapshot, request.agent_type);

        let prompt_path = workspace.join(format!("agent_prompt_{agent_id}.txt"));
        if let Err(e) = std::fs::write(&prompt_path, request.prompt) {
            return Err(crate::error::SpiralError::SpawnFailed {
                reason: format!("failed to write prompt file: {e}"),
            });
        }

        let log_path = crate::eventlog::log_path(
            workspace,
            &agent_id,
            crate::eventlog::StreamKind::Stream,
        );
        let handle = match self
            .process_host
            .spawn(workspace, &request.argv, &request.env, &log_path)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let _ = std::fs::remove_file(&prompt_path);
                return Err(e);
            }
        };

        let depth = parent_depth.map(|d| d + 1).unwrap_or(0);
        let now = chrono::Utc::now();
        let agent = Agent {
            agent_id: agent_id.clone(),
            agent_type: request.agent_type.to_string(),
            parent: request.parent.unwrap_or(ORCHESTRATOR_PARENT).to_string(),
            depth,
            status: AgentStatusKind::Running,
            progress: 0,
            message: String::new(),
            prompt: request.prompt.to_string(),
            started_at: now,
            updated_at: now,
            terminal_at: None,
            backend: handle.to_backend_handle(),
            completion_verdict: None,
            cleanup_result: None,
            auto_cleanup_error: None,
        };

        // Re-run the gate against the document this closure actually loads
        // under the exclusive lock, so a concurrent deployer that slipped
        // in between the snapshot above and this section is reflected
        // before the slot is reserved. Check and append happen in the same
        // locked read-modify-write; nothing else can observe or mutate the
        // document in between.
        let append_result = registry.with_registry(|doc| {
            let parent_depth = match request.parent {
                Some(parent_id) => doc.find_agent(parent_id).map(|a| a.depth),
                None => None,
            };
            spiral_gate::check(doc, request.agent_type, parent_depth)?;
            doc.agents.push(agent.clone());
            doc.recompute_counters();
            Ok(())
        });

        if let Err(e) = append_result {
            warn!(
                agent_id = %agent_id,
                error = %e,
                "registry append rejected or failed; rolling back spawned process and prompt"
            );
            self.rollback(&handle, &prompt_path).await;
            return Err(e);
        }

        let task_id = doc_task_id(registry)?;
        if let Err(e) = crate::registry::global::record_task(
            global,
            &task_id,
            &snapshot.description,
            &workspace.display().to_string(),
            workspace_base,
            None,
        ) {
            warn!(task_id = %task_id, error = %e, "failed to record task in global registry");
        }
        if let Err(e) = crate::registry::global::record_agent(
            global,
            &agent_id,
            &task_id,
            request.agent_type,
            AgentStatusKind::Running,
        ) {
            warn!(agent_id = %agent_id, error = %e, "failed to update global registry after deployment");
        }

        Ok(agent)
    }

    async fn rollback(&self, handle: &Handle, prompt_path: &Path) {
        if let Err(e) = self.process_host.kill(handle, "lifecycle rollback").await {
            warn!(error = %e, "rollback kill failed, process may be orphaned");
        }
        if prompt_path.exists() {
            let _ = std::fs::remove_file(prompt_path);
        }
    }

    fn generate_unique_agent_id(
        &self,
        snapshot: &crate::models::TaskRecord,
        agent_type: &str,
    ) -> String {
        const MAX_ATTEMPTS: usize = 5;
        for _ in 0..MAX_ATTEMPTS {
            let candidate = new_agent_id(agent_type);
            if snapshot.find_agent(&candidate).is_none() {
                return candidate;
            }
        }
        // Exhausted retries: fall back to a wider random suffix, which
        // collides with vanishing probability.
        format!("{agent_type}-{}-{}", time_suffix(), hex_suffix(12))
    }
}

fn doc_task_id(registry: &TaskRegistryStore) -> Result<String> {
    Ok(registry.read_snapshot()?.task_id)
}

fn new_agent_id(agent_type: &str) -> String {
    format!("{agent_type}-{}-{}", time_suffix(), hex_suffix(6))
}

fn time_suffix() -> String {
    let now = chrono::Utc::now();
    now.format("%H%M%S").to_string()
}

fn hex_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

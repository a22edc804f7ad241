//! The global registry: a sibling index listing all known task ids and
//! agent ids with minimal metadata, so a task can be found from a working
//! directory other than the one it was created in (§3 "Global Registry").

use super::LockedRegistryStore;
use crate::error::Result;
use crate::models::{AgentStatusKind, GlobalAgentEntry, GlobalTaskEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalRegistryDocument {
    #[serde(default)]
    pub tasks: HashMap<String, GlobalTaskEntry>,
    #[serde(default)]
    pub agents: HashMap<String, GlobalAgentEntry>,
}

impl GlobalRegistryDocument {
    /// Recomputed counters: active agents across every task. Exists for
    /// the reconciliation sweep described in §3's invariants.
    pub fn active_agent_count(&self) -> usize {
        self.agents
            .values()
            .filter(|a| a.status.is_active())
            .count()
    }
}

pub type GlobalRegistryStore = LockedRegistryStore<GlobalRegistryDocument>;

/// Path to the global registry document rooted at `workspace_base`
/// (`<workspace_base>/registry/GLOBAL_REGISTRY.json`, per §6's layout).
pub fn global_registry_path(workspace_base: &Path) -> PathBuf {
    workspace_base.join("registry").join("GLOBAL_REGISTRY.json")
}

pub fn open(workspace_base: &Path) -> Result<GlobalRegistryStore> {
    let store = GlobalRegistryStore::new(global_registry_path(workspace_base));
    store.init_if_absent(GlobalRegistryDocument::default)?;
    Ok(store)
}

/// Records a task in this registry with a minimal cross-project reference
/// record (§4.F point 7).
pub fn record_task(
    store: &GlobalRegistryStore,
    task_id: &str,
    description: &str,
    workspace: &str,
    workspace_base: &str,
    client_cwd: Option<&str>,
) -> Result<()> {
    store.with_registry(|doc| {
        doc.tasks.insert(
            task_id.to_string(),
            GlobalTaskEntry {
                description: description.to_string(),
                workspace: workspace.to_string(),
                workspace_base: workspace_base.to_string(),
                status: crate::models::TaskStatus::Initialized,
                client_cwd: client_cwd.map(|s| s.to_string()),
                cross_project_reference: Some(true),
            },
        );
        Ok(())
    })
}

pub fn record_agent(
    store: &GlobalRegistryStore,
    agent_id: &str,
    task_id: &str,
    agent_type: &str,
    status: AgentStatusKind,
) -> Result<()> {
    store.with_registry(|doc| {
        doc.agents.insert(
            agent_id.to_string(),
            GlobalAgentEntry {
                task_id: task_id.to_string(),
                agent_type: agent_type.to_string(),
                status,
            },
        );
        Ok(())
    })
}

pub fn set_agent_status(
    store: &GlobalRegistryStore,
    agent_id: &str,
    status: AgentStatusKind,
) -> Result<()> {
    store.with_registry(|doc| {
        if let Some(entry) = doc.agents.get_mut(agent_id) {
            entry.status = status;
        }
        Ok(())
    })
}

//! Core data model: tasks, agents, their status lattice, and the two
//! append-only log entry shapes (progress, findings).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Active agent statuses: normal in-flight states.
pub const ACTIVE_STATUSES: [AgentStatusKind; 3] = [
    AgentStatusKind::Running,
    AgentStatusKind::Working,
    AgentStatusKind::Blocked,
];

/// Terminal agent statuses: no further transitions permitted out of them.
pub const TERMINAL_STATUSES: [AgentStatusKind; 4] = [
    AgentStatusKind::Completed,
    AgentStatusKind::Terminated,
    AgentStatusKind::Error,
    AgentStatusKind::Failed,
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatusKind {
    Running,
    Working,
    Blocked,
    Completed,
    Terminated,
    Error,
    Failed,
}

impl AgentStatusKind {
    pub fn is_active(&self) -> bool {
        ACTIVE_STATUSES.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        TERMINAL_STATUSES.contains(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Initialized,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd, Eq, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// A single conversation-history message supplied as task context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

/// Free-text enrichment a caller may attach to a task at creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliverables: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevant_files: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_history: Option<Vec<ConversationMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation_summary: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Configurable spiral caps, overridable per task and per deployment call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpiralLimits {
    pub max_concurrent: u32,
    pub max_agents: u32,
    pub max_depth: u32,
}

impl Default for SpiralLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 20,
            max_agents: 45,
            max_depth: 5,
        }
    }
}

/// The sentinel parent id used for top-level agents deployed directly by
/// the orchestrator (as opposed to `spawn_child`).
pub const ORCHESTRATOR_PARENT: &str = "orchestrator";

/// A process/session backend handle recorded on an agent record. Exactly
/// one of the two fields is populated for any live agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendHandle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
}

/// Result of the post-terminal cleanup sequence, attached to the agent
/// record once it completes (successfully or not).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResult {
    pub killed: bool,
    pub archived: bool,
    pub prompt_removed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stray_processes: Vec<i32>,
}

/// Verdict attached by the Four-Layer Completion Validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionVerdict {
    pub confidence: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub blocking_issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub agent_type: String,
    pub parent: String,
    pub depth: u32,
    pub status: AgentStatusKind,
    pub progress: u8,
    pub message: String,
    pub prompt: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<chrono::DateTime<chrono::Utc>>,
    pub backend: BackendHandle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_verdict: Option<CompletionVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_result: Option<CleanupResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_cleanup_error: Option<String>,
}

impl Agent {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// The authoritative per-task document (§3 "Registry (per task)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub description: String,
    pub priority: Priority,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub workspace: String,
    pub status: TaskStatus,
    pub limits: SpiralLimits,
    pub total_spawned: u32,
    pub active_count: u32,
    pub completed_count: u32,
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub context: TaskContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cwd: Option<String>,
}

impl TaskRecord {
    pub fn find_agent(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    pub fn find_agent_mut(&mut self, agent_id: &str) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.agent_id == agent_id)
    }

    /// Recomputes `active_count`/`completed_count`/`total_spawned` from the
    /// agent list. Used by reconciliation sweeps and tests to assert the
    /// counters never drift.
    pub fn recompute_counters(&mut self) {
        self.total_spawned = self.agents.len() as u32;
        self.active_count = self.agents.iter().filter(|a| a.is_active()).count() as u32;
        self.completed_count = self.agents.iter().filter(|a| a.is_terminal()).count() as u32;
    }

    pub fn invariants_hold(&self) -> bool {
        self.total_spawned as usize == self.agents.len()
            && self.active_count as usize == self.agents.iter().filter(|a| a.is_active()).count()
            && self.completed_count as usize
                == self.agents.iter().filter(|a| a.is_terminal()).count()
    }
}

/// One line in an agent's `progress` event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub agent_id: String,
    pub status: AgentStatusKind,
    pub message: String,
    pub progress: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FindingType {
    Issue,
    Solution,
    Insight,
    Recommendation,
    Blocker,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One line in an agent's `findings` event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub agent_id: String,
    pub finding_type: FindingType,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Minimal coordination snapshot piggy-backed on `update_progress` and
/// `report_finding` responses, letting sibling agents observe each other
/// without polling (spec §9 "Coordination-by-polling-avoidance").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSnapshot {
    pub active_count: u32,
    pub completed_count: u32,
    pub total_spawned: u32,
    pub recent_progress: Vec<ProgressEntry>,
    pub recent_findings: Vec<FindingEntry>,
}

/// An entry in the global registry's `tasks` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalTaskEntry {
    pub description: String,
    pub workspace: String,
    pub workspace_base: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_project_reference: Option<bool>,
}

/// An entry in the global registry's `agents` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalAgentEntry {
    pub task_id: String,
    pub agent_type: String,
    pub status: AgentStatusKind,
}

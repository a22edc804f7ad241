use thiserror::Error;

/// Convenience type alias for Results with SpiralError
pub type Result<T> = std::result::Result<T, SpiralError>;

/// Main error type for Spiral Core.
///
/// Variants are grouped by the error kinds in the error taxonomy: input,
/// policy, contention, environment, spawn, integrity, validation.
#[derive(Error, Debug)]
pub enum SpiralError {
    // --- Input ---
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("agent not found: {agent_id} in task {task_id}")]
    AgentNotFound { task_id: String, agent_id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // --- Policy (Anti-Spiral Gate rejections) ---
    #[error("concurrency limit reached: {active}/{max_concurrent} active agents in task {task_id}")]
    ConcurrencyLimitReached {
        task_id: String,
        active: u32,
        max_concurrent: u32,
    },

    #[error("total agent limit reached: {spawned}/{max_agents} spawned in task {task_id}")]
    TotalLimitReached {
        task_id: String,
        spawned: u32,
        max_agents: u32,
    },

    #[error("depth limit reached: depth {depth} exceeds max_depth {max_depth} in task {task_id}")]
    DepthLimitReached {
        task_id: String,
        depth: u32,
        max_depth: u32,
    },

    #[error("an active agent of type {agent_type} already exists in task {task_id}")]
    DuplicateAgentActive { task_id: String, agent_type: String },

    // --- Contention ---
    #[error("lock contention: could not acquire exclusive lock on {path} within {timeout_ms}ms")]
    LockContentionError { path: String, timeout_ms: u64 },

    // --- Environment ---
    #[error("insufficient disk space on {path}: {available_bytes} bytes available, need at least {required_bytes}")]
    InsufficientDisk {
        path: String,
        available_bytes: u64,
        required_bytes: u64,
    },

    #[error("workspace unwritable: {path} ({reason})")]
    WorkspaceUnwritable { path: String, reason: String },

    #[error("no process host backend configured for {0:?}")]
    MissingBackend(String),

    // --- Spawn ---
    #[error("failed to spawn agent process/session: {reason}")]
    SpawnFailed { reason: String },

    // --- Integrity ---
    #[error("corrupt registry at {path}: {reason}")]
    CorruptRegistryError { path: String, reason: String },

    // --- Validation ---
    #[error("conversation history invalid: {0}")]
    ConversationHistoryInvalid(String),

    // --- Ambient / carried from teacher ---
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SpiralError {
    /// True for errors the caller may retry without changing their request.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SpiralError::LockContentionError { .. })
    }
}

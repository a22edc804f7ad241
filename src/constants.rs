//! System-wide tunables shared across modules.

use std::time::Duration;

/// Default spiral caps (overridable per task via `SpiralLimits`, and at
/// the process level via `config::Config`).
pub const DEFAULT_MAX_CONCURRENT: u32 = 20;
pub const DEFAULT_MAX_AGENTS: u32 = 45;
pub const DEFAULT_MAX_DEPTH: u32 = 5;

/// Registry lock acquisition budget (§5: "5s for locks").
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Wall-clock budget for process/session liveness probes (§5).
pub const PROCESS_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Wall-clock budget for a full registry reconciliation sweep (§5).
pub const REGISTRY_SWEEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL during agent termination.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Pause before verifying event-log file-size stability during cleanup.
pub const CLEANUP_STABILITY_WAIT: Duration = Duration::from_millis(200);

/// How often the liveness daemon sweeps every task registry.
pub const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// No-progress duration after which the liveness daemon force-terminates
/// an agent still marked active.
pub const LIVENESS_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(110 * 60);

/// Minimum free disk space required before a spawn is attempted.
pub const MIN_FREE_DISK_BYTES: u64 = 100 * 1024 * 1024;

/// Conversation-history validation limits (§6).
pub const MAX_CONVERSATION_MESSAGES: usize = 50;
pub const MAX_USER_MESSAGE_CHARS: usize = 150;
pub const MAX_ORCHESTRATOR_MESSAGE_CHARS: usize = 8192;
pub const MAX_CONVERSATION_TOTAL_BYTES: usize = 15 * 1024;
pub const MIN_RETAINED_RECENT_MESSAGES: usize = 5;

/// Coordination snapshot sizes piggy-backed on progress/finding reports.
pub const COORDINATION_RECENT_PROGRESS: usize = 5;
pub const COORDINATION_RECENT_FINDINGS: usize = 3;

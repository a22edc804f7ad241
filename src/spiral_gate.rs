//! Anti-Spiral Gate (§4.E): the pre-deployment checks that stop runaway
//! recursive agent spawning. The authoritative call happens inside the
//! same `with_registry` section that appends the new agent (see
//! `lifecycle::LifecycleController::deploy_agent`), so the check and the
//! mutation it gates read and write the same locked document and cannot
//! race against a concurrent deployment. An earlier call against a plain
//! snapshot, before the process is spawned, is only a fast-fail to avoid
//! paying for a spawn that the atomic check would reject anyway.

use crate::error::{Result, SpiralError};
use crate::models::TaskRecord;

/// Runs the four checks in the order the spec lists them. The first
/// violated check wins.
pub fn check(task: &TaskRecord, agent_type: &str, parent_depth: Option<u32>) -> Result<()> {
    let limits = task.limits;

    if task.active_count >= limits.max_concurrent {
        return Err(SpiralError::ConcurrencyLimitReached {
            task_id: task.task_id.clone(),
            active: task.active_count,
            max_concurrent: limits.max_concurrent,
        });
    }

    if task.total_spawned >= limits.max_agents {
        return Err(SpiralError::TotalLimitReached {
            task_id: task.task_id.clone(),
            spawned: task.total_spawned,
            max_agents: limits.max_agents,
        });
    }

    let depth = parent_depth.map(|d| d + 1).unwrap_or(0);
    if depth > limits.max_depth {
        return Err(SpiralError::DepthLimitReached {
            task_id: task.task_id.clone(),
            depth,
            max_depth: limits.max_depth,
        });
    }

    let duplicate_active = task
        .agents
        .iter()
        .any(|a| a.agent_type == agent_type && a.is_active());
    if duplicate_active {
        return Err(SpiralError::DuplicateAgentActive {
            task_id: task.task_id.clone(),
            agent_type: agent_type.to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Agent, AgentStatusKind, BackendHandle, Priority, SpiralLimits, TaskContext, TaskStatus,
        ORCHESTRATOR_PARENT,
    };

    fn base_task() -> TaskRecord {
        TaskRecord {
            task_id: "task-1".into(),
            description: "d".into(),
            priority: Priority::Medium,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            workspace: "/tmp/x".into(),
            status: TaskStatus::Active,
            limits: SpiralLimits {
                max_concurrent: 2,
                max_agents: 3,
                max_depth: 2,
            },
            total_spawned: 0,
            active_count: 0,
            completed_count: 0,
            agents: vec![],
            context: TaskContext::default(),
            client_cwd: None,
        }
    }

    fn make_agent(agent_type: &str, status: AgentStatusKind) -> Agent {
        Agent {
            agent_id: format!("{agent_type}-000000-aaaaaa"),
            agent_type: agent_type.to_string(),
            parent: ORCHESTRATOR_PARENT.into(),
            depth: 0,
            status,
            progress: 0,
            message: String::new(),
            prompt: String::new(),
            started_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            terminal_at: None,
            backend: BackendHandle::default(),
            completion_verdict: None,
            cleanup_result: None,
            auto_cleanup_error: None,
        }
    }

    #[test]
    fn allows_within_limits() {
        let task = base_task();
        assert!(check(&task, "investigator", None).is_ok());
    }

    #[test]
    fn rejects_at_exact_concurrency_cap_not_before() {
        let mut task = base_task();
        task.agents.push(make_agent("a", AgentStatusKind::Running));
        task.active_count = 1;
        assert!(check(&task, "b", None).is_ok());

        task.agents.push(make_agent("b", AgentStatusKind::Running));
        task.active_count = 2;
        let err = check(&task, "c", None).unwrap_err();
        assert!(matches!(err, SpiralError::ConcurrencyLimitReached { .. }));
    }

    #[test]
    fn rejects_total_spawned_cap() {
        let mut task = base_task();
        task.total_spawned = 3;
        let err = check(&task, "x", None).unwrap_err();
        assert!(matches!(err, SpiralError::TotalLimitReached { .. }));
    }

    #[test]
    fn rejects_depth_over_max() {
        let task = base_task();
        let err = check(&task, "x", Some(2)).unwrap_err();
        assert!(matches!(err, SpiralError::DepthLimitReached { .. }));
    }

    #[test]
    fn rejects_duplicate_active_agent_type() {
        let mut task = base_task();
        task.agents
            .push(make_agent("investigator", AgentStatusKind::Working));
        task.active_count = 1;
        let err = check(&task, "investigator", None).unwrap_err();
        assert!(matches!(err, SpiralError::DuplicateAgentActive { .. }));
    }

    #[test]
    fn terminal_duplicate_does_not_block() {
        let mut task = base_task();
        task.agents
            .push(make_agent("investigator", AgentStatusKind::Completed));
        assert!(check(&task, "investigator", None).is_ok());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};
use crate::types::{AgentId, AssignmentId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Completed,
    Failed,
    TimedOut,
}

impl AssignmentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AssignmentStatus::Active)
    }

    /// Only `Active` may move, and only to a terminal status.
    pub fn transition(self, to: AssignmentStatus) -> Result<AssignmentStatus> {
        match (self, to) {
            (AssignmentStatus::Active, AssignmentStatus::Completed)
            | (AssignmentStatus::Active, AssignmentStatus::Failed)
            | (AssignmentStatus::Active, AssignmentStatus::TimedOut) => Ok(to),
            _ => Err(SwarmError::InvalidState(format!(
                "assignment cannot move from {} to {}",
                self, to
            ))),
        }
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssignmentStatus::Active => write!(f, "active"),
            AssignmentStatus::Completed => write!(f, "completed"),
            AssignmentStatus::Failed => write!(f, "failed"),
            AssignmentStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Binding of one task to one agent. References both by id only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    /// Registration of the agent the units were reserved on.
    pub agent_generation: u64,
    /// Units reserved on the agent for the lifetime of this assignment.
    pub units: u32,
    pub assigned_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
    pub progress: f64,
    pub status: AssignmentStatus,
    pub failure_reason: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn new(
        task_id: TaskId,
        agent_id: AgentId,
        agent_generation: u64,
        units: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AssignmentId::new(),
            task_id,
            agent_id,
            agent_generation,
            units,
            assigned_at: now,
            last_progress_at: now,
            progress: 0.0,
            status: AssignmentStatus::Active,
            failure_reason: None,
            finished_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AssignmentStatus::Active
    }

    pub(crate) fn finish(
        &mut self,
        to: AssignmentStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.status = self.status.transition(to)?;
        self.failure_reason = reason;
        self.finished_at = Some(now);
        if to == AssignmentStatus::Completed {
            self.progress = 1.0;
        }
        Ok(())
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};
use crate::types::{AgentId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Validate a status change against the task lifecycle.
    pub fn transition(self, to: TaskStatus) -> Result<TaskStatus> {
        use TaskStatus::*;
        match (self, to) {
            (Pending, Assigned) | (Pending, Cancelled) => Ok(to),
            (Assigned, Running)
            | (Assigned, Succeeded)
            | (Assigned, Pending)
            | (Assigned, Failed)
            | (Assigned, Cancelled) => Ok(to),
            (Running, Succeeded) | (Running, Pending) | (Running, Failed) => Ok(to),
            (Pending, _) | (Assigned, _) | (Running, _) | (Succeeded, _) | (Failed, _)
            | (Cancelled, _) => Err(SwarmError::InvalidState(format!(
                "task cannot move from {} to {}",
                self, to
            ))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Submission request for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub required_units: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub preferred_location: Option<String>,
}

impl NewTask {
    pub fn new(required_units: u32, priority: i32) -> Self {
        Self {
            required_units,
            priority,
            preferred_location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.preferred_location = Some(location.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub required_units: u32,
    pub preferred_location: Option<String>,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub status: TaskStatus,
    /// Failed assignment attempts so far.
    pub attempts: u32,
    pub assigned_agent: Option<AgentId>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        required_units: u32,
        priority: i32,
        preferred_location: Option<String>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self::with_id(
            TaskId::new(),
            required_units,
            priority,
            preferred_location,
            submitted_at,
        )
    }

    pub fn with_id(
        id: TaskId,
        required_units: u32,
        priority: i32,
        preferred_location: Option<String>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            required_units,
            preferred_location,
            priority,
            submitted_at,
            status: TaskStatus::Pending,
            attempts: 0,
            assigned_agent: None,
            last_error: None,
            finished_at: None,
        }
    }

    pub(crate) fn set_status(&mut self, to: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        self.status = self.status.transition(to)?;
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }
}

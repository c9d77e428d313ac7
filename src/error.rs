use thiserror::Error;

use crate::types::{AgentId, AssignmentId, TaskId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SwarmError {
    #[error("Agent already registered: {0}")]
    DuplicateAgent(AgentId),

    #[error("Agent not found: {0}")]
    UnknownAgent(AgentId),

    #[error("Invalid agent: {0}")]
    InvalidAgent(String),

    #[error("Task not found: {0}")]
    UnknownTask(TaskId),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Assignment not found: {0}")]
    UnknownAssignment(AssignmentId),

    #[error("Task {task_id} exhausted its {attempts} attempts")]
    RetriesExhausted { task_id: TaskId, attempts: u32 },

    #[error("Agent {agent_id} cannot take {requested} units ({available} available)")]
    CapacityExceeded {
        agent_id: AgentId,
        requested: u32,
        available: u32,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid progress fraction: {0}")]
    InvalidProgress(f64),

    #[error("Task {0} is not cancellable in its current state")]
    NotCancellable(TaskId),

    #[error("Task queue is at capacity ({0} tasks)")]
    QueueFull(usize),

    #[error("Malformed request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SwarmError {
    /// Stable machine-readable name of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            SwarmError::DuplicateAgent(_) => "duplicate_agent",
            SwarmError::UnknownAgent(_) => "unknown_agent",
            SwarmError::InvalidAgent(_) => "invalid_agent",
            SwarmError::UnknownTask(_) => "unknown_task",
            SwarmError::InvalidTask(_) => "invalid_task",
            SwarmError::UnknownAssignment(_) => "unknown_assignment",
            SwarmError::RetriesExhausted { .. } => "retries_exhausted",
            SwarmError::CapacityExceeded { .. } => "capacity_exceeded",
            SwarmError::InvalidState(_) => "invalid_state",
            SwarmError::InvalidProgress(_) => "invalid_progress",
            SwarmError::NotCancellable(_) => "not_cancellable",
            SwarmError::QueueFull(_) => "queue_full",
            SwarmError::InvalidRequest(_) => "invalid_request",
            SwarmError::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;

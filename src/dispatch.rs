use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{AgentId, AssignmentId, TaskId};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Outbound notification for agents. Delivery is fire-and-forget: the
/// controller never waits for an acknowledgement, agents confirm through
/// heartbeats and progress reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    Assigned {
        assignment_id: AssignmentId,
        task_id: TaskId,
        agent_id: AgentId,
        units: u32,
    },
    Aborted {
        assignment_id: AssignmentId,
        task_id: TaskId,
        agent_id: AgentId,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: broadcast::Sender<DispatchEvent>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Never blocks. Events published with no subscriber are dropped.
    pub fn publish(&self, event: DispatchEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No dispatch subscribers, event dropped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }
}

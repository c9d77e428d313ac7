use std::sync::Arc;

use crate::error::SwarmError;
use crate::registry::{Agent, AgentRegistry};
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::task::Task;
use crate::tracker::{Assignment, AssignmentTracker};

pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Matches ready tasks to agents.
///
/// One cycle walks the ready tasks in priority order and gives each the
/// best-ranked eligible agent. A task with no room anywhere is skipped, not
/// failed, and is reconsidered on the next cycle.
#[derive(Debug)]
pub struct Scheduler {
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    tracker: Arc<AssignmentTracker>,
    batch_size: usize,
}

impl Scheduler {
    pub fn new(
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
        tracker: Arc<AssignmentTracker>,
        batch_size: usize,
    ) -> Self {
        Self {
            registry,
            queue,
            tracker,
            batch_size: batch_size.max(1),
        }
    }

    /// Run one scheduling cycle and return the assignments it made.
    pub fn run_cycle(&self) -> Vec<Assignment> {
        let ready = self.queue.dequeue_ready(self.batch_size);
        if ready.is_empty() {
            return Vec::new();
        }

        let assignments: Vec<Assignment> = ready
            .iter()
            .filter_map(|task| self.try_assign(task))
            .collect();

        tracing::debug!(
            considered = ready.len(),
            assigned = assignments.len(),
            "Scheduling cycle finished"
        );
        assignments
    }

    fn try_assign(&self, task: &Task) -> Option<Assignment> {
        let agent = self
            .registry
            .list_eligible(task.required_units, task.preferred_location.as_deref())
            .into_iter()
            .next()?;
        let units = task.required_units;

        match self.registry.reserve(&agent.id, agent.generation, units) {
            Ok(_) => {}
            Err(SwarmError::CapacityExceeded { available, .. }) => {
                tracing::debug!(
                    task_id = %task.id,
                    agent_id = %agent.id,
                    available,
                    "Agent filled up before reservation, retrying next cycle"
                );
                return None;
            }
            Err(e) => {
                tracing::debug!(task_id = %task.id, agent_id = %agent.id, error = %e, "Reservation failed");
                return None;
            }
        }

        // The assignment is recorded under the task's lock, so a cancel either
        // finds the task still Pending or finds the assignment to abort.
        let bound = self.queue.assign_with(&task.id, agent.id, |now| {
            self.tracker
                .open(task.id, agent.id, agent.generation, units, now)
        });
        let assignment = match bound {
            Ok(assignment) => assignment,
            Err(e) => {
                tracing::debug!(task_id = %task.id, error = %e, "Task no longer assignable");
                self.release(&agent, units);
                return None;
            }
        };

        if !self.registry.is_current(&agent.id, agent.generation) {
            tracing::debug!(task_id = %task.id, agent_id = %agent.id, "Agent removed during assignment");
            self.tracker.withdraw(&assignment.id, "agent removed");
            return None;
        }
        if !self.tracker.announce(&assignment.id) {
            tracing::debug!(task_id = %task.id, assignment_id = %assignment.id, "Assignment finished before dispatch");
            return None;
        }

        tracing::info!(
            task_id = %task.id,
            agent_id = %agent.id,
            location_match = agent.matches_location(task.preferred_location.as_deref()),
            "Task assigned"
        );
        Some(assignment)
    }

    fn release(&self, agent: &Agent, units: u32) {
        if let Err(e) = self.registry.release(&agent.id, agent.generation, units) {
            tracing::warn!(agent_id = %agent.id, error = %e, "Failed to release reservation");
        }
    }
}

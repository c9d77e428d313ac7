//! Assignment lifecycle: progress, completion, failure and stall detection.
//!
//! Heartbeat loss and task stalls are tracked independently. An agent can
//! keep heartbeating while one of its tasks is wedged, so every assignment
//! carries its own progress deadline.
//!
//! Lock order: `active_by_task` may be held while touching `assignments`,
//! never the other way round.

pub mod assignment;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::Clock;
use crate::dispatch::{DispatchEvent, Dispatcher};
use crate::error::{Result, SwarmError};
use crate::registry::AgentRegistry;
use crate::scheduler::{TaskQueue, TaskStatus};
use crate::types::{AgentId, AssignmentId, TaskId};

pub use assignment::{Assignment, AssignmentStatus};

#[derive(Debug)]
pub struct AssignmentTracker {
    assignments: DashMap<AssignmentId, Assignment>,
    active_by_task: DashMap<TaskId, AssignmentId>,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    dispatcher: Dispatcher,
    progress_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl AssignmentTracker {
    pub fn new(
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
        dispatcher: Dispatcher,
        progress_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            assignments: DashMap::new(),
            active_by_task: DashMap::new(),
            registry,
            queue,
            dispatcher,
            progress_timeout,
            clock,
        }
    }

    /// Record a new Active assignment. The caller has already reserved
    /// `units` on registration `agent_generation` of the agent. Nothing is
    /// dispatched until [`announce`](Self::announce).
    pub fn open(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        agent_generation: u64,
        units: u32,
        now: DateTime<Utc>,
    ) -> Result<Assignment> {
        let assignment = match self.active_by_task.entry(task_id) {
            Entry::Occupied(existing) => {
                return Err(SwarmError::InvalidState(format!(
                    "task {} already has active assignment {}",
                    task_id,
                    existing.get()
                )));
            }
            Entry::Vacant(vacant) => {
                let assignment = Assignment::new(task_id, agent_id, agent_generation, units, now);
                self.assignments.insert(assignment.id, assignment.clone());
                vacant.insert(assignment.id);
                assignment
            }
        };

        tracing::info!(
            assignment_id = %assignment.id,
            task_id = %task_id,
            agent_id = %agent_id,
            units,
            "Assignment opened"
        );
        Ok(assignment)
    }

    /// Publish the Assigned event for an assignment that is still Active.
    /// Returns false when it was finished in the meantime.
    pub fn announce(&self, id: &AssignmentId) -> bool {
        // Held across the publish so an abort cannot overtake the assignment.
        let Some(assignment) = self.assignments.get(id) else {
            return false;
        };
        if !assignment.is_active() {
            return false;
        }
        self.dispatcher.publish(DispatchEvent::Assigned {
            assignment_id: assignment.id,
            task_id: assignment.task_id,
            agent_id: assignment.agent_id,
            units: assignment.units,
        });
        true
    }

    /// Take back an assignment that was never announced. Its units are
    /// released and the task returns to Pending without using an attempt.
    pub fn withdraw(&self, id: &AssignmentId, reason: &str) -> Option<Assignment> {
        match self.finish(id, AssignmentStatus::Failed, Some(reason.to_string())) {
            Ok(assignment) => {
                if let Err(e) = self.queue.unassign(&assignment.task_id, &assignment.agent_id) {
                    tracing::debug!(task_id = %assignment.task_id, error = %e, "Task not returned to pending");
                }
                Some(assignment)
            }
            Err(e) => {
                tracing::debug!(assignment_id = %id, error = %e, "Nothing to withdraw");
                None
            }
        }
    }

    /// Record progress on an Active assignment. The first report moves the
    /// task to Running.
    pub fn report_progress(&self, id: &AssignmentId, fraction: f64) -> Result<()> {
        if !fraction.is_finite() || !(0.0..=1.0).contains(&fraction) {
            return Err(SwarmError::InvalidProgress(fraction));
        }
        let now = self.clock.now();
        let task_id = {
            let mut assignment = self
                .assignments
                .get_mut(id)
                .ok_or(SwarmError::UnknownAssignment(*id))?;
            if !assignment.is_active() {
                return Err(SwarmError::InvalidState(format!(
                    "assignment {} is {}",
                    id, assignment.status
                )));
            }
            assignment.progress = fraction;
            assignment.last_progress_at = now;
            assignment.task_id
        };

        if let Err(e) = self.queue.mark_running(&task_id) {
            tracing::debug!(task_id = %task_id, error = %e, "Task not moved to running");
        }
        tracing::debug!(assignment_id = %id, fraction, "Progress reported");
        Ok(())
    }

    /// Finish successfully: release units and mark the task Succeeded.
    pub fn complete(&self, id: &AssignmentId) -> Result<Assignment> {
        let assignment = self.finish(id, AssignmentStatus::Completed, None)?;
        if let Err(e) = self.queue.mark_succeeded(&assignment.task_id) {
            tracing::warn!(task_id = %assignment.task_id, error = %e, "Completed assignment for a task that cannot succeed");
        }
        Ok(assignment)
    }

    /// Finish with a failure: release units and requeue the task. Returns the
    /// task's resulting status, `Failed` once retries are exhausted.
    pub fn fail(&self, id: &AssignmentId, reason: &str) -> Result<TaskStatus> {
        let assignment = self.finish(id, AssignmentStatus::Failed, Some(reason.to_string()))?;
        Ok(self.requeue(&assignment.task_id, reason))
    }

    /// Abort the active assignment of a cancelled task. Units are released
    /// and the agent is notified; the task is not requeued.
    pub fn abort_task(&self, task_id: &TaskId, reason: &str) -> Option<Assignment> {
        let id = self.active_by_task.get(task_id).map(|a| *a)?;
        match self.finish(&id, AssignmentStatus::Failed, Some(reason.to_string())) {
            Ok(assignment) => {
                self.dispatcher.publish(DispatchEvent::Aborted {
                    assignment_id: assignment.id,
                    task_id: assignment.task_id,
                    agent_id: assignment.agent_id,
                    reason: reason.to_string(),
                });
                Some(assignment)
            }
            Err(e) => {
                tracing::debug!(task_id = %task_id, error = %e, "Nothing to abort");
                None
            }
        }
    }

    /// Fail every active assignment on an agent that was removed.
    pub fn fail_agent(&self, agent_id: &AgentId, reason: &str) -> Vec<(AssignmentId, TaskStatus)> {
        self.active_for_agent(agent_id)
            .into_iter()
            .filter_map(|a| match self.fail(&a.id, reason) {
                Ok(status) => Some((a.id, status)),
                Err(e) => {
                    tracing::debug!(assignment_id = %a.id, error = %e, "Assignment already finished");
                    None
                }
            })
            .collect()
    }

    /// Time out assignments with no progress for longer than the progress
    /// timeout. Their units are released and their tasks requeued.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<AssignmentId> {
        let stalled: Vec<AssignmentId> = self
            .assignments
            .iter()
            .filter(|a| a.is_active() && now - a.last_progress_at > self.progress_timeout)
            .map(|a| a.id)
            .collect();

        stalled
            .into_iter()
            .filter_map(|id| {
                match self.finish(&id, AssignmentStatus::TimedOut, Some("progress timeout".to_string())) {
                    Ok(assignment) => {
                        tracing::warn!(
                            assignment_id = %id,
                            task_id = %assignment.task_id,
                            agent_id = %assignment.agent_id,
                            last_progress_at = %assignment.last_progress_at,
                            "Assignment timed out"
                        );
                        self.requeue(&assignment.task_id, "progress timeout");
                        Some(id)
                    }
                    Err(_) => None,
                }
            })
            .collect()
    }

    pub fn get(&self, id: &AssignmentId) -> Option<Assignment> {
        self.assignments.get(id).map(|a| a.clone())
    }

    pub fn active_for_task(&self, task_id: &TaskId) -> Option<Assignment> {
        let id = self.active_by_task.get(task_id).map(|a| *a)?;
        self.get(&id).filter(Assignment::is_active)
    }

    pub fn active_for_agent(&self, agent_id: &AgentId) -> Vec<Assignment> {
        let mut active: Vec<Assignment> = self
            .assignments
            .iter()
            .filter(|a| a.is_active() && a.agent_id == *agent_id)
            .map(|a| a.clone())
            .collect();
        active.sort_by_key(|a| (a.assigned_at, a.id));
        active
    }

    /// All assignments in creation order.
    pub fn snapshot(&self) -> Vec<Assignment> {
        let mut all: Vec<Assignment> = self.assignments.iter().map(|a| a.clone()).collect();
        all.sort_by_key(|a| (a.assigned_at, a.id));
        all
    }

    pub fn active_count(&self) -> usize {
        self.active_by_task.len()
    }

    /// Drop terminal assignments that finished before `cutoff`.
    pub fn purge_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.assignments.len();
        self.assignments
            .retain(|_, a| !(a.status.is_terminal() && a.finished_at.is_some_and(|at| at < cutoff)));
        before.saturating_sub(self.assignments.len())
    }

    /// Move an Active assignment to a terminal status and hand its units
    /// back to the agent.
    fn finish(
        &self,
        id: &AssignmentId,
        to: AssignmentStatus,
        reason: Option<String>,
    ) -> Result<Assignment> {
        let now = self.clock.now();
        let finished = {
            let mut assignment = self
                .assignments
                .get_mut(id)
                .ok_or(SwarmError::UnknownAssignment(*id))?;
            assignment.finish(to, reason, now)?;
            assignment.clone()
        };

        self.active_by_task
            .remove_if(&finished.task_id, |_, active| active == id);
        match self
            .registry
            .release(&finished.agent_id, finished.agent_generation, finished.units)
        {
            Ok(_) => {}
            Err(SwarmError::InvalidState(e)) => {
                tracing::debug!(agent_id = %finished.agent_id, error = %e, "Units belong to a replaced registration");
            }
            Err(e) => {
                tracing::warn!(agent_id = %finished.agent_id, error = %e, "Failed to release units");
            }
        }
        tracing::info!(
            assignment_id = %id,
            task_id = %finished.task_id,
            agent_id = %finished.agent_id,
            status = %finished.status,
            "Assignment finished"
        );
        Ok(finished)
    }

    fn requeue(&self, task_id: &TaskId, reason: &str) -> TaskStatus {
        match self.queue.requeue(task_id, reason) {
            Ok(_) => TaskStatus::Pending,
            Err(SwarmError::RetriesExhausted { .. }) => TaskStatus::Failed,
            Err(e) => {
                tracing::debug!(task_id = %task_id, error = %e, "Task not requeued");
                self.queue
                    .get(task_id)
                    .map(|t| t.status)
                    .unwrap_or(TaskStatus::Failed)
            }
        }
    }
}

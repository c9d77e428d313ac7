use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::ControllerConfig;
use crate::dispatch::{DispatchEvent, Dispatcher};
use crate::error::{Result, SwarmError};
use crate::registry::{Agent, AgentKind, AgentRegistry, AgentStatus, NewAgent};
use crate::scheduler::{NewTask, Scheduler, Task, TaskQueue, TaskStatus};
use crate::tracker::{Assignment, AssignmentTracker};
use crate::types::{AgentId, AssignmentId, TaskId};

/// Aggregate counters shown at the top of the status page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmSummary {
    pub cloud_agents: usize,
    pub browser_agents: usize,
    pub online_agents: usize,
    /// vCPU-equivalent units across all agents that are not removed.
    pub total_compute: u64,
    pub used_compute: u64,
    pub pending_tasks: usize,
    pub assigned_tasks: usize,
    pub running_tasks: usize,
    pub succeeded_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub active_assignments: usize,
}

impl SwarmSummary {
    fn build(agents: &[Agent], tasks: &[Task], assignments: &[Assignment]) -> Self {
        let mut summary = SwarmSummary::default();
        for agent in agents.iter().filter(|a| a.status != AgentStatus::Removed) {
            match agent.kind {
                AgentKind::Cloud => summary.cloud_agents += 1,
                AgentKind::Browser => summary.browser_agents += 1,
            }
            if agent.status == AgentStatus::Online {
                summary.online_agents += 1;
            }
            summary.total_compute += u64::from(agent.capacity);
            summary.used_compute += u64::from(agent.load_used);
        }
        for task in tasks {
            let counter = match task.status {
                TaskStatus::Pending => &mut summary.pending_tasks,
                TaskStatus::Assigned => &mut summary.assigned_tasks,
                TaskStatus::Running => &mut summary.running_tasks,
                TaskStatus::Succeeded => &mut summary.succeeded_tasks,
                TaskStatus::Failed => &mut summary.failed_tasks,
                TaskStatus::Cancelled => &mut summary.cancelled_tasks,
            };
            *counter += 1;
        }
        summary.active_assignments = assignments.iter().filter(|a| a.is_active()).count();
        summary
    }
}

/// Read-only view of the whole swarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub summary: SwarmSummary,
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    pub assignments: Vec<Assignment>,
}

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub unreachable_agents: Vec<AgentId>,
    pub removed_agents: Vec<AgentId>,
    pub timed_out: Vec<AssignmentId>,
    pub purged_tasks: usize,
    pub purged_assignments: usize,
}

/// The controller owns the registry, queue and tracker and is the only
/// entry point for outside callers.
///
/// Every operation completes in bounded local time. The scheduling and
/// sweep loops started by [`SwarmController::run`] are the only periodic
/// work; tests drive them one step at a time through
/// [`SwarmController::run_scheduling_cycle`] and [`SwarmController::run_sweep`].
#[derive(Debug)]
pub struct SwarmController {
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    tracker: Arc<AssignmentTracker>,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    wake: Notify,
}

impl SwarmController {
    pub fn new(config: ControllerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ControllerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let dispatcher = Dispatcher::default();
        let registry = Arc::new(AgentRegistry::new(
            config.heartbeat_timeout(),
            config.unreachable_grace(),
            clock.clone(),
        ));
        let queue = Arc::new(TaskQueue::with_capacity(
            config.max_attempts,
            config.max_queued_tasks,
            clock.clone(),
        ));
        let tracker = Arc::new(AssignmentTracker::new(
            registry.clone(),
            queue.clone(),
            dispatcher.clone(),
            config.progress_timeout(),
            clock.clone(),
        ));
        let scheduler = Scheduler::new(
            registry.clone(),
            queue.clone(),
            tracker.clone(),
            config.batch_size,
        );

        Ok(Self {
            config,
            clock,
            registry,
            queue,
            tracker,
            scheduler,
            dispatcher,
            wake: Notify::new(),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn submit_task(&self, request: NewTask) -> Result<TaskId> {
        let task = Task::new(
            request.required_units,
            request.priority,
            request.preferred_location,
            self.clock.now(),
        );
        let id = self.queue.enqueue(task)?;
        self.wake.notify_one();
        Ok(id)
    }

    pub fn register_agent(&self, request: NewAgent) -> Result<AgentId> {
        let id = self.registry.register(request)?;
        self.wake.notify_one();
        Ok(id)
    }

    pub fn heartbeat(&self, id: &AgentId, reported_load: Option<u32>) -> Result<AgentStatus> {
        let was_online = self
            .registry
            .get(id)
            .is_some_and(|a| a.status == AgentStatus::Online);
        let status = self.registry.heartbeat(id, reported_load)?;
        if !was_online && status == AgentStatus::Online {
            self.wake.notify_one();
        }
        Ok(status)
    }

    /// Deregister an agent. A forced removal fails its active assignments
    /// so their tasks go back to the queue.
    pub fn deregister_agent(&self, id: &AgentId, force: bool) -> Result<AgentStatus> {
        let status = self.registry.deregister(id, force)?;
        if status == AgentStatus::Removed {
            let failed = self.tracker.fail_agent(id, "agent removed");
            if !failed.is_empty() {
                tracing::info!(agent_id = %id, count = failed.len(), "Requeued work of removed agent");
                self.wake.notify_one();
            }
        }
        Ok(status)
    }

    pub fn report_progress(&self, id: &AssignmentId, fraction: f64) -> Result<()> {
        self.tracker.report_progress(id, fraction)
    }

    pub fn complete_assignment(&self, id: &AssignmentId) -> Result<Assignment> {
        let assignment = self.tracker.complete(id)?;
        self.wake.notify_one();
        Ok(assignment)
    }

    pub fn fail_assignment(&self, id: &AssignmentId, reason: &str) -> Result<TaskStatus> {
        let status = self.tracker.fail(id, reason)?;
        self.wake.notify_one();
        Ok(status)
    }

    /// Cancel a Pending or Assigned task. An assigned task's agent is told
    /// to abort, but the task is Cancelled without waiting for it.
    pub fn cancel_task(&self, id: &TaskId) -> Result<()> {
        if self.queue.cancel(id)? {
            if let Some(aborted) = self.tracker.abort_task(id, "cancelled") {
                tracing::info!(
                    task_id = %id,
                    assignment_id = %aborted.id,
                    agent_id = %aborted.agent_id,
                    "Abort signalled to agent"
                );
                self.wake.notify_one();
            }
        }
        Ok(())
    }

    /// Active assignments of one agent. This is how agents discover work
    /// without holding a connection open.
    pub fn assignments_for_agent(&self, id: &AgentId) -> Result<Vec<Assignment>> {
        match self.registry.get(id) {
            Some(agent) if agent.status != AgentStatus::Removed => {
                Ok(self.tracker.active_for_agent(id))
            }
            _ => Err(SwarmError::UnknownAgent(*id)),
        }
    }

    pub fn get_agent(&self, id: &AgentId) -> Result<Agent> {
        self.registry.get(id).ok_or(SwarmError::UnknownAgent(*id))
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.queue.get(id).ok_or(SwarmError::UnknownTask(*id))
    }

    pub fn get_assignment(&self, id: &AssignmentId) -> Result<Assignment> {
        self.tracker.get(id).ok_or(SwarmError::UnknownAssignment(*id))
    }

    pub fn get_status(&self) -> StatusSnapshot {
        let agents = self.registry.snapshot();
        let tasks = self.queue.snapshot();
        let assignments = self.tracker.snapshot();
        StatusSnapshot {
            generated_at: self.clock.now(),
            summary: SwarmSummary::build(&agents, &tasks, &assignments),
            agents,
            tasks,
            assignments,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.dispatcher.subscribe()
    }

    pub fn run_scheduling_cycle(&self) -> Vec<Assignment> {
        self.scheduler.run_cycle()
    }

    /// Mark silent agents unreachable, time out stalled assignments, and
    /// purge old finished records.
    pub fn run_sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let agents = self.registry.sweep(now);
        let timed_out = self.tracker.sweep(now);

        // A retention reaching past the representable range keeps everything.
        let cutoff = self
            .config
            .finished_retention()
            .and_then(|retention| now.checked_sub_signed(retention));
        let (purged_tasks, purged_assignments) = match cutoff {
            Some(cutoff) => (
                self.queue.purge_finished(cutoff),
                self.tracker.purge_finished(cutoff),
            ),
            None => (0, 0),
        };

        if !timed_out.is_empty() {
            self.wake.notify_one();
        }

        SweepReport {
            unreachable_agents: agents.unreachable,
            removed_agents: agents.removed,
            timed_out,
            purged_tasks,
            purged_assignments,
        }
    }

    /// Run the scheduling and sweep loops until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let scheduling = {
            let controller = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { controller.scheduling_loop(shutdown).await })
        };
        let sweeping = {
            let controller = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { controller.sweep_loop(shutdown).await })
        };

        for (name, handle) in [("scheduling", scheduling), ("sweep", sweeping)] {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Controller loop panicked");
            }
        }
        tracing::info!("Controller loops stopped");
    }

    /// Schedules on every tick, and early whenever new work or capacity shows up.
    async fn scheduling_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.scheduling_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.scheduler.run_cycle();
        }
    }

    async fn sweep_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let report = self.run_sweep();
            if !report.unreachable_agents.is_empty() || !report.timed_out.is_empty() {
                tracing::debug!(
                    unreachable = report.unreachable_agents.len(),
                    timed_out = report.timed_out.len(),
                    "Sweep finished"
                );
            }
        }
    }
}

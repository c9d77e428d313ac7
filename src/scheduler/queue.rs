use std::cmp::Reverse;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::Clock;
use crate::error::{Result, SwarmError};
use crate::scheduler::task::{Task, TaskStatus};
use crate::types::{AgentId, TaskId};

pub const DEFAULT_MAX_TASKS: usize = 10_000;

/// Holds every known task, keyed by id. Scheduling order is computed on read
/// so that a task stays in the table until it reaches a terminal status.
///
/// `live` counts non-terminal tasks. A submission claims a slot in it before
/// inserting, so concurrent submissions cannot overshoot `max_tasks`.
#[derive(Debug)]
pub struct TaskQueue {
    tasks: DashMap<TaskId, Task>,
    live: AtomicUsize,
    max_attempts: u32,
    max_tasks: usize,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(max_attempts: u32, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(max_attempts, DEFAULT_MAX_TASKS, clock)
    }

    pub fn with_capacity(max_attempts: u32, max_tasks: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: DashMap::new(),
            live: AtomicUsize::new(0),
            max_attempts,
            max_tasks,
            clock,
        }
    }

    /// Add a task in `Pending` status.
    pub fn enqueue(&self, mut task: Task) -> Result<TaskId> {
        if task.required_units == 0 {
            return Err(SwarmError::InvalidTask(
                "required_units must be greater than zero".to_string(),
            ));
        }
        let max = self.max_tasks;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| SwarmError::QueueFull(max))?;

        let id = task.id;
        match self.tasks.entry(id) {
            Entry::Occupied(_) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                Err(SwarmError::InvalidTask(format!("task {} already submitted", id)))
            }
            Entry::Vacant(vacant) => {
                task.status = TaskStatus::Pending;
                tracing::info!(
                    task_id = %id,
                    required_units = task.required_units,
                    priority = task.priority,
                    preferred_location = ?task.preferred_location,
                    "Task enqueued"
                );
                vacant.insert(task);
                Ok(id)
            }
        }
    }

    /// Up to `max_items` Pending tasks in scheduling order: priority desc,
    /// submission time asc, id asc. Tasks are not removed.
    pub fn dequeue_ready(&self, max_items: usize) -> Vec<Task> {
        let mut ready: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.clone())
            .collect();
        ready.sort_by_key(|t| (Reverse(t.priority), t.submitted_at, t.id));
        ready.truncate(max_items);
        ready
    }

    pub fn mark_assigned(&self, id: &TaskId, agent_id: AgentId) -> Result<()> {
        self.assign_with(id, agent_id, |_| Ok(()))
    }

    /// Move a Pending task to Assigned, running `bind` under the task's lock
    /// first. If `bind` fails the task stays Pending. Cancellation cannot
    /// interleave, so whatever `bind` records is visible to a cancel that
    /// follows. `bind` must not call back into the queue.
    pub fn assign_with<T>(
        &self,
        id: &TaskId,
        agent_id: AgentId,
        bind: impl FnOnce(DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let now = self.clock.now();
        let mut task = self.tasks.get_mut(id).ok_or(SwarmError::UnknownTask(*id))?;
        if task.status != TaskStatus::Pending {
            return Err(SwarmError::InvalidState(format!(
                "task {} is {}, not pending",
                id, task.status
            )));
        }
        let bound = bind(now)?;
        self.settle(&mut task, TaskStatus::Assigned, now)?;
        task.assigned_agent = Some(agent_id);
        Ok(bound)
    }

    /// Undo an assignment to `agent_id` that never started. Returns false,
    /// changing nothing, if the task has since moved on.
    pub fn unassign(&self, id: &TaskId, agent_id: &AgentId) -> Result<bool> {
        let now = self.clock.now();
        let mut task = self.tasks.get_mut(id).ok_or(SwarmError::UnknownTask(*id))?;
        if task.status != TaskStatus::Assigned || task.assigned_agent != Some(*agent_id) {
            return Ok(false);
        }
        self.settle(&mut task, TaskStatus::Pending, now)?;
        task.assigned_agent = None;
        tracing::debug!(task_id = %id, agent_id = %agent_id, "Task returned to pending");
        Ok(true)
    }

    /// First progress report moves an Assigned task to Running.
    pub fn mark_running(&self, id: &TaskId) -> Result<()> {
        let now = self.clock.now();
        let mut task = self.tasks.get_mut(id).ok_or(SwarmError::UnknownTask(*id))?;
        match task.status {
            TaskStatus::Running => Ok(()),
            _ => self.settle(&mut task, TaskStatus::Running, now),
        }
    }

    pub fn mark_succeeded(&self, id: &TaskId) -> Result<()> {
        let now = self.clock.now();
        let mut task = self.tasks.get_mut(id).ok_or(SwarmError::UnknownTask(*id))?;
        self.settle(&mut task, TaskStatus::Succeeded, now)?;
        tracing::info!(task_id = %id, "Task succeeded");
        Ok(())
    }

    /// Put a failed task back to Pending. Once `max_attempts` failures have
    /// accumulated the task is failed for good and `RetriesExhausted` is returned.
    pub fn requeue(&self, id: &TaskId, reason: &str) -> Result<u32> {
        let now = self.clock.now();
        let mut task = self.tasks.get_mut(id).ok_or(SwarmError::UnknownTask(*id))?;
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
            return Err(SwarmError::InvalidState(format!(
                "task {} is {}, only assigned or running tasks can be requeued",
                id, task.status
            )));
        }

        task.attempts = task.attempts.saturating_add(1);
        task.last_error = Some(reason.to_string());
        if task.attempts >= self.max_attempts {
            self.settle(&mut task, TaskStatus::Failed, now)?;
            tracing::warn!(task_id = %id, attempts = task.attempts, reason, "Task failed, retries exhausted");
            return Err(SwarmError::RetriesExhausted {
                task_id: *id,
                attempts: task.attempts,
            });
        }

        self.settle(&mut task, TaskStatus::Pending, now)?;
        tracing::info!(task_id = %id, attempts = task.attempts, reason, "Task requeued");
        Ok(task.attempts)
    }

    /// Cancel a Pending or Assigned task. Returns `true` when the task had
    /// been assigned, in which case its assignment must be aborted.
    pub fn cancel(&self, id: &TaskId) -> Result<bool> {
        let now = self.clock.now();
        let mut task = self.tasks.get_mut(id).ok_or(SwarmError::UnknownTask(*id))?;
        let was_assigned = match task.status {
            TaskStatus::Pending => false,
            TaskStatus::Assigned => true,
            TaskStatus::Running
            | TaskStatus::Succeeded
            | TaskStatus::Failed
            | TaskStatus::Cancelled => return Err(SwarmError::NotCancellable(*id)),
        };
        self.settle(&mut task, TaskStatus::Cancelled, now)?;
        tracing::info!(task_id = %id, was_assigned, "Task cancelled");
        Ok(was_assigned)
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.get(id).map(|t| t.clone())
    }

    /// All tasks in submission order.
    pub fn snapshot(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by_key(|t| (t.submitted_at, t.id));
        tasks
    }

    /// Drop terminal tasks that finished before `cutoff`. Returns how many were removed.
    pub fn purge_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.finished_at.is_some_and(|at| at < cutoff))
        });
        before.saturating_sub(self.tasks.len())
    }

    /// Number of tasks that have not reached a terminal status.
    pub fn active_len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.active_len() >= self.max_tasks
    }

    /// Apply a status change, freeing the task's slot when it becomes terminal.
    fn settle(&self, task: &mut Task, to: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        let was_live = !task.status.is_terminal();
        task.set_status(to, now)?;
        if was_live && to.is_terminal() {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use uuid::Uuid;

    fn queue(max_attempts: u32) -> (TaskQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (TaskQueue::new(max_attempts, clock.clone()), clock)
    }

    fn task_at(n: u128, priority: i32, at: DateTime<Utc>) -> Task {
        Task::with_id(TaskId::from_uuid(Uuid::from_u128(n)), 1, priority, None, at)
    }

    #[test]
    fn zero_unit_task_is_invalid() {
        let (queue, clock) = queue(3);
        let result = queue.enqueue(Task::new(0, 1, None, clock.now()));
        assert!(matches!(result, Err(SwarmError::InvalidTask(_))));
        assert!(queue.is_empty());
    }

    #[test]
    fn duplicate_task_is_invalid() {
        let (queue, clock) = queue(3);
        let task = Task::new(1, 1, None, clock.now());
        queue.enqueue(task.clone()).unwrap();
        assert!(matches!(queue.enqueue(task), Err(SwarmError::InvalidTask(_))));
    }

    #[test]
    fn ready_order_is_priority_then_fifo_then_id() {
        let (queue, clock) = queue(3);
        let t0 = clock.now();
        let t1 = t0 + Duration::milliseconds(10);

        queue.enqueue(task_at(5, 1, t0)).unwrap();
        queue.enqueue(task_at(4, 9, t1)).unwrap();
        queue.enqueue(task_at(3, 9, t0)).unwrap();
        queue.enqueue(task_at(2, 1, t0)).unwrap();

        let order: Vec<u128> = queue
            .dequeue_ready(10)
            .iter()
            .map(|t| t.id.as_uuid().as_u128())
            .collect();
        assert_eq!(order, vec![3, 4, 2, 5]);

        assert_eq!(queue.dequeue_ready(2).len(), 2);
        // Peek semantics: nothing was removed.
        assert_eq!(queue.dequeue_ready(10).len(), 4);
    }

    #[test]
    fn assigned_tasks_are_not_ready() {
        let (queue, clock) = queue(3);
        let id = queue.enqueue(Task::new(2, 1, None, clock.now())).unwrap();
        queue.mark_assigned(&id, AgentId::new()).unwrap();
        assert!(queue.dequeue_ready(10).is_empty());
        assert!(matches!(
            queue.mark_assigned(&id, AgentId::new()),
            Err(SwarmError::InvalidState(_))
        ));
    }

    #[test]
    fn requeue_fails_after_max_attempts() {
        let (queue, clock) = queue(2);
        let id = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();

        queue.mark_assigned(&id, AgentId::new()).unwrap();
        assert_eq!(queue.requeue(&id, "boom"), Ok(1));
        assert_eq!(queue.get(&id).unwrap().status, TaskStatus::Pending);

        queue.mark_assigned(&id, AgentId::new()).unwrap();
        assert_eq!(
            queue.requeue(&id, "boom again"),
            Err(SwarmError::RetriesExhausted {
                task_id: id,
                attempts: 2
            })
        );
        let task = queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("boom again"));
        assert!(queue.dequeue_ready(10).is_empty());
    }

    #[test]
    fn requeue_of_pending_task_is_invalid() {
        let (queue, clock) = queue(3);
        let id = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        assert!(matches!(queue.requeue(&id, "x"), Err(SwarmError::InvalidState(_))));
    }

    #[test]
    fn cancel_rules() {
        let (queue, clock) = queue(3);
        let pending = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        assert_eq!(queue.cancel(&pending), Ok(false));
        assert_eq!(queue.cancel(&pending), Err(SwarmError::NotCancellable(pending)));

        let assigned = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        queue.mark_assigned(&assigned, AgentId::new()).unwrap();
        assert_eq!(queue.cancel(&assigned), Ok(true));

        let running = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        queue.mark_assigned(&running, AgentId::new()).unwrap();
        queue.mark_running(&running).unwrap();
        assert_eq!(queue.cancel(&running), Err(SwarmError::NotCancellable(running)));

        let unknown = TaskId::new();
        assert_eq!(queue.cancel(&unknown), Err(SwarmError::UnknownTask(unknown)));
    }

    #[test]
    fn queue_full_counts_only_live_tasks() {
        let clock = Arc::new(ManualClock::default());
        let queue = TaskQueue::with_capacity(3, 2, clock.clone());
        let a = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        assert!(queue.is_full());
        assert_eq!(
            queue.enqueue(Task::new(1, 1, None, clock.now())),
            Err(SwarmError::QueueFull(2))
        );

        queue.cancel(&a).unwrap();
        assert!(queue.enqueue(Task::new(1, 1, None, clock.now())).is_ok());
    }

    #[test]
    fn concurrent_submissions_respect_the_limit() {
        let clock = Arc::new(ManualClock::default());
        let queue = Arc::new(TaskQueue::with_capacity(3, 16, clock.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                let now = clock.now();
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| queue.enqueue(Task::new(1, 1, None, now)).is_ok())
                        .count()
                })
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(accepted, 16);
        assert_eq!(queue.len(), 16);
        assert_eq!(queue.active_len(), 16);
    }

    #[test]
    fn live_count_follows_terminal_transitions() {
        let (queue, clock) = queue(1);
        let done = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        let failed = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        assert_eq!(queue.active_len(), 3);

        queue.mark_assigned(&done, AgentId::new()).unwrap();
        queue.mark_succeeded(&done).unwrap();
        queue.mark_assigned(&failed, AgentId::new()).unwrap();
        assert!(queue.requeue(&failed, "boom").is_err());
        assert_eq!(queue.active_len(), 1);

        // Rejected transitions leave the count alone.
        assert!(queue.cancel(&done).is_err());
        assert_eq!(queue.active_len(), 1);
    }

    #[test]
    fn failed_bind_leaves_task_pending() {
        let (queue, clock) = queue(3);
        let id = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();

        let result: Result<()> = queue.assign_with(&id, AgentId::new(), |_| {
            Err(SwarmError::InvalidState("taken".to_string()))
        });
        assert!(result.is_err());
        let task = queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_agent, None);
    }

    #[test]
    fn bind_is_skipped_for_cancelled_task() {
        let (queue, clock) = queue(3);
        let id = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        queue.cancel(&id).unwrap();

        let mut called = false;
        let result = queue.assign_with(&id, AgentId::new(), |_| {
            called = true;
            Ok(())
        });
        assert!(matches!(result, Err(SwarmError::InvalidState(_))));
        assert!(!called);
    }

    #[test]
    fn unassign_only_touches_matching_assignment() {
        let (queue, clock) = queue(3);
        let agent = AgentId::new();
        let id = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        queue.mark_assigned(&id, agent).unwrap();

        assert_eq!(queue.unassign(&id, &AgentId::new()), Ok(false));
        assert_eq!(queue.get(&id).unwrap().status, TaskStatus::Assigned);

        assert_eq!(queue.unassign(&id, &agent), Ok(true));
        let task = queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(queue.unassign(&id, &agent), Ok(false));
    }

    #[test]
    fn purge_removes_old_terminal_tasks() {
        let (queue, clock) = queue(3);
        let done = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        let live = queue.enqueue(Task::new(1, 1, None, clock.now())).unwrap();
        queue.cancel(&done).unwrap();

        clock.advance(Duration::seconds(10));
        assert_eq!(queue.purge_finished(clock.now() - Duration::seconds(20)), 0);
        assert_eq!(queue.purge_finished(clock.now()), 1);
        assert!(queue.get(&done).is_none());
        assert!(queue.get(&live).is_some());
    }
}

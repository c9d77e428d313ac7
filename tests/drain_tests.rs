use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use swarm_controller::clock::{Clock, ManualClock};
use swarm_controller::config::ControllerConfig;
use swarm_controller::dispatch::DispatchEvent;
use swarm_controller::registry::{AgentKind, AgentStatus, NewAgent};
use swarm_controller::scheduler::{NewTask, TaskStatus};
use swarm_controller::tracker::AssignmentStatus;
use swarm_controller::{AgentId, SwarmController, SwarmError, TaskId};

fn controller() -> SwarmController {
    let clock = Arc::new(ManualClock::default());
    SwarmController::with_clock(ControllerConfig::default(), clock).unwrap()
}

#[test]
fn test_idle_agent_is_removed_immediately() {
    let c = controller();
    let agent = c
        .register_agent(NewAgent::new(AgentKind::Browser, 2, "EU-West-1"))
        .unwrap();

    assert_eq!(c.deregister_agent(&agent, false).unwrap(), AgentStatus::Removed);
    assert!(matches!(
        c.deregister_agent(&agent, false),
        Err(SwarmError::UnknownAgent(_))
    ));
    assert!(matches!(
        c.assignments_for_agent(&agent),
        Err(SwarmError::UnknownAgent(_))
    ));
}

#[test]
fn test_graceful_deregister_drains_running_work() {
    let c = controller();
    let agent = c
        .register_agent(NewAgent::new(AgentKind::Cloud, 4, "US-East-1"))
        .unwrap();
    c.submit_task(NewTask::new(2, 0)).unwrap();
    let assignment = c.run_scheduling_cycle().remove(0);

    assert_eq!(c.deregister_agent(&agent, false).unwrap(), AgentStatus::Draining);

    // Draining agents keep their work but get nothing new.
    c.submit_task(NewTask::new(1, 0)).unwrap();
    assert!(c.run_scheduling_cycle().is_empty());
    assert_eq!(c.assignments_for_agent(&agent).unwrap().len(), 1);

    c.report_progress(&assignment.id, 0.5).unwrap();
    c.complete_assignment(&assignment.id).unwrap();

    let removed = c.get_agent(&agent).unwrap();
    assert_eq!(removed.status, AgentStatus::Removed);
    assert_eq!(removed.load_used, 0);
    assert_eq!(
        c.get_task(&assignment.task_id).unwrap().status,
        TaskStatus::Succeeded
    );
}

#[test]
fn test_forced_deregister_requeues_work() {
    let c = controller();
    let doomed = c
        .register_agent(NewAgent::new(AgentKind::Cloud, 4, "US-East-1"))
        .unwrap();
    let task = c.submit_task(NewTask::new(3, 0)).unwrap();
    let assignment = c.run_scheduling_cycle().remove(0);
    assert_eq!(assignment.agent_id, doomed);

    assert_eq!(c.deregister_agent(&doomed, true).unwrap(), AgentStatus::Removed);

    let failed = c.get_assignment(&assignment.id).unwrap();
    assert_eq!(failed.status, AssignmentStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("agent removed"));
    let requeued = c.get_task(&task).unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.attempts, 1);

    let rescuer = c
        .register_agent(NewAgent::new(AgentKind::Cloud, 4, "US-East-1"))
        .unwrap();
    let retry = c.run_scheduling_cycle().remove(0);
    assert_eq!(retry.task_id, task);
    assert_eq!(retry.agent_id, rescuer);
}

#[test]
fn test_cancel_pending_task() {
    let c = controller();
    let task = c.submit_task(NewTask::new(2, 0)).unwrap();

    c.cancel_task(&task).unwrap();
    let cancelled = c.get_task(&task).unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.finished_at.is_some());

    c.register_agent(NewAgent::new(AgentKind::Cloud, 4, "US-East-1"))
        .unwrap();
    assert!(c.run_scheduling_cycle().is_empty());
}

#[test]
fn test_cancel_assigned_task_aborts_and_frees_capacity() {
    let c = controller();
    let agent = c
        .register_agent(NewAgent::new(AgentKind::Cloud, 4, "US-East-1"))
        .unwrap();
    let task = c.submit_task(NewTask::new(4, 0)).unwrap();
    let assignment = c.run_scheduling_cycle().remove(0);
    let mut events = c.subscribe();

    c.cancel_task(&task).unwrap();

    assert_eq!(c.get_task(&task).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(c.get_agent(&agent).unwrap().load_used, 0);
    let aborted = c.get_assignment(&assignment.id).unwrap();
    assert_eq!(aborted.status, AssignmentStatus::Failed);
    assert_eq!(aborted.failure_reason.as_deref(), Some("cancelled"));
    assert_eq!(
        events.try_recv().unwrap(),
        DispatchEvent::Aborted {
            assignment_id: assignment.id,
            task_id: task,
            agent_id: agent,
            reason: "cancelled".to_string(),
        }
    );

    // A late completion from the agent does not resurrect the task.
    assert!(c.complete_assignment(&assignment.id).is_err());
    assert_eq!(c.get_task(&task).unwrap().status, TaskStatus::Cancelled);
}

#[test]
fn test_running_and_finished_tasks_cannot_be_cancelled() {
    let c = controller();
    c.register_agent(NewAgent::new(AgentKind::Cloud, 4, "US-East-1"))
        .unwrap();
    let task = c.submit_task(NewTask::new(1, 0)).unwrap();
    let assignment = c.run_scheduling_cycle().remove(0);

    c.report_progress(&assignment.id, 0.1).unwrap();
    assert_eq!(c.cancel_task(&task), Err(SwarmError::NotCancellable(task)));

    c.complete_assignment(&assignment.id).unwrap();
    assert_eq!(c.cancel_task(&task), Err(SwarmError::NotCancellable(task)));
}

#[test]
fn test_duplicate_registration_is_rejected() {
    let c = controller();
    let agent = c
        .register_agent(NewAgent::new(AgentKind::Cloud, 4, "US-East-1"))
        .unwrap();

    assert_eq!(
        c.register_agent(NewAgent::new(AgentKind::Cloud, 8, "US-East-1").with_id(agent)),
        Err(SwarmError::DuplicateAgent(agent))
    );
    assert_eq!(c.get_agent(&agent).unwrap().capacity, 4);
}

type Hook = Box<dyn FnOnce() + Send>;

/// Runs a one-shot hook on the n-th clock read after arming, letting a test
/// land an operation at each point where the controller reads the time.
#[derive(Default)]
struct HookClock {
    inner: ManualClock,
    pending: Mutex<Option<(usize, Hook)>>,
}

impl fmt::Debug for HookClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookClock").field("inner", &self.inner).finish()
    }
}

impl HookClock {
    fn arm(&self, after_reads: usize, hook: impl FnOnce() + Send + 'static) {
        *self.pending.lock().unwrap() = Some((after_reads, Box::new(hook)));
    }

    /// Run the hook now if no clock read has triggered it yet.
    fn flush(&self) {
        let hook = self.pending.lock().unwrap().take();
        if let Some((_, hook)) = hook {
            hook();
        }
    }
}

impl Clock for HookClock {
    fn now(&self) -> DateTime<Utc> {
        let hook = {
            let mut pending = self.pending.lock().unwrap();
            let due = match pending.as_mut() {
                Some((0, _)) => true,
                Some((n, _)) => {
                    *n -= 1;
                    false
                }
                None => false,
            };
            if due {
                pending.take().map(|(_, hook)| hook)
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            hook();
        }
        self.inner.now()
    }
}

/// One agent, one task, and a scheduling cycle with `action` injected at the
/// `after_reads`-th clock read. Returns the dispatch events of the cycle.
fn cycle_interrupted_by(
    after_reads: usize,
    action: fn(&SwarmController, AgentId, TaskId),
) -> (Arc<SwarmController>, AgentId, TaskId, Vec<DispatchEvent>) {
    let clock = Arc::new(HookClock::default());
    let c = Arc::new(SwarmController::with_clock(ControllerConfig::default(), clock.clone()).unwrap());
    let agent = c
        .register_agent(NewAgent::new(AgentKind::Cloud, 4, "US-East-1"))
        .unwrap();
    let task = c.submit_task(NewTask::new(3, 0)).unwrap();
    let mut events = c.subscribe();

    let weak = Arc::downgrade(&c);
    clock.arm(after_reads, move || {
        if let Some(c) = weak.upgrade() {
            action(&c, agent, task);
        }
    });
    c.run_scheduling_cycle();
    clock.flush();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    (c, agent, task, seen)
}

fn active_assignments(c: &SwarmController) -> usize {
    c.get_status().assignments.iter().filter(|a| a.is_active()).count()
}

#[test]
fn test_cancel_during_scheduling_never_leaks_an_assignment() {
    for after_reads in 0..8 {
        let (c, agent, task, events) = cycle_interrupted_by(after_reads, |c, _, task| {
            c.cancel_task(&task).unwrap();
        });

        assert_eq!(c.get_task(&task).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(c.get_agent(&agent).unwrap().load_used, 0, "read {}", after_reads);
        assert_eq!(active_assignments(&c), 0, "read {}", after_reads);

        // An agent that was told about the task is also told to abort it.
        for event in &events {
            if let DispatchEvent::Assigned { assignment_id, .. } = event {
                assert!(events.iter().any(|e| matches!(
                    e,
                    DispatchEvent::Aborted { assignment_id: aborted, .. } if aborted == assignment_id
                )));
            }
        }
    }
}

#[test]
fn test_forced_removal_during_scheduling_never_binds_work() {
    for after_reads in 0..8 {
        let (c, agent, task, _) = cycle_interrupted_by(after_reads, |c, agent, _| {
            c.deregister_agent(&agent, true).unwrap();
        });

        let removed = c.get_agent(&agent).unwrap();
        assert_eq!(removed.status, AgentStatus::Removed);
        assert_eq!(removed.load_used, 0, "read {}", after_reads);
        assert_eq!(active_assignments(&c), 0, "read {}", after_reads);
        assert_eq!(c.get_task(&task).unwrap().status, TaskStatus::Pending);
    }
}

#[test]
fn test_withdrawn_assignment_does_not_use_an_attempt() {
    // Fires on the read taken just before the task is bound.
    let (c, _, task, events) = cycle_interrupted_by(0, |c, agent, _| {
        c.deregister_agent(&agent, true).unwrap();
    });

    let task = c.get_task(&task).unwrap();
    assert_eq!(task.attempts, 0);
    assert_eq!(task.assigned_agent, None);
    assert!(events.is_empty());
}

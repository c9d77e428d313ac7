use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use proptest::prelude::*;

use swarm_controller::clock::ManualClock;
use swarm_controller::config::ControllerConfig;
use swarm_controller::registry::{AgentKind, AgentStatus, NewAgent};
use swarm_controller::scheduler::{NewTask, TaskStatus};
use swarm_controller::{AgentId, SwarmController, SwarmError};

#[test]
fn test_queue_rejects_work_when_full() {
    let clock = Arc::new(ManualClock::default());
    let config = ControllerConfig::default().with_max_queued_tasks(2);
    let c = SwarmController::with_clock(config, clock).unwrap();

    c.submit_task(NewTask::new(1, 0)).unwrap();
    let second = c.submit_task(NewTask::new(1, 0)).unwrap();
    assert_eq!(
        c.submit_task(NewTask::new(1, 0)),
        Err(SwarmError::QueueFull(2))
    );

    // Finished tasks no longer count against the limit.
    c.cancel_task(&second).unwrap();
    assert!(c.submit_task(NewTask::new(1, 0)).is_ok());
}

#[test]
fn test_concurrent_submissions_stop_at_the_limit() {
    let config = ControllerConfig::default().with_max_queued_tasks(20);
    let c = Arc::new(SwarmController::new(config).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let c = c.clone();
            std::thread::spawn(move || {
                (0..10)
                    .map(|_| c.submit_task(NewTask::new(1, 0)))
                    .filter(|r| {
                        assert!(matches!(r, Ok(_) | Err(SwarmError::QueueFull(20))));
                        r.is_ok()
                    })
                    .count()
            })
        })
        .collect();
    let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(accepted, 20);
    assert_eq!(c.get_status().tasks.len(), 20);
}

#[test]
fn test_zero_unit_task_is_rejected() {
    let c = SwarmController::new(ControllerConfig::default()).unwrap();
    assert!(matches!(
        c.submit_task(NewTask::new(0, 0)),
        Err(SwarmError::InvalidTask(_))
    ));
    assert!(matches!(
        c.register_agent(NewAgent::new(AgentKind::Cloud, 0, "US-East-1")),
        Err(SwarmError::InvalidAgent(_))
    ));
}

#[test]
fn test_finished_records_are_purged_after_retention() {
    let clock = Arc::new(ManualClock::default());
    let config = ControllerConfig {
        heartbeat_timeout_ms: 600_000,
        progress_timeout_ms: 600_000,
        finished_retention_ms: Some(1_000),
        ..ControllerConfig::default()
    };
    let c = SwarmController::with_clock(config, clock.clone()).unwrap();
    c.register_agent(NewAgent::new(AgentKind::Cloud, 4, "US-East-1"))
        .unwrap();
    let done = c.submit_task(NewTask::new(1, 0)).unwrap();
    let assignment = c.run_scheduling_cycle().remove(0);
    c.complete_assignment(&assignment.id).unwrap();
    let waiting = c.submit_task(NewTask::new(8, 0)).unwrap();

    clock.advance(Duration::milliseconds(500));
    let report = c.run_sweep();
    assert_eq!(report.purged_tasks, 0);

    clock.advance(Duration::milliseconds(600));
    let report = c.run_sweep();
    assert_eq!(report.purged_tasks, 1);
    assert_eq!(report.purged_assignments, 1);
    assert!(matches!(c.get_task(&done), Err(SwarmError::UnknownTask(_))));
    assert_eq!(c.get_task(&waiting).unwrap().status, TaskStatus::Pending);
}

#[test]
fn test_concurrent_submissions_never_overcommit() {
    let c = Arc::new(SwarmController::new(ControllerConfig::default()).unwrap());
    let agents: Vec<AgentId> = (0..4)
        .map(|_| {
            c.register_agent(NewAgent::new(AgentKind::Cloud, 8, "US-East-1"))
                .unwrap()
        })
        .collect();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let c = c.clone();
            std::thread::spawn(move || {
                for units in [1, 2, 3] {
                    c.submit_task(NewTask::new(units, 0)).unwrap();
                    c.run_scheduling_cycle();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let status = c.get_status();
    for id in &agents {
        let agent = c.get_agent(id).unwrap();
        assert!(agent.load_used <= agent.capacity);
        let assigned: u32 = status
            .assignments
            .iter()
            .filter(|a| a.is_active() && a.agent_id == *id)
            .map(|a| a.units)
            .sum();
        assert_eq!(assigned, agent.load_used);
    }
}

#[derive(Debug, Clone)]
enum Op {
    Register(u32),
    Submit(u32, i32),
    Schedule,
    Complete(usize),
    Fail(usize),
    Deregister(usize, bool),
    Tick(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..=16).prop_map(Op::Register),
        (1u32..=8, -2i32..=5).prop_map(|(u, p)| Op::Submit(u, p)),
        Just(Op::Schedule),
        any::<usize>().prop_map(Op::Complete),
        any::<usize>().prop_map(Op::Fail),
        (any::<usize>(), any::<bool>()).prop_map(|(i, f)| Op::Deregister(i, f)),
        (0i64..40_000).prop_map(Op::Tick),
    ]
}

fn check_load_invariants(c: &SwarmController) -> Result<(), TestCaseError> {
    let status = c.get_status();
    let mut committed: HashMap<AgentId, u32> = HashMap::new();
    for a in status.assignments.iter().filter(|a| a.is_active()) {
        *committed.entry(a.agent_id).or_default() += a.units;
    }
    for agent in &status.agents {
        prop_assert!(agent.load_used <= agent.capacity);
        prop_assert_eq!(committed.get(&agent.id).copied().unwrap_or(0), agent.load_used);
        if agent.status == AgentStatus::Removed {
            prop_assert_eq!(agent.load_used, 0);
        }
    }
    for task in &status.tasks {
        let active = status
            .assignments
            .iter()
            .filter(|a| a.is_active() && a.task_id == task.id)
            .count();
        let expected = usize::from(matches!(task.status, TaskStatus::Assigned | TaskStatus::Running));
        prop_assert_eq!(active, expected);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_load_stays_within_capacity(ops in prop::collection::vec(op(), 1..60)) {
        let clock = Arc::new(ManualClock::default());
        let c = SwarmController::with_clock(ControllerConfig::default(), clock.clone()).unwrap();
        let mut agents: Vec<AgentId> = Vec::new();

        for op in ops {
            match op {
                Op::Register(capacity) => {
                    agents.push(
                        c.register_agent(NewAgent::new(AgentKind::Cloud, capacity, "US-East-1"))
                            .unwrap(),
                    );
                }
                Op::Submit(units, priority) => {
                    c.submit_task(NewTask::new(units, priority)).unwrap();
                }
                Op::Schedule => {
                    c.run_scheduling_cycle();
                }
                Op::Complete(i) | Op::Fail(i) if !agents.is_empty() => {
                    let agent = agents[i % agents.len()];
                    if let Ok(active) = c.assignments_for_agent(&agent) {
                        if let Some(a) = active.first() {
                            if matches!(op, Op::Complete(_)) {
                                c.complete_assignment(&a.id).unwrap();
                            } else {
                                c.fail_assignment(&a.id, "injected").unwrap();
                            }
                        }
                    }
                }
                Op::Deregister(i, force) if !agents.is_empty() => {
                    let agent = agents[i % agents.len()];
                    let _ = c.deregister_agent(&agent, force);
                }
                Op::Tick(ms) => {
                    clock.advance(Duration::milliseconds(ms));
                    for agent in &agents {
                        let _ = c.heartbeat(agent, None);
                    }
                    c.run_sweep();
                }
                _ => {}
            }
            check_load_invariants(&c)?;
        }
    }
}

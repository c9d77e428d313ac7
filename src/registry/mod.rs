//! Agent registry: who is out there, how much they can take, and whether
//! they are still alive.
//!
//! Each agent lives in its own [`DashMap`] slot. Status changes take the
//! slot's write lock; load reservations and releases only need a shared
//! lock and update the load counter with a compare-and-swap loop, so the
//! scheduler and progress reports never serialize on a registry-wide lock.

pub mod agent;

use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::Clock;
use crate::error::{Result, SwarmError};
use crate::types::AgentId;

pub use agent::{Agent, AgentKind, AgentStatus, NewAgent};
use agent::AgentEntry;

/// Agents whose status changed during a sweep.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RegistrySweep {
    pub unreachable: Vec<AgentId>,
    pub removed: Vec<AgentId>,
}

#[derive(Debug)]
pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentEntry>,
    next_generation: AtomicU64,
    heartbeat_timeout: Duration,
    unreachable_grace: Duration,
    clock: Arc<dyn Clock>,
}

impl AgentRegistry {
    pub fn new(heartbeat_timeout: Duration, unreachable_grace: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            agents: DashMap::new(),
            next_generation: AtomicU64::new(1),
            heartbeat_timeout,
            unreachable_grace,
            clock,
        }
    }

    /// Register an agent as Online with no load. A `Removed` registration
    /// under the same id is replaced, which is how agents reconnect.
    pub fn register(&self, request: NewAgent) -> Result<AgentId> {
        if request.capacity == 0 {
            return Err(SwarmError::InvalidAgent(
                "capacity must be greater than zero".to_string(),
            ));
        }
        let id = request.id.unwrap_or_default();
        let now = self.clock.now();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        match self.agents.entry(id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().status != AgentStatus::Removed {
                    return Err(SwarmError::DuplicateAgent(id));
                }
                occupied.insert(AgentEntry::new(id, request, generation, now));
                tracing::info!(agent_id = %id, generation, "Agent re-registered");
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(AgentEntry::new(id, request, generation, now));
                tracing::info!(
                    agent_id = %id,
                    kind = %entry.kind,
                    capacity = entry.capacity,
                    location = %entry.location,
                    "Agent registered"
                );
            }
        }
        Ok(id)
    }

    /// Record a heartbeat. Brings an Unreachable agent back Online.
    pub fn heartbeat(&self, id: &AgentId, reported_load: Option<u32>) -> Result<AgentStatus> {
        let now = self.clock.now();
        let mut entry = self
            .agents
            .get_mut(id)
            .filter(|e| e.status != AgentStatus::Removed)
            .ok_or(SwarmError::UnknownAgent(*id))?;

        entry.last_heartbeat_at = now;
        if let Some(reported) = reported_load {
            let tracked = entry.load();
            if reported != tracked {
                tracing::debug!(agent_id = %id, reported, tracked, "Reported load differs from tracked load");
            }
            entry.reported_load = Some(reported);
        }
        if entry.status == AgentStatus::Unreachable {
            entry.set_status(AgentStatus::Online, now)?;
            tracing::info!(agent_id = %id, "Agent reachable again");
        }
        Ok(entry.status)
    }

    /// Take an agent out of scheduling. Graceful deregistration drains first
    /// and completes once the agent's load reaches zero; forced removal is
    /// immediate and leaves cleanup of its assignments to the caller.
    pub fn deregister(&self, id: &AgentId, force: bool) -> Result<AgentStatus> {
        let now = self.clock.now();
        let mut entry = self
            .agents
            .get_mut(id)
            .filter(|e| e.status != AgentStatus::Removed)
            .ok_or(SwarmError::UnknownAgent(*id))?;

        let target = if force || entry.load() == 0 {
            AgentStatus::Removed
        } else {
            AgentStatus::Draining
        };
        if entry.status != target {
            entry.set_status(target, now)?;
        }
        tracing::info!(agent_id = %id, status = %entry.status, force, "Agent deregistered");
        Ok(entry.status)
    }

    /// Online agents with at least `required_units` spare, best candidate first:
    /// locality match, then most spare capacity, then lowest id.
    pub fn list_eligible(&self, required_units: u32, preferred_location: Option<&str>) -> Vec<Agent> {
        let mut eligible: Vec<Agent> = self
            .agents
            .iter()
            .filter(|e| e.status == AgentStatus::Online)
            .map(|e| e.snapshot())
            .filter(|a| a.spare() >= required_units)
            .collect();

        eligible.sort_by_key(|a| {
            (
                Reverse(a.matches_location(preferred_location)),
                Reverse(a.spare()),
                a.id,
            )
        });
        eligible
    }

    /// Commit `units` of an Online agent's capacity. `generation` must name
    /// the current registration. Returns the new load.
    pub fn reserve(&self, id: &AgentId, generation: u64, units: u32) -> Result<u32> {
        let entry = self
            .agents
            .get(id)
            .filter(|e| e.status != AgentStatus::Removed)
            .ok_or(SwarmError::UnknownAgent(*id))?;
        if entry.generation != generation {
            return Err(stale_registration(id));
        }

        if entry.status != AgentStatus::Online {
            return Err(SwarmError::CapacityExceeded {
                agent_id: *id,
                requested: units,
                available: 0,
            });
        }

        entry
            .try_reserve(units)
            .map_err(|current| SwarmError::CapacityExceeded {
                agent_id: *id,
                requested: units,
                available: entry.capacity.saturating_sub(current),
            })
    }

    /// Return `units` reserved under `generation`. Units of an earlier
    /// registration are not taken from its replacement. A draining agent
    /// that becomes idle is removed.
    pub fn release(&self, id: &AgentId, generation: u64, units: u32) -> Result<u32> {
        let remaining = {
            let entry = self.agents.get(id).ok_or(SwarmError::UnknownAgent(*id))?;
            if entry.generation != generation {
                return Err(stale_registration(id));
            }
            entry.release(units)
        };

        if remaining == 0 {
            let now = self.clock.now();
            if let Some(mut entry) = self.agents.get_mut(id) {
                if entry.generation == generation
                    && entry.status == AgentStatus::Draining
                    && entry.load() == 0
                {
                    entry.set_status(AgentStatus::Removed, now)?;
                    tracing::info!(agent_id = %id, "Drained agent removed");
                }
            }
        }
        Ok(remaining)
    }

    /// Mark silent agents Unreachable, and remove agents that have been
    /// unreachable past the grace period once they hold no load.
    pub fn sweep(&self, now: DateTime<Utc>) -> RegistrySweep {
        let mut report = RegistrySweep::default();

        for mut entry in self.agents.iter_mut() {
            let id = entry.id;
            let status = entry.status;
            match status {
                AgentStatus::Online if now - entry.last_heartbeat_at > self.heartbeat_timeout => {
                    if entry.set_status(AgentStatus::Unreachable, now).is_ok() {
                        tracing::warn!(
                            agent_id = %id,
                            last_heartbeat_at = %entry.last_heartbeat_at,
                            "Agent missed heartbeats, marking unreachable"
                        );
                        report.unreachable.push(id);
                    }
                }
                AgentStatus::Unreachable
                    if entry.load() == 0
                        && now - entry.status_changed_at > self.unreachable_grace =>
                {
                    if entry.set_status(AgentStatus::Removed, now).is_ok() {
                        tracing::info!(agent_id = %id, "Unreachable agent removed after grace period");
                        report.removed.push(id);
                    }
                }
                AgentStatus::Draining if entry.load() == 0 => {
                    if entry.set_status(AgentStatus::Removed, now).is_ok() {
                        tracing::info!(agent_id = %id, "Drained agent removed");
                        report.removed.push(id);
                    }
                }
                _ => {}
            }
        }
        report
    }

    /// True while the registration `generation` of `id` has not been removed
    /// or replaced.
    pub fn is_current(&self, id: &AgentId, generation: u64) -> bool {
        self.agents
            .get(id)
            .is_some_and(|e| e.generation == generation && e.status != AgentStatus::Removed)
    }

    pub fn get(&self, id: &AgentId) -> Option<Agent> {
        self.agents.get(id).map(|e| e.snapshot())
    }

    /// All agents, ordered by registration time then id.
    pub fn snapshot(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.iter().map(|e| e.snapshot()).collect();
        agents.sort_by_key(|a| (a.registered_at, a.id));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

fn stale_registration(id: &AgentId) -> SwarmError {
    SwarmError::InvalidState(format!("agent {} has re-registered since the reservation", id))
}

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};
use crate::types::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Cloud,
    Browser,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Cloud => write!(f, "cloud"),
            AgentKind::Browser => write!(f, "browser"),
        }
    }
}

impl std::str::FromStr for AgentKind {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cloud" => Ok(AgentKind::Cloud),
            "browser" => Ok(AgentKind::Browser),
            other => Err(SwarmError::InvalidAgent(format!("unknown agent kind '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Draining,
    Unreachable,
    Removed,
}

impl AgentStatus {
    /// Validate a status change. `Removed` is terminal and `Draining` can only
    /// finish by being removed.
    pub fn transition(self, to: AgentStatus) -> Result<AgentStatus> {
        use AgentStatus::*;
        match (self, to) {
            (Online, Draining) | (Online, Unreachable) | (Online, Removed) => Ok(to),
            (Unreachable, Online) | (Unreachable, Draining) | (Unreachable, Removed) => Ok(to),
            (Draining, Removed) => Ok(to),
            (Online, Online)
            | (Unreachable, Unreachable)
            | (Draining, Online)
            | (Draining, Draining)
            | (Draining, Unreachable)
            | (Removed, _) => Err(SwarmError::InvalidState(format!(
                "agent cannot move from {} to {}",
                self, to
            ))),
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "online"),
            AgentStatus::Draining => write!(f, "draining"),
            AgentStatus::Unreachable => write!(f, "unreachable"),
            AgentStatus::Removed => write!(f, "removed"),
        }
    }
}

/// Registration request for a new or reconnecting agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgent {
    /// Reuse a previous identity after reconnecting; a fresh id is minted if absent.
    #[serde(default)]
    pub id: Option<AgentId>,
    pub kind: AgentKind,
    pub capacity: u32,
    pub location: String,
}

impl NewAgent {
    pub fn new(kind: AgentKind, capacity: u32, location: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            capacity,
            location: location.into(),
        }
    }

    pub fn with_id(mut self, id: AgentId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Read-only copy of an agent's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub kind: AgentKind,
    pub capacity: u32,
    pub load_used: u32,
    pub reported_load: Option<u32>,
    pub location: String,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    /// Distinguishes successive registrations under the same id.
    pub generation: u64,
}

impl Agent {
    pub fn spare(&self) -> u32 {
        self.capacity.saturating_sub(self.load_used)
    }

    pub fn matches_location(&self, preferred: Option<&str>) -> bool {
        preferred.is_some_and(|loc| loc == self.location)
    }
}

/// Registry-internal record. Load is atomic so reservations from the
/// scheduler and releases from the tracker only need a shared shard lock.
#[derive(Debug)]
pub(crate) struct AgentEntry {
    pub id: AgentId,
    pub kind: AgentKind,
    pub capacity: u32,
    pub load_used: AtomicU32,
    pub reported_load: Option<u32>,
    pub location: String,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    pub generation: u64,
}

impl AgentEntry {
    pub fn new(id: AgentId, request: NewAgent, generation: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: request.kind,
            capacity: request.capacity,
            load_used: AtomicU32::new(0),
            reported_load: None,
            location: request.location,
            status: AgentStatus::Online,
            registered_at: now,
            last_heartbeat_at: now,
            status_changed_at: now,
            generation,
        }
    }

    pub fn load(&self) -> u32 {
        self.load_used.load(Ordering::SeqCst)
    }

    pub fn set_status(&mut self, to: AgentStatus, now: DateTime<Utc>) -> Result<()> {
        self.status = self.status.transition(to)?;
        self.status_changed_at = now;
        Ok(())
    }

    /// Atomically add `units` to the load if it stays within capacity.
    /// Returns the new load, or the load observed when the check failed.
    pub fn try_reserve(&self, units: u32) -> std::result::Result<u32, u32> {
        let capacity = self.capacity;
        self.load_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current
                    .checked_add(units)
                    .filter(|next| *next <= capacity)
            })
            .map(|prev| prev.saturating_add(units))
    }

    /// Atomically subtract `units`, never going below zero. Returns the new load.
    pub fn release(&self, units: u32) -> u32 {
        let prev = self
            .load_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(units))
            })
            .unwrap_or_else(|current| current);
        if prev < units {
            tracing::warn!(
                agent_id = %self.id,
                load = prev,
                units,
                "Released more units than reserved; load clamped to zero"
            );
        }
        prev.saturating_sub(units)
    }

    pub fn snapshot(&self) -> Agent {
        Agent {
            id: self.id,
            kind: self.kind,
            capacity: self.capacity,
            load_used: self.load(),
            reported_load: self.reported_load,
            location: self.location.clone(),
            status: self.status,
            registered_at: self.registered_at,
            last_heartbeat_at: self.last_heartbeat_at,
            status_changed_at: self.status_changed_at,
            generation: self.generation,
        }
    }
}

pub mod clock;
pub mod config;
pub mod controller;
pub mod dashboard;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod tracker;
pub mod types;

pub use controller::{StatusSnapshot, SwarmController, SwarmSummary, SweepReport};
pub use error::{Result, SwarmError};
pub use types::{AgentId, AssignmentId, TaskId};

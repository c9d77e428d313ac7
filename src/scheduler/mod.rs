pub mod assigner;
pub mod queue;
pub mod task;

pub use assigner::Scheduler;
pub use queue::TaskQueue;
pub use task::{NewTask, Task, TaskStatus};

//! Domain model (IDs, tasks, status, outcomes, decisions).

pub mod decision;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider};
pub use ids::{TaskId, TaskType};
pub use outcome::{ErrorKind, Outcome, Payload, TaskFailure, TaskResult};
pub use state::TaskStatus;
pub use task::{Callback, Task};

//! Queue module: priority work queue, retry policy and retry scheduler.

mod retry;
mod scheduler;
mod work;

pub use retry::RetryPolicy;
pub use scheduler::RetryScheduler;
pub use work::{QueueEntry, WorkQueue};

//! Priority-weighted request scheduler
//!
//! Requests are partitioned by [`Route`]; each route is served by its own pool of
//! consumers, bounding concurrency per backend class. Within the queues, four
//! priority levels are served strictly from highest to lowest while waiting
//! `Normal` and `Low` tasks age and get promoted, so low-priority work always
//! makes progress.

mod error;
mod priority;
mod queue;
mod scheduler;

pub use error::SchedulerError;
pub use priority::{Priority, Route, WeightConfig};
pub use queue::TaskId;
pub use scheduler::{Completion, Executor, NetworkRequest, RequestScheduler};

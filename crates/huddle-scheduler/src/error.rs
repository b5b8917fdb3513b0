use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The task was cancelled while queued or in flight
    #[error("Operation canceled")]
    Cancelled,

    /// The scheduler was shut down before the task ran
    #[error("Scheduler shut down")]
    Shutdown,
}

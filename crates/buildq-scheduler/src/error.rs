//! Errors returned by the long-lived components.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool already started")]
    AlreadyStarted,

    #[error("broker error: {0}")]
    Broker(#[from] buildq_core::Error),

    #[error("in-flight jobs did not finish within {0:?}")]
    DrainTimeout(Duration),

    #[error("supervisor task failed: {0}")]
    Supervisor(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("failed to reach broker: {0}")]
    Connect(#[source] buildq_core::Error),

    #[error("scheduler task failed: {0}")]
    Task(String),

    #[error("failed to release leadership: {0}")]
    Release(#[source] buildq_core::Error),
}

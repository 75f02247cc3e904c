//! Job coordination for buildq.
//!
//! Consumes build jobs from the broker with an elastic pool of workers,
//! promotes delayed jobs to their queues, retries failed attempts and
//! reports builds that exhausted their attempts to the Build-Status API.

pub mod error;
pub mod events;
pub mod jobs;
pub mod memory;
pub mod notifier;
pub mod pool;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod status_api;
pub mod store;
pub mod worker;

pub use error::{PoolError, SchedulerError};
pub use events::{EventSink, ScaleVerb, SchedulerEvent, WorkerEvent};
pub use jobs::{Attempt, JobDefinition, JobRegistry, Perform, PerformOutcome, StartBuild, StopBuild};
pub use notifier::{FailureContext, FailureNotifier, NotifyError};
pub use pool::{PoolConfig, WorkerPool};
pub use retry::{AttemptOutcome, RetryDecision, RetryPolicy, Retrying};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use shutdown::{Lifecycle, ShutdownCoordinator, ShutdownError, ShutdownOutcome, ShutdownState};
pub use status_api::HttpStatusApi;
pub use store::BuildConfigStore;
pub use worker::Worker;

//! Durable queue broker abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{FailedJob, Job, Result};

/// A worker as advertised in the broker's registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistration {
    pub id: String,
    pub hostname: String,
    pub pid: u32,
    pub queues: Vec<String>,
    pub heartbeat_at: DateTime<Utc>,
}

/// Queue operations the coordinator needs from its broker.
///
/// Implementations must make `claim` and `pop_delayed` atomic: a job handed
/// to one caller is never handed to another.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Append a job to the tail of `job.queue`.
    async fn enqueue(&self, job: &Job) -> Result<()>;

    /// Store a job to be moved onto `job.queue` once `at` has passed.
    async fn enqueue_at(&self, at: DateTime<Utc>, job: &Job) -> Result<()>;

    /// Claim and remove the job at the head of `queue`.
    async fn claim(&self, queue: &str) -> Result<Option<Job>>;

    /// Earliest delayed timestamp (unix seconds) that is due at `now`.
    async fn next_delayed_timestamp(&self, now: DateTime<Utc>) -> Result<Option<i64>>;

    /// Remove one job scheduled at `timestamp`, dropping the timestamp once
    /// it has no jobs left.
    async fn pop_delayed(&self, timestamp: i64) -> Result<Option<Job>>;

    /// Take or renew the scheduler leader lock for `instance`.
    async fn acquire_leadership(&self, instance: &str, ttl: Duration) -> Result<bool>;

    /// Give up the leader lock if `instance` holds it.
    async fn release_leadership(&self, instance: &str) -> Result<()>;

    /// Add or refresh a worker registration.
    async fn register_worker(&self, registration: &WorkerRegistration) -> Result<()>;

    async fn unregister_worker(&self, worker_id: &str) -> Result<()>;

    async fn registered_workers(&self) -> Result<Vec<WorkerRegistration>>;

    /// Keep a terminally failed job for inspection.
    async fn record_failure(&self, failure: &FailedJob) -> Result<()>;
}

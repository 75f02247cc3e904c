//! Job broker backed by redis lists and sorted sets.

use async_trait::async_trait;
use buildq_core::{Broker, Error, FailedJob, Job, Result, WorkerRegistration};
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{Keys, broker_error};

/// Pops one job for a timestamp and drops the timestamp once drained.
const POP_DELAYED_SCRIPT: &str = r#"
local item = redis.call('LPOP', KEYS[1])
if redis.call('LLEN', KEYS[1]) == 0 then
    redis.call('DEL', KEYS[1])
    redis.call('ZREM', KEYS[2], ARGV[1])
end
return item
"#;

/// Takes the lock when free, renews it when already held by the caller.
const ACQUIRE_LOCK_SCRIPT: &str = r#"
local holder = redis.call('GET', KEYS[1])
if holder == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
if not holder then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
return 0
"#;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Broker backed by redis.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    keys: Keys,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_keys(conn, Keys::default())
    }

    pub fn with_keys(conn: ConnectionManager, keys: Keys) -> Self {
        Self { conn, keys }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn enqueue(&self, job: &Job) -> Result<()> {
        let payload = job.to_json()?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(self.keys.queues())
            .arg(&job.queue)
            .ignore()
            .cmd("RPUSH")
            .arg(self.keys.queue(&job.queue))
            .arg(payload)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;
        debug!(queue = %job.queue, job = %job, "Enqueued job");
        Ok(())
    }

    async fn enqueue_at(&self, at: DateTime<Utc>, job: &Job) -> Result<()> {
        let timestamp = at.timestamp();
        let payload = job.to_json()?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(self.keys.delayed(timestamp))
            .arg(payload)
            .ignore()
            .cmd("ZADD")
            .arg(self.keys.delayed_schedule())
            .arg(timestamp)
            .arg(timestamp)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;
        debug!(queue = %job.queue, job = %job, timestamp, "Scheduled job");
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("LPOP")
            .arg(self.keys.queue(queue))
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;
        raw.map(|raw| Job::from_json(&raw)).transpose()
    }

    async fn next_delayed_timestamp(&self, now: DateTime<Utc>) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.delayed_schedule())
            .arg("-inf")
            .arg(now.timestamp())
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;

        due.first()
            .map(|raw| {
                raw.parse::<i64>()
                    .map_err(|_| Error::Broker(format!("malformed delayed timestamp: {}", raw)))
            })
            .transpose()
    }

    async fn pop_delayed(&self, timestamp: i64) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = Script::new(POP_DELAYED_SCRIPT)
            .key(self.keys.delayed(timestamp))
            .key(self.keys.delayed_schedule())
            .arg(timestamp)
            .invoke_async(&mut conn)
            .await
            .map_err(broker_error)?;
        raw.map(|raw| Job::from_json(&raw)).transpose()
    }

    async fn acquire_leadership(&self, instance: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: i64 = Script::new(ACQUIRE_LOCK_SCRIPT)
            .key(self.keys.leader_lock())
            .arg(instance)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(broker_error)?;
        Ok(acquired == 1)
    }

    async fn release_leadership(&self, instance: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let released: i64 = Script::new(RELEASE_LOCK_SCRIPT)
            .key(self.keys.leader_lock())
            .arg(instance)
            .invoke_async(&mut conn)
            .await
            .map_err(broker_error)?;
        if released == 0 {
            debug!(instance, "Leader lock was not held at release");
        }
        Ok(())
    }

    async fn register_worker(&self, registration: &WorkerRegistration) -> Result<()> {
        let payload = serde_json::to_string(registration)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(self.keys.workers())
            .arg(&registration.id)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HDEL")
            .arg(self.keys.workers())
            .arg(worker_id)
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn registered_workers(&self) -> Result<Vec<WorkerRegistration>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(self.keys.workers())
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;

        let mut workers = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<WorkerRegistration>(&entry) {
                Ok(worker) => workers.push(worker),
                Err(e) => warn!(error = %e, "Skipping unreadable worker registration"),
            }
        }
        Ok(workers)
    }

    async fn record_failure(&self, failure: &FailedJob) -> Result<()> {
        let payload = serde_json::to_string(failure)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(self.keys.failed())
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;
        Ok(())
    }
}

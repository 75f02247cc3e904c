//! In-process broker and store.
//!
//! Same observable behavior as the Redis implementations, without a
//! server. Useful for tests and for running a single node locally.

use async_trait::async_trait;
use buildq_core::{Broker, FailedJob, Job, KvStore, Result, WorkerRegistration};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Job>>,
    delayed: BTreeMap<i64, VecDeque<Job>>,
    leader: Option<(String, Instant)>,
    workers: HashMap<String, WorkerRegistration>,
    failed: Vec<FailedJob>,
}

/// Broker holding every queue in memory.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs currently waiting on a queue, in claim order.
    pub async fn queued(&self, queue: &str) -> Vec<Job> {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|jobs| jobs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delayed jobs with their due timestamp, earliest first.
    pub async fn delayed(&self) -> Vec<(i64, Job)> {
        let state = self.state.lock().await;
        state
            .delayed
            .iter()
            .flat_map(|(ts, jobs)| jobs.iter().map(move |job| (*ts, job.clone())))
            .collect()
    }

    pub async fn failures(&self) -> Vec<FailedJob> {
        self.state.lock().await.failed.clone()
    }

    pub async fn leader(&self) -> Option<String> {
        let state = self.state.lock().await;
        state
            .leader
            .as_ref()
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn enqueue(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .queues
            .entry(job.queue.clone())
            .or_default()
            .push_back(job.clone());
        Ok(())
    }

    async fn enqueue_at(&self, at: DateTime<Utc>, job: &Job) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .delayed
            .entry(at.timestamp())
            .or_default()
            .push_back(job.clone());
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        Ok(state.queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    async fn next_delayed_timestamp(&self, now: DateTime<Utc>) -> Result<Option<i64>> {
        let state = self.state.lock().await;
        Ok(state
            .delayed
            .keys()
            .next()
            .copied()
            .filter(|ts| *ts <= now.timestamp()))
    }

    async fn pop_delayed(&self, timestamp: i64) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        let Some(jobs) = state.delayed.get_mut(&timestamp) else {
            return Ok(None);
        };
        let job = jobs.pop_front();
        if jobs.is_empty() {
            state.delayed.remove(&timestamp);
        }
        Ok(job)
    }

    async fn acquire_leadership(&self, instance: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let available = match &state.leader {
            Some((holder, expires)) => holder == instance || *expires <= now,
            None => true,
        };
        if available {
            state.leader = Some((instance.to_string(), now + ttl));
        }
        Ok(available)
    }

    async fn release_leadership(&self, instance: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.leader.as_ref().is_some_and(|(holder, _)| holder == instance) {
            state.leader = None;
        }
        Ok(())
    }

    async fn register_worker(&self, registration: &WorkerRegistration) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .workers
            .insert(registration.id.clone(), registration.clone());
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        self.state.lock().await.workers.remove(worker_id);
        Ok(())
    }

    async fn registered_workers(&self) -> Result<Vec<WorkerRegistration>> {
        let state = self.state.lock().await;
        Ok(state.workers.values().cloned().collect())
    }

    async fn record_failure(&self, failure: &FailedJob) -> Result<()> {
        self.state.lock().await.failed.push(failure.clone());
        Ok(())
    }
}

/// Hash-of-fields store kept in memory.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, key: &str, field: &str) -> bool {
        self.entries
            .lock()
            .await
            .contains_key(&(key.to_string(), field.to_string()))
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(&(key.to_string(), field.to_string())).cloned())
    }

    async fn set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert((key.to_string(), field.to_string()), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        Ok(entries
            .remove(&(key.to_string(), field.to_string()))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildq_core::{BuildId, BuildPayload, JobKind};

    fn job(id: u64) -> Job {
        Job::new("builds", JobKind::Start, BuildPayload::new(BuildId::new(id)))
    }

    #[tokio::test]
    async fn test_claim_is_fifo() {
        let broker = InMemoryBroker::new();
        broker.enqueue(&job(1)).await.unwrap();
        broker.enqueue(&job(2)).await.unwrap();

        assert_eq!(broker.claim("builds").await.unwrap(), Some(job(1)));
        assert_eq!(broker.claim("builds").await.unwrap(), Some(job(2)));
        assert_eq!(broker.claim("builds").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delayed_jobs_become_due() {
        let broker = InMemoryBroker::new();
        let now = Utc::now();
        broker
            .enqueue_at(now + chrono::Duration::seconds(60), &job(1))
            .await
            .unwrap();
        assert_eq!(broker.next_delayed_timestamp(now).await.unwrap(), None);

        let later = now + chrono::Duration::seconds(61);
        let ts = broker.next_delayed_timestamp(later).await.unwrap().unwrap();
        assert_eq!(broker.pop_delayed(ts).await.unwrap(), Some(job(1)));
        assert_eq!(broker.pop_delayed(ts).await.unwrap(), None);
        assert!(broker.delayed().await.is_empty());
    }

    #[tokio::test]
    async fn test_leadership_is_exclusive_until_released() {
        let broker = InMemoryBroker::new();
        let ttl = Duration::from_secs(60);

        assert!(broker.acquire_leadership("a", ttl).await.unwrap());
        assert!(!broker.acquire_leadership("b", ttl).await.unwrap());
        assert!(broker.acquire_leadership("a", ttl).await.unwrap());

        broker.release_leadership("b").await.unwrap();
        assert_eq!(broker.leader().await.as_deref(), Some("a"));

        broker.release_leadership("a").await.unwrap();
        assert!(broker.acquire_leadership("b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_kv_delete_reports_removal() {
        let store = InMemoryKvStore::new();
        store.set("k", "1", "v").await.unwrap();
        assert!(store.delete("k", "1").await.unwrap());
        assert!(!store.delete("k", "1").await.unwrap());
    }
}

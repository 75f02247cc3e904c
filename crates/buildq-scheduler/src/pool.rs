//! Elastic pool of workers sharing one process.
//!
//! A supervisor task owns the workers. On every check it measures how
//! late its own timer fired and uses that lag, together with how many
//! workers are busy, to grow or shrink the pool between the configured
//! bounds.

use crate::error::PoolError;
use crate::events::{EventSink, ScaleVerb, WorkerEvent};
use crate::jobs::JobRegistry;
use crate::worker::Worker;
use buildq_config::WorkerSettings;
use buildq_core::{Broker, WorkerRegistration};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub queues: Vec<String>,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub check_interval: Duration,
    pub max_event_loop_delay: Duration,
    /// `None` waits for in-flight jobs indefinitely on shutdown.
    pub drain_timeout: Option<Duration>,
    pub stale_worker_timeout: Duration,
}

impl PoolConfig {
    pub fn from_settings(settings: &WorkerSettings, queues: Vec<String>) -> Self {
        Self {
            queues,
            min_concurrency: settings.min_concurrency,
            max_concurrency: settings.max_concurrency,
            poll_interval: settings.poll_interval(),
            check_interval: settings.check_interval(),
            max_event_loop_delay: settings.max_event_loop_delay(),
            drain_timeout: settings.drain_timeout(),
            stale_worker_timeout: settings.stale_worker_timeout(),
        }
    }
}

/// Resize decision for one supervisor check.
pub fn scale_decision(config: &PoolConfig, active: usize, busy: usize, lag: Duration) -> ScaleVerb {
    let overloaded = lag > config.max_event_loop_delay;
    if overloaded && active > config.min_concurrency {
        ScaleVerb::Remove
    } else if !overloaded && busy >= active && active < config.max_concurrency {
        ScaleVerb::Add
    } else {
        ScaleVerb::Hold
    }
}

struct PoolState {
    shutdown: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
    ended: bool,
}

pub struct WorkerPool {
    config: PoolConfig,
    broker: Arc<dyn Broker>,
    registry: Arc<JobRegistry>,
    events: EventSink<WorkerEvent>,
    hostname: String,
    pid: u32,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        broker: Arc<dyn Broker>,
        registry: Arc<JobRegistry>,
        events: EventSink<WorkerEvent>,
    ) -> Self {
        Self {
            config,
            broker,
            registry,
            events,
            hostname: local_hostname(),
            pid: std::process::id(),
            state: Mutex::new(PoolState {
                shutdown: CancellationToken::new(),
                supervisor: None,
                ended: false,
            }),
        }
    }

    /// Identity of this pool in the worker registry.
    pub fn id(&self) -> String {
        format!("{}:{}", self.hostname, self.pid)
    }

    /// Clean up workers left behind by dead processes, then start the
    /// supervisor with the minimum number of workers.
    pub async fn start(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        if state.supervisor.is_some() || state.ended {
            return Err(PoolError::AlreadyStarted);
        }

        self.clean_stale_workers().await;

        let supervisor = Supervisor {
            config: self.config.clone(),
            broker: self.broker.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            pool_id: self.id(),
            hostname: self.hostname.clone(),
            pid: self.pid,
            shutdown: state.shutdown.clone(),
            workers: Vec::new(),
            next_worker: 0,
        };
        state.supervisor = Some(tokio::spawn(supervisor.run()));

        info!(
            pool_id = %self.id(),
            min = self.config.min_concurrency,
            max = self.config.max_concurrency,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop claiming and wait for in-flight jobs to finish.
    ///
    /// Calling `end` more than once, or before `start`, is a no-op.
    pub async fn end(&self) -> Result<(), PoolError> {
        let supervisor = {
            let mut state = self.state.lock().await;
            if state.ended {
                return Ok(());
            }
            state.ended = true;
            state.shutdown.cancel();
            state.supervisor.take()
        };
        let Some(supervisor) = supervisor else {
            return Ok(());
        };

        info!(pool_id = %self.id(), "Draining worker pool");
        let joined = match self.config.drain_timeout {
            Some(limit) => timeout(limit, supervisor)
                .await
                .map_err(|_| PoolError::DrainTimeout(limit))?,
            None => supervisor.await,
        };
        joined.map_err(|e| PoolError::Supervisor(e.to_string()))?;

        info!(pool_id = %self.id(), "Worker pool ended");
        Ok(())
    }

    async fn clean_stale_workers(&self) {
        let registered = match self.broker.registered_workers().await {
            Ok(registered) => registered,
            Err(e) => {
                self.events
                    .emit(WorkerEvent::InternalError {
                        error: format!("failed to list workers: {}", e),
                    })
                    .await;
                return;
            }
        };

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_worker_timeout)
                .unwrap_or(chrono::Duration::zero());
        for stale in registered.into_iter().filter(|w| w.heartbeat_at < cutoff) {
            match self.broker.unregister_worker(&stale.id).await {
                Ok(()) => {
                    self.events
                        .emit(WorkerEvent::WorkerCleaned {
                            worker_id: self.id(),
                            stale_worker_id: stale.id,
                            pid: stale.pid,
                        })
                        .await
                }
                Err(e) => {
                    self.events
                        .emit(WorkerEvent::InternalError {
                            error: format!("failed to clean worker {}: {}", stale.id, e),
                        })
                        .await
                }
            }
        }
    }
}

struct WorkerSlot {
    id: String,
    token: CancellationToken,
    busy: Arc<AtomicBool>,
    task: JoinHandle<()>,
    retiring: bool,
}

struct Supervisor {
    config: PoolConfig,
    broker: Arc<dyn Broker>,
    registry: Arc<JobRegistry>,
    events: EventSink<WorkerEvent>,
    pool_id: String,
    hostname: String,
    pid: u32,
    shutdown: CancellationToken,
    workers: Vec<WorkerSlot>,
    next_worker: usize,
}

impl Supervisor {
    async fn run(mut self) {
        for _ in 0..self.config.min_concurrency {
            self.spawn_worker().await;
        }

        loop {
            let tick = Instant::now();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(self.config.check_interval) => {}
            }
            let lag = tick.elapsed().saturating_sub(self.config.check_interval);

            self.reap_finished().await;
            self.check(lag).await;
            self.heartbeat().await;
        }

        self.drain().await;
    }

    async fn check(&mut self, lag: Duration) {
        let (active, busy) = self
            .workers
            .iter()
            .filter(|w| !w.retiring)
            .fold((0, 0), |(active, busy), w| {
                (active + 1, busy + usize::from(w.busy.load(Ordering::SeqCst)))
            });
        let verb = scale_decision(&self.config, active, busy, lag);

        match verb {
            ScaleVerb::Add => self.spawn_worker().await,
            ScaleVerb::Remove => self.retire_worker(),
            ScaleVerb::Hold => {}
        }

        self.events
            .emit(WorkerEvent::BackpressureAction {
                verb,
                delay_ms: lag.as_millis() as u64,
            })
            .await;
    }

    async fn spawn_worker(&mut self) {
        self.next_worker += 1;
        let id = format!("{}+{}", self.pool_id, self.next_worker);

        if let Err(e) = self.broker.register_worker(&self.registration(&id)).await {
            self.events
                .emit(WorkerEvent::InternalError {
                    error: format!("failed to register worker {}: {}", id, e),
                })
                .await;
        }

        let worker = Worker::new(
            id.clone(),
            self.config.queues.clone(),
            self.config.poll_interval,
            self.broker.clone(),
            self.registry.clone(),
            self.events.clone(),
        );
        let busy = worker.busy_flag();
        let token = self.shutdown.child_token();
        let task = tokio::spawn({
            let token = token.clone();
            async move { worker.run(token).await }
        });

        debug!(worker_id = %id, "Spawned worker");
        self.workers.push(WorkerSlot {
            id,
            token,
            busy,
            task,
            retiring: false,
        });
    }

    /// Ask one worker to stop after its current job, preferring idle ones.
    fn retire_worker(&mut self) {
        let candidate = self
            .workers
            .iter_mut()
            .filter(|w| !w.retiring)
            .min_by_key(|w| w.busy.load(Ordering::SeqCst));
        if let Some(slot) = candidate {
            debug!(worker_id = %slot.id, "Retiring worker");
            slot.retiring = true;
            slot.token.cancel();
        }
    }

    async fn reap_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition(|w| w.task.is_finished());
        self.workers = running;

        for slot in finished {
            if let Err(e) = slot.task.await {
                warn!(worker_id = %slot.id, error = %e, "Worker task failed");
            }
            self.unregister(&slot.id).await;
        }
    }

    async fn heartbeat(&self) {
        for slot in self.workers.iter().filter(|w| !w.retiring) {
            if let Err(e) = self.broker.register_worker(&self.registration(&slot.id)).await {
                warn!(worker_id = %slot.id, error = %e, "Failed to refresh worker heartbeat");
            }
        }
    }

    async fn drain(&mut self) {
        for slot in std::mem::take(&mut self.workers) {
            slot.token.cancel();
            if let Err(e) = slot.task.await {
                warn!(worker_id = %slot.id, error = %e, "Worker task failed");
            }
            self.unregister(&slot.id).await;
        }
    }

    async fn unregister(&self, worker_id: &str) {
        if let Err(e) = self.broker.unregister_worker(worker_id).await {
            warn!(worker_id = %worker_id, error = %e, "Failed to unregister worker");
        }
    }

    fn registration(&self, worker_id: &str) -> WorkerRegistration {
        WorkerRegistration {
            id: worker_id.to_string(),
            hostname: self.hostname.clone(),
            pid: self.pid,
            queues: self.config.queues.clone(),
            heartbeat_at: Utc::now(),
        }
    }
}

/// Host part of the pool id. An unreadable hostname gets a random name so
/// that two such hosts never share worker ids.
fn local_hostname() -> String {
    match hostname::get().map(|h| h.into_string()) {
        Ok(Ok(name)) if !name.is_empty() => name,
        other => {
            let fallback = format!("unknown-{}", Uuid::new_v4().simple());
            warn!(result = ?other, hostname = %fallback, "Could not read hostname");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::jobs::tests::RecordingExecutor;
    use crate::jobs::{Attempt, JobDefinition, Perform, PerformOutcome};
    use crate::memory::{InMemoryBroker, InMemoryKvStore};
    use crate::retry::RetryPolicy;
    use crate::store::BuildConfigStore;
    use async_trait::async_trait;
    use buildq_core::{BuildConfig, BuildId, BuildPayload, Job, JobKind, Result};
    use tokio::sync::mpsc;

    fn config() -> PoolConfig {
        PoolConfig {
            queues: vec!["builds".to_string()],
            min_concurrency: 1,
            max_concurrency: 3,
            poll_interval: Duration::from_millis(10),
            check_interval: Duration::from_millis(20),
            max_event_loop_delay: Duration::from_millis(10),
            drain_timeout: Some(Duration::from_secs(5)),
            stale_worker_timeout: Duration::from_secs(60),
        }
    }

    fn start_job(id: u64) -> Job {
        Job::new("builds", JobKind::Start, BuildPayload::new(BuildId::new(id)))
    }

    fn collect(rx: &mut mpsc::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Perform that takes a while, to observe draining.
    struct Slow(Duration);

    #[async_trait]
    impl Perform for Slow {
        async fn perform(&self, _payload: &BuildPayload, _attempt: Attempt) -> Result<PerformOutcome> {
            sleep(self.0).await;
            Ok(PerformOutcome::Skipped {
                reason: "slow".to_string(),
            })
        }
    }

    #[test]
    fn test_scale_decision() {
        let config = config();
        let calm = Duration::ZERO;
        let late = Duration::from_millis(50);

        assert_eq!(scale_decision(&config, 1, 1, calm), ScaleVerb::Add);
        assert_eq!(scale_decision(&config, 2, 1, calm), ScaleVerb::Hold);
        assert_eq!(scale_decision(&config, 3, 3, calm), ScaleVerb::Hold);
        assert_eq!(scale_decision(&config, 2, 2, late), ScaleVerb::Remove);
        assert_eq!(scale_decision(&config, 1, 1, late), ScaleVerb::Hold);
    }

    #[tokio::test]
    async fn test_pool_runs_jobs_and_unregisters_on_end() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = BuildConfigStore::new(Arc::new(InMemoryKvStore::new()), "buildConfigs");
        let executor = Arc::new(RecordingExecutor::default());
        let registry = JobRegistry::builds(store.clone(), executor.clone(), RetryPolicy::default());
        let (sink, mut rx) = events::channel(1024);
        let pool = WorkerPool::new(config(), broker.clone(), Arc::new(registry), sink);

        store.put(&BuildConfig::new(BuildId::new(5))).await.unwrap();
        broker.enqueue(&start_job(5)).await.unwrap();

        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyStarted)));

        let deadline = Instant::now() + Duration::from_secs(5);
        while executor.started.lock().unwrap().is_empty() && Instant::now() < deadline {
            sleep(Duration::from_millis(5)).await;
        }
        assert!(!broker.registered_workers().await.unwrap().is_empty());

        pool.end().await.unwrap();
        pool.end().await.unwrap();

        assert_eq!(executor.started.lock().unwrap().len(), 1);
        assert!(broker.registered_workers().await.unwrap().is_empty());
        let events = collect(&mut rx);
        assert!(events.iter().any(|e| matches!(e, WorkerEvent::JobSucceeded { .. })));
        assert!(events.iter().any(|e| matches!(e, WorkerEvent::Ended { .. })));
    }

    #[tokio::test]
    async fn test_end_waits_for_in_flight_job() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = JobRegistry::new().register(
            JobKind::Start,
            JobDefinition::new(Arc::new(Slow(Duration::from_millis(200))), None),
        );
        let (sink, mut rx) = events::channel(1024);
        let pool = WorkerPool::new(config(), broker.clone(), Arc::new(registry), sink);

        broker.enqueue(&start_job(1)).await.unwrap();
        pool.start().await.unwrap();
        sleep(Duration::from_millis(50)).await;

        pool.end().await.unwrap();

        let events = collect(&mut rx);
        assert!(events.iter().any(|e| matches!(e, WorkerEvent::JobSucceeded { .. })));
    }

    #[tokio::test]
    async fn test_drain_timeout() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = JobRegistry::new().register(
            JobKind::Start,
            JobDefinition::new(Arc::new(Slow(Duration::from_secs(30))), None),
        );
        let mut config = config();
        config.drain_timeout = Some(Duration::from_millis(50));
        let pool = WorkerPool::new(config, broker.clone(), Arc::new(registry), EventSink::disabled());

        broker.enqueue(&start_job(1)).await.unwrap();
        pool.start().await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert!(matches!(pool.end().await, Err(PoolError::DrainTimeout(_))));
    }

    #[tokio::test]
    async fn test_start_cleans_stale_workers() {
        let broker = Arc::new(InMemoryBroker::new());
        let stale = WorkerRegistration {
            id: "gone:99+1".to_string(),
            hostname: "gone".to_string(),
            pid: 99,
            queues: vec!["builds".to_string()],
            heartbeat_at: Utc::now() - chrono::Duration::minutes(10),
        };
        broker.register_worker(&stale).await.unwrap();

        let (sink, mut rx) = events::channel(1024);
        let pool = WorkerPool::new(config(), broker.clone(), Arc::new(JobRegistry::new()), sink);
        pool.start().await.unwrap();
        pool.end().await.unwrap();

        let events = collect(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            WorkerEvent::WorkerCleaned { stale_worker_id, pid: 99, .. } if stale_worker_id == "gone:99+1"
        )));
    }

    #[test]
    fn test_pool_id_uses_system_hostname() {
        let pool = WorkerPool::new(
            config(),
            Arc::new(InMemoryBroker::new()),
            Arc::new(JobRegistry::new()),
            EventSink::disabled(),
        );

        let host = hostname::get().unwrap().into_string().unwrap();
        assert_eq!(pool.id(), format!("{}:{}", host, std::process::id()));
    }

    #[tokio::test]
    async fn test_end_before_start_is_noop() {
        let pool = WorkerPool::new(
            config(),
            Arc::new(InMemoryBroker::new()),
            Arc::new(JobRegistry::new()),
            EventSink::disabled(),
        );
        pool.end().await.unwrap();
    }
}

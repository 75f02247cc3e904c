//! Build job handlers and the registry that maps job kinds to them.

use crate::retry::RetryPolicy;
use crate::store::BuildConfigStore;
use async_trait::async_trait;
use buildq_core::{BuildPayload, ExecutionReceipt, Executor, JobKind, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// What a successful perform did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerformOutcome {
    Dispatched(ExecutionReceipt),
    Skipped { reason: String },
}

impl fmt::Display for PerformOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerformOutcome::Dispatched(receipt) => write!(f, "dispatched to {}", receipt),
            PerformOutcome::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

/// Position of a perform within its job's retry sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Attempt number, starting at 1.
    pub number: u32,
    /// No further attempt follows if this one fails.
    pub last: bool,
}

impl Attempt {
    /// A single attempt with nothing after it.
    pub fn only() -> Self {
        Self {
            number: 1,
            last: true,
        }
    }
}

/// Work behind one job kind.
#[async_trait]
pub trait Perform: Send + Sync {
    async fn perform(&self, payload: &BuildPayload, attempt: Attempt) -> Result<PerformOutcome>;
}

/// Starts a build from its parked configuration.
pub struct StartBuild {
    store: BuildConfigStore,
    executor: Arc<dyn Executor>,
}

impl StartBuild {
    pub fn new(store: BuildConfigStore, executor: Arc<dyn Executor>) -> Self {
        Self { store, executor }
    }
}

#[async_trait]
impl Perform for StartBuild {
    async fn perform(&self, payload: &BuildPayload, attempt: Attempt) -> Result<PerformOutcome> {
        let build_id = payload.build_id;

        let Some(config) = self.store.fetch_and_consume(build_id).await? else {
            info!(build_id = %build_id, "Build config already consumed, nothing to start");
            return Ok(PerformOutcome::Skipped {
                reason: "build config already consumed".to_string(),
            });
        };

        match self.executor.start(&config).await {
            Ok(receipt) => Ok(PerformOutcome::Dispatched(receipt)),
            Err(e) if attempt.last => Err(e),
            Err(e) => {
                // Put the record back so the next attempt can dispatch it.
                if let Err(restore) = self.store.put(&config).await {
                    warn!(
                        build_id = %build_id,
                        error = %restore,
                        "Failed to restore build config after start failure"
                    );
                }
                Err(e)
            }
        }
    }
}

/// Stops a build, whether or not its configuration is still parked.
pub struct StopBuild {
    store: BuildConfigStore,
    executor: Arc<dyn Executor>,
}

impl StopBuild {
    pub fn new(store: BuildConfigStore, executor: Arc<dyn Executor>) -> Self {
        Self { store, executor }
    }
}

#[async_trait]
impl Perform for StopBuild {
    async fn perform(&self, payload: &BuildPayload, _attempt: Attempt) -> Result<PerformOutcome> {
        let mut stop = self.store.fetch_for_stop(payload.build_id).await?;
        if stop.annotations.is_none() {
            stop.annotations = payload.annotations.clone();
        }

        let receipt = self.executor.stop(&stop).await?;
        Ok(PerformOutcome::Dispatched(receipt))
    }
}

/// A job kind's handler and its retry behavior.
#[derive(Clone)]
pub struct JobDefinition {
    pub perform: Arc<dyn Perform>,
    pub retry: Option<RetryPolicy>,
}

impl JobDefinition {
    pub fn new(perform: Arc<dyn Perform>, retry: Option<RetryPolicy>) -> Self {
        Self { perform, retry }
    }
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    definitions: HashMap<JobKind, JobDefinition>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the start and stop handlers, both retried under `policy`.
    pub fn builds(store: BuildConfigStore, executor: Arc<dyn Executor>, policy: RetryPolicy) -> Self {
        Self::new()
            .register(
                JobKind::Start,
                JobDefinition::new(
                    Arc::new(StartBuild::new(store.clone(), executor.clone())),
                    Some(policy),
                ),
            )
            .register(
                JobKind::Stop,
                JobDefinition::new(Arc::new(StopBuild::new(store, executor)), Some(policy)),
            )
    }

    pub fn register(mut self, kind: JobKind, definition: JobDefinition) -> Self {
        self.definitions.insert(kind, definition);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<&JobDefinition> {
        self.definitions.get(&kind)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::InMemoryKvStore;
    use buildq_core::build::{Annotations, EXECUTOR_ANNOTATION};
    use buildq_core::{BuildConfig, BuildId, Error, StopConfig};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: &str = "buildConfigs";

    /// Executor that records calls and fails the first `failures` starts.
    #[derive(Default)]
    pub(crate) struct RecordingExecutor {
        pub started: Mutex<Vec<BuildConfig>>,
        pub stopped: Mutex<Vec<StopConfig>>,
        pub failures: AtomicUsize,
    }

    impl RecordingExecutor {
        pub fn failing(times: usize) -> Self {
            Self {
                failures: AtomicUsize::new(times),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        fn name(&self) -> &str {
            "recording"
        }

        async fn start(&self, config: &BuildConfig) -> Result<ExecutionReceipt> {
            self.started.lock().unwrap().push(config.clone());
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::ExecutionFailed("cannot start build".to_string()));
            }
            Ok(ExecutionReceipt::new("recording", Some(config.build_id.to_string())))
        }

        async fn stop(&self, config: &StopConfig) -> Result<ExecutionReceipt> {
            self.stopped.lock().unwrap().push(config.clone());
            Ok(ExecutionReceipt::new("recording", None))
        }
    }

    fn full_config(id: u64) -> BuildConfig {
        let mut config = BuildConfig::new(BuildId::new(id));
        config.container = Some("node:4".to_string());
        config.api_uri = Some("http://api.com".to_string());
        config.token = Some("asdf".to_string());
        config
    }

    #[tokio::test]
    async fn test_start_dispatches_full_config_once() {
        let kv = Arc::new(InMemoryKvStore::new());
        let store = BuildConfigStore::new(kv.clone(), KEY);
        store.put(&full_config(8609)).await.unwrap();
        let executor = Arc::new(RecordingExecutor::default());
        let start = StartBuild::new(store, executor.clone());

        let payload = BuildPayload::new(BuildId::new(8609));
        let outcome = start.perform(&payload, Attempt::only()).await.unwrap();
        assert_eq!(
            outcome,
            PerformOutcome::Dispatched(ExecutionReceipt::new("recording", Some("8609".to_string())))
        );
        assert_eq!(*executor.started.lock().unwrap(), vec![full_config(8609)]);
        assert!(!kv.contains(KEY, "8609").await);

        let again = start.perform(&payload, Attempt::only()).await.unwrap();
        assert!(matches!(again, PerformOutcome::Skipped { .. }));
        assert_eq!(executor.started.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_restores_config() {
        let kv = Arc::new(InMemoryKvStore::new());
        let store = BuildConfigStore::new(kv.clone(), KEY);
        store.put(&full_config(7)).await.unwrap();
        let executor = Arc::new(RecordingExecutor::failing(1));
        let start = StartBuild::new(store, executor.clone());

        let payload = BuildPayload::new(BuildId::new(7));
        let first = Attempt {
            number: 1,
            last: false,
        };
        assert!(start.perform(&payload, first).await.is_err());
        assert!(kv.contains(KEY, "7").await);

        let second = Attempt {
            number: 2,
            last: true,
        };
        assert!(matches!(
            start.perform(&payload, second).await.unwrap(),
            PerformOutcome::Dispatched(_)
        ));
        assert!(!kv.contains(KEY, "7").await);
    }

    #[tokio::test]
    async fn test_last_start_failure_leaves_config_consumed() {
        let kv = Arc::new(InMemoryKvStore::new());
        let store = BuildConfigStore::new(kv.clone(), KEY);
        store.put(&full_config(7)).await.unwrap();
        let executor = Arc::new(RecordingExecutor::failing(1));
        let start = StartBuild::new(store, executor.clone());

        let payload = BuildPayload::new(BuildId::new(7));
        assert!(start.perform(&payload, Attempt::only()).await.is_err());
        assert!(!kv.contains(KEY, "7").await);

        let again = start.perform(&payload, Attempt::only()).await.unwrap();
        assert!(matches!(again, PerformOutcome::Skipped { .. }));
        assert_eq!(executor.started.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_prefers_stored_annotations() {
        let kv = Arc::new(InMemoryKvStore::new());
        let store = BuildConfigStore::new(kv.clone(), KEY);
        let executor = Arc::new(RecordingExecutor::default());
        let stop = StopBuild::new(store.clone(), executor.clone());

        let mut annotations = Annotations::new();
        annotations.insert(EXECUTOR_ANNOTATION.to_string(), json!("docker"));
        let mut payload = BuildPayload::new(BuildId::new(4));
        payload.annotations = Some(annotations.clone());

        // Nothing parked: annotations come from the job itself.
        stop.perform(&payload, Attempt::only()).await.unwrap();
        assert_eq!(
            executor.stopped.lock().unwrap()[0].executor_hint(),
            Some("docker")
        );

        let mut parked = full_config(4);
        let mut stored = Annotations::new();
        stored.insert(EXECUTOR_ANNOTATION.to_string(), json!("k8s"));
        parked.annotations = Some(stored);
        store.put(&parked).await.unwrap();

        stop.perform(&payload, Attempt::only()).await.unwrap();
        assert_eq!(
            executor.stopped.lock().unwrap()[1].executor_hint(),
            Some("k8s")
        );
        assert!(!kv.contains(KEY, "4").await);
    }

    #[test]
    fn test_builds_registry_covers_both_kinds() {
        let store = BuildConfigStore::new(Arc::new(InMemoryKvStore::new()), KEY);
        let registry = JobRegistry::builds(
            store,
            Arc::new(RecordingExecutor::default()),
            RetryPolicy::default(),
        );

        for kind in [JobKind::Start, JobKind::Stop] {
            let definition = registry.get(kind).unwrap();
            assert_eq!(definition.retry, Some(RetryPolicy::default()));
        }
    }
}

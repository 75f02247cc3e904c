//! Annotation-based executor routing.

use async_trait::async_trait;
use buildq_core::{BuildConfig, Error, ExecutionReceipt, Executor, Result, StopConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Dispatches each build to the executor named in its annotations,
/// falling back to the default executor.
pub struct ExecutorRouter {
    default: String,
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRouter {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            executors: HashMap::new(),
        }
    }

    /// Register an executor under its own name.
    pub fn register(self, executor: Arc<dyn Executor>) -> Self {
        let name = executor.name().to_string();
        self.register_as(name, executor)
    }

    /// Register an executor under an explicit name (e.g., an alias).
    pub fn register_as(mut self, name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(name.into(), executor);
        self
    }

    /// Check that the default executor is registered.
    pub fn validate(&self) -> Result<()> {
        if self.executors.contains_key(&self.default) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "default executor '{}' is not registered",
                self.default
            )))
        }
    }

    fn route(&self, hint: Option<&str>) -> Result<&Arc<dyn Executor>> {
        if let Some(name) = hint {
            if let Some(executor) = self.executors.get(name) {
                debug!(executor = name, "Routing by annotation");
                return Ok(executor);
            }
            warn!(
                requested = name,
                default = %self.default,
                "Unknown executor requested, using default"
            );
        }

        self.executors.get(&self.default).ok_or_else(|| {
            Error::InvalidInput(format!(
                "default executor '{}' is not registered",
                self.default
            ))
        })
    }
}

#[async_trait]
impl Executor for ExecutorRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn start(&self, config: &BuildConfig) -> Result<ExecutionReceipt> {
        self.route(config.executor_hint())?.start(config).await
    }

    async fn stop(&self, config: &StopConfig) -> Result<ExecutionReceipt> {
        self.route(config.executor_hint())?.stop(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildq_core::BuildId;
    use buildq_core::build::{Annotations, EXECUTOR_ANNOTATION};
    use serde_json::json;

    struct NamedExecutor(&'static str);

    #[async_trait]
    impl Executor for NamedExecutor {
        fn name(&self) -> &str {
            self.0
        }

        async fn start(&self, config: &BuildConfig) -> Result<ExecutionReceipt> {
            Ok(ExecutionReceipt::new(self.0, Some(config.build_id.to_string())))
        }

        async fn stop(&self, config: &StopConfig) -> Result<ExecutionReceipt> {
            Ok(ExecutionReceipt::new(self.0, Some(config.build_id.to_string())))
        }
    }

    fn router() -> ExecutorRouter {
        ExecutorRouter::new("docker")
            .register(Arc::new(NamedExecutor("docker")))
            .register(Arc::new(NamedExecutor("k8s")))
    }

    fn annotated(name: &str) -> Annotations {
        let mut annotations = Annotations::new();
        annotations.insert(EXECUTOR_ANNOTATION.to_string(), json!(name));
        annotations
    }

    #[tokio::test]
    async fn test_routes_by_annotation() {
        let mut config = BuildConfig::new(BuildId::new(8609));
        config.annotations = Some(annotated("k8s"));

        let receipt = router().start(&config).await.unwrap();
        assert_eq!(receipt.executor, "k8s");
        assert_eq!(receipt.reference.as_deref(), Some("8609"));
    }

    #[tokio::test]
    async fn test_defaults_without_annotation() {
        let stop = StopConfig::new(BuildId::new(1));
        let receipt = router().stop(&stop).await.unwrap();
        assert_eq!(receipt.executor, "docker");
    }

    #[tokio::test]
    async fn test_unknown_annotation_falls_back_to_default() {
        let stop = StopConfig {
            build_id: BuildId::new(1),
            annotations: Some(annotated("nomad")),
        };
        let receipt = router().stop(&stop).await.unwrap();
        assert_eq!(receipt.executor, "docker");
    }

    #[test]
    fn test_validate_requires_default() {
        let router = ExecutorRouter::new("k8s").register(Arc::new(NamedExecutor("docker")));
        assert!(router.validate().is_err());
        assert!(self::router().validate().is_ok());
    }
}

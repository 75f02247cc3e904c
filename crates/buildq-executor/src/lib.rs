//! Build execution backends for buildq.
//!
//! Provides executor implementations for launching builds:
//! - Kubernetes (production)
//! - Local Docker (development)
//!
//! and a router that picks one per build from its annotations.

pub mod docker;
pub mod kubernetes;
pub mod router;

pub use buildq_core::executor::{ExecutionReceipt, Executor};
pub use docker::DockerExecutor;
pub use kubernetes::KubernetesExecutor;
pub use router::ExecutorRouter;

use buildq_config::ExecutorSettings;
use buildq_core::Result;
use std::sync::Arc;

/// Build a router holding every executor configured in `settings`.
pub async fn router_from_settings(settings: &ExecutorSettings) -> Result<ExecutorRouter> {
    let mut router = ExecutorRouter::new(settings.default.clone());

    if let Some(docker) = &settings.docker {
        router = router.register(Arc::new(DockerExecutor::from_settings(docker)?));
    }
    if let Some(k8s) = &settings.kubernetes {
        router = router.register(Arc::new(KubernetesExecutor::from_settings(k8s).await?));
    }

    router.validate()?;
    Ok(router)
}

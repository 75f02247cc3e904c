//! Executor trait.
//!
//! Executors launch and tear down builds in isolated environments
//! (containers, pods, etc.)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{BuildConfig, Result, StopConfig};

/// What an executor reports back after handling a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    /// Name of the executor that handled the request.
    pub executor: String,
    /// Executor-specific identifier (e.g., pod name, container ID).
    pub reference: Option<String>,
}

impl ExecutionReceipt {
    pub fn new(executor: impl Into<String>, reference: Option<String>) -> Self {
        Self {
            executor: executor.into(),
            reference,
        }
    }
}

impl fmt::Display for ExecutionReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Some(reference) => write!(f, "{}:{}", self.executor, reference),
            None => write!(f, "{}", self.executor),
        }
    }
}

/// Trait for build executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &str;

    /// Launch a build.
    async fn start(&self, config: &BuildConfig) -> Result<ExecutionReceipt>;

    /// Tear down a build. Stopping a build that no longer exists succeeds.
    async fn stop(&self, config: &StopConfig) -> Result<ExecutionReceipt>;
}

//! Build configurations handed from producers to workers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::BuildId;

/// Annotation selecting which executor should run a build.
pub const EXECUTOR_ANNOTATION: &str = "beta.screwdriver.cd/executor";

/// Free-form build annotations.
pub type Annotations = BTreeMap<String, Value>;

/// Full configuration of a build, written by the producer before the start
/// job is enqueued.
///
/// Fields the coordinator does not know about are kept in `extra` so the
/// executor receives the record exactly as it was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    pub build_id: BuildId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Container image the build runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BuildConfig {
    pub fn new(build_id: BuildId) -> Self {
        Self {
            build_id,
            api_uri: None,
            token: None,
            container: None,
            annotations: None,
            extra: Map::new(),
        }
    }

    /// Executor requested through the build's annotations, if any.
    pub fn executor_hint(&self) -> Option<&str> {
        executor_annotation(self.annotations.as_ref())
    }
}

/// Configuration passed to an executor to stop a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopConfig {
    pub build_id: BuildId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl StopConfig {
    pub fn new(build_id: BuildId) -> Self {
        Self {
            build_id,
            annotations: None,
        }
    }

    pub fn executor_hint(&self) -> Option<&str> {
        executor_annotation(self.annotations.as_ref())
    }
}

fn executor_annotation(annotations: Option<&Annotations>) -> Option<&str> {
    annotations?
        .get(EXECUTOR_ANNOTATION)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

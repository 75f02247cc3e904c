//! Queued jobs and failure records.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::{Annotations, BuildId, Result};

/// The kind of work a job asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    #[display("start")]
    Start,
    #[display("stop")]
    Stop,
}

/// Argument of a queued job.
///
/// Start jobs carry the coordinates needed to report failure (`apiUri`,
/// `token`); stop jobs usually only carry the build ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildPayload {
    pub build_id: BuildId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BuildPayload {
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

    pub fn with_api(mut self, api_uri: impl Into<String>, token: impl Into<String>) -> Self {
        self.api_uri = Some(api_uri.into());
        self.token = Some(token.into());
        self
    }
}

fn first_attempt() -> u32 {
    1
}

/// A job as stored on the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub queue: String,
    pub class: JobKind,
    pub args: Vec<BuildPayload>,
    /// 1-based attempt number of this delivery.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

impl Job {
    pub fn new(queue: impl Into<String>, class: JobKind, payload: BuildPayload) -> Self {
        Self {
            queue: queue.into(),
            class,
            args: vec![payload],
            attempt: 1,
        }
    }

    /// The first argument, which identifies the build.
    pub fn payload(&self) -> Option<&BuildPayload> {
        self.args.first()
    }

    pub fn build_id(&self) -> Option<BuildId> {
        self.payload().map(|p| p.build_id)
    }

    /// Attempt number, treating a stored `0` as the first attempt.
    pub fn current_attempt(&self) -> u32 {
        self.attempt.max(1)
    }

    /// Copy of this job for its next delivery.
    pub fn next_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.build_id() {
            Some(id) => write!(f, "{}[build {}]#{}", self.class, id, self.attempt),
            None => write!(f, "{}[no build]#{}", self.class, self.attempt),
        }
    }
}

/// Record of a job that exhausted its attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub job: Job,
    pub queue: String,
    pub worker_id: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

//! Build-Status API abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::BuildId;

/// Build status values understood by the Build-Status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildStatus {
    Failure,
}

#[derive(Debug, Error)]
pub enum StatusApiError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),
}

/// Client for the API that owns build state.
#[async_trait]
pub trait StatusApi: Send + Sync {
    /// Set the build's status to FAILURE.
    async fn mark_failed(
        &self,
        api_uri: &str,
        build_id: BuildId,
        token: &str,
    ) -> Result<(), StatusApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&BuildStatus::Failure).unwrap(),
            "\"FAILURE\""
        );
    }
}

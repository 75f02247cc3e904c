//! HTTP client for the Build-Status API.

use async_trait::async_trait;
use buildq_core::{BuildId, BuildStatus, StatusApi, StatusApiError};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct StatusUpdate {
    status: BuildStatus,
}

/// Talks to `PUT <apiUri>/v4/builds/<buildId>` with the build's own token.
pub struct HttpStatusApi {
    client: Client,
}

impl HttpStatusApi {
    pub fn new(timeout: Duration) -> Result<Self, StatusApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("buildq")
            .build()
            .map_err(|e| StatusApiError::Request(e.to_string()))?;
        Ok(Self { client })
    }

    fn build_url(api_uri: &str, build_id: BuildId) -> String {
        format!("{}/v4/builds/{}", api_uri.trim_end_matches('/'), build_id)
    }
}

#[async_trait]
impl StatusApi for HttpStatusApi {
    async fn mark_failed(
        &self,
        api_uri: &str,
        build_id: BuildId,
        token: &str,
    ) -> Result<(), StatusApiError> {
        let url = Self::build_url(api_uri, build_id);
        debug!(url = %url, "Marking build failed");

        let response = self
            .client
            .put(&url)
            .bearer_auth(token)
            .json(&StatusUpdate {
                status: BuildStatus::Failure,
            })
            .send()
            .await
            .map_err(|e| StatusApiError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(StatusApiError::UnexpectedStatus(status.as_u16())),
        }
    }
}

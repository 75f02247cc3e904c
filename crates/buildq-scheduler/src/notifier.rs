//! Reports builds whose jobs failed for good.

use buildq_core::{Job, StatusApi, StatusApiError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

/// Everything known about a terminal job failure.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub job: Job,
    pub queue: String,
    pub worker_id: String,
    pub failure_reason: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("job payload has no {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    Api(#[from] StatusApiError),
}

/// Marks the failed build as FAILURE through the Build-Status API.
pub struct FailureNotifier {
    api: Arc<dyn StatusApi>,
}

impl FailureNotifier {
    pub fn new(api: Arc<dyn StatusApi>) -> Self {
        Self { api }
    }

    /// Send the status update and log the outcome either way.
    pub async fn notify_failure(&self, ctx: &FailureContext) -> Result<(), NotifyError> {
        let result = self.send(ctx).await;

        match &result {
            Ok(()) => warn!(
                worker_id = %ctx.worker_id,
                queue = %ctx.queue,
                job = %ctx.job,
                reason = %ctx.failure_reason,
                "Job failed; successfully updated build status"
            ),
            Err(e) => error!(
                worker_id = %ctx.worker_id,
                queue = %ctx.queue,
                job = %ctx.job,
                reason = %ctx.failure_reason,
                error = %e,
                "Job failed; could not update build status"
            ),
        }

        result
    }

    async fn send(&self, ctx: &FailureContext) -> Result<(), NotifyError> {
        let payload = ctx.job.payload().ok_or(NotifyError::MissingField("args"))?;
        let api_uri = payload
            .api_uri
            .as_deref()
            .ok_or(NotifyError::MissingField("apiUri"))?;
        let token = payload
            .token
            .as_deref()
            .ok_or(NotifyError::MissingField("token"))?;

        self.api.mark_failed(api_uri, payload.build_id, token).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use buildq_core::{BuildId, BuildPayload, JobKind};
    use std::io;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    /// Collects formatted log lines in memory.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(logs.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    /// Status API that records every call.
    #[derive(Default)]
    pub(crate) struct RecordingStatusApi {
        pub calls: Mutex<Vec<(String, BuildId, String)>>,
        pub reject_with: Option<u16>,
    }

    #[async_trait]
    impl StatusApi for RecordingStatusApi {
        async fn mark_failed(
            &self,
            api_uri: &str,
            build_id: BuildId,
            token: &str,
        ) -> Result<(), StatusApiError> {
            self.calls
                .lock()
                .unwrap()
                .push((api_uri.to_string(), build_id, token.to_string()));
            match self.reject_with {
                Some(code) => Err(StatusApiError::UnexpectedStatus(code)),
                None => Ok(()),
            }
        }
    }

    fn context(payload: BuildPayload) -> FailureContext {
        FailureContext {
            job: Job::new("builds", JobKind::Start, payload),
            queue: "builds".to_string(),
            worker_id: "host:1+1".to_string(),
            failure_reason: "cannot start build".to_string(),
        }
    }

    #[tokio::test]
    async fn test_marks_build_failed() {
        let api = Arc::new(RecordingStatusApi::default());
        let notifier = FailureNotifier::new(api.clone());

        let ctx = context(BuildPayload::new(BuildId::new(42)).with_api("http://x", "t"));
        notifier.notify_failure(&ctx).await.unwrap();

        assert_eq!(
            *api.calls.lock().unwrap(),
            vec![("http://x".to_string(), BuildId::new(42), "t".to_string())]
        );
    }

    #[tokio::test]
    async fn test_log_level_follows_status_update_result() {
        let (logs, _guard) = capture_logs();
        let ctx = context(BuildPayload::new(BuildId::new(42)).with_api("http://x", "t"));

        FailureNotifier::new(Arc::new(RecordingStatusApi::default()))
            .notify_failure(&ctx)
            .await
            .unwrap();
        let updated = logs.contents();
        assert!(updated.contains("WARN"));
        assert!(updated.contains("successfully updated build status"));
        assert!(!updated.contains("ERROR"));

        let rejecting = RecordingStatusApi {
            reject_with: Some(500),
            ..Default::default()
        };
        let _ = FailureNotifier::new(Arc::new(rejecting))
            .notify_failure(&ctx)
            .await;
        assert!(logs.contents().contains("ERROR"));
        assert!(logs.contents().contains("could not update build status"));
    }

    #[tokio::test]
    async fn test_api_rejection_is_reported() {
        let api = Arc::new(RecordingStatusApi {
            reject_with: Some(500),
            ..Default::default()
        });
        let notifier = FailureNotifier::new(api);

        let ctx = context(BuildPayload::new(BuildId::new(42)).with_api("http://x", "t"));
        let result = notifier.notify_failure(&ctx).await;
        assert!(matches!(
            result,
            Err(NotifyError::Api(StatusApiError::UnexpectedStatus(500)))
        ));
    }

    #[tokio::test]
    async fn test_missing_api_coordinates() {
        let api = Arc::new(RecordingStatusApi::default());
        let notifier = FailureNotifier::new(api.clone());

        let result = notifier
            .notify_failure(&context(BuildPayload::new(BuildId::new(42))))
            .await;
        assert!(matches!(result, Err(NotifyError::MissingField("apiUri"))));
        assert!(api.calls.lock().unwrap().is_empty());
    }
}

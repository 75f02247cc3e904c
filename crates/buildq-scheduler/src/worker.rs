//! Worker that claims and processes jobs from the queues.

use crate::events::{EventSink, WorkerEvent};
use crate::jobs::JobRegistry;
use crate::retry::{AttemptOutcome, RETRY_PLUGIN, Retrying};
use buildq_core::{Broker, Error, FailedJob, Job};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A worker that claims and executes jobs, one at a time.
///
/// Queues are polled in priority order; after each job the worker starts
/// again from the first queue.
pub struct Worker {
    id: String,
    queues: Vec<String>,
    poll_interval: Duration,
    broker: Arc<dyn Broker>,
    registry: Arc<JobRegistry>,
    events: EventSink<WorkerEvent>,
    busy: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queues: Vec<String>,
        poll_interval: Duration,
        broker: Arc<dyn Broker>,
        registry: Arc<JobRegistry>,
        events: EventSink<WorkerEvent>,
    ) -> Self {
        Self {
            id: id.into(),
            queues,
            poll_interval,
            broker,
            registry,
            events,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Flag that is set while a job is in flight.
    pub fn busy_flag(&self) -> Arc<AtomicBool> {
        self.busy.clone()
    }

    /// Run the worker loop until `shutdown` fires.
    ///
    /// A job already claimed always runs to completion.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.events
            .emit(WorkerEvent::Started {
                worker_id: self.id.clone(),
            })
            .await;

        while !shutdown.is_cancelled() {
            if self.poll_once(&shutdown).await {
                continue;
            }

            self.events
                .emit(WorkerEvent::Paused {
                    worker_id: self.id.clone(),
                })
                .await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.poll_interval) => {}
            }
        }

        self.events
            .emit(WorkerEvent::Ended {
                worker_id: self.id.clone(),
            })
            .await;
    }

    /// Poll the queues in order and process the first job found.
    /// Returns whether a job was processed.
    async fn poll_once(&self, shutdown: &CancellationToken) -> bool {
        for queue in &self.queues {
            if shutdown.is_cancelled() {
                return false;
            }

            self.events
                .emit(WorkerEvent::Polled {
                    worker_id: self.id.clone(),
                    queue: queue.clone(),
                })
                .await;

            match self.broker.claim(queue).await {
                Ok(Some(job)) => {
                    self.busy.store(true, Ordering::SeqCst);
                    self.process(queue, job).await;
                    self.busy.store(false, Ordering::SeqCst);
                    return true;
                }
                Ok(None) => {}
                Err(Error::Serialization(e)) => {
                    self.events
                        .emit(WorkerEvent::JobErrored {
                            worker_id: self.id.clone(),
                            queue: queue.clone(),
                            job: None,
                            error: format!("undecodable job: {}", e),
                        })
                        .await;
                }
                Err(e) => {
                    self.events
                        .emit(WorkerEvent::InternalError {
                            error: format!("failed to claim from {}: {}", queue, e),
                        })
                        .await;
                }
            }
        }
        false
    }

    async fn process(&self, queue: &str, job: Job) {
        self.events
            .emit(WorkerEvent::JobClaimed {
                worker_id: self.id.clone(),
                queue: queue.to_string(),
                job: job.clone(),
            })
            .await;

        let Some(definition) = self.registry.get(job.class) else {
            self.events
                .emit(WorkerEvent::JobErrored {
                    worker_id: self.id.clone(),
                    queue: queue.to_string(),
                    error: format!("no handler registered for '{}'", job.class),
                    job: Some(job),
                })
                .await;
            return;
        };

        let outcome = Retrying::new(definition, self.broker.clone()).run(&job).await;
        let event = match outcome {
            AttemptOutcome::Succeeded(result) => WorkerEvent::JobSucceeded {
                worker_id: self.id.clone(),
                queue: queue.to_string(),
                job,
                result,
            },
            AttemptOutcome::Reenqueued { run_at, .. } => WorkerEvent::JobReenqueued {
                worker_id: self.id.clone(),
                queue: queue.to_string(),
                job,
                plugin: RETRY_PLUGIN,
                run_at,
            },
            AttemptOutcome::Failed { reason } => {
                self.record_failure(queue, &job, &reason).await;
                WorkerEvent::JobFailed {
                    worker_id: self.id.clone(),
                    queue: queue.to_string(),
                    job,
                    reason,
                }
            }
            AttemptOutcome::Errored { error } => WorkerEvent::JobErrored {
                worker_id: self.id.clone(),
                queue: queue.to_string(),
                job: Some(job),
                error,
            },
        };
        self.events.emit(event).await;
    }

    async fn record_failure(&self, queue: &str, job: &Job, reason: &str) {
        let failure = FailedJob {
            job: job.clone(),
            queue: queue.to_string(),
            worker_id: self.id.clone(),
            error: reason.to_string(),
            failed_at: Utc::now(),
        };
        if let Err(e) = self.broker.record_failure(&failure).await {
            warn!(job = %job, error = %e, "Failed to record job failure");
        }
    }
}

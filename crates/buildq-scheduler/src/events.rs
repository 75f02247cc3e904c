//! Lifecycle events from workers and the scheduler, and the tasks that
//! consume them.

use crate::jobs::PerformOutcome;
use crate::notifier::{FailureContext, FailureNotifier};
use buildq_core::Job;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Pool resize decision taken by the supervisor on each check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleVerb {
    Add,
    Remove,
    Hold,
}

impl fmt::Display for ScaleVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleVerb::Add => write!(f, "+"),
            ScaleVerb::Remove => write!(f, "-"),
            ScaleVerb::Hold => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started {
        worker_id: String,
    },
    Ended {
        worker_id: String,
    },
    WorkerCleaned {
        worker_id: String,
        stale_worker_id: String,
        pid: u32,
    },
    Polled {
        worker_id: String,
        queue: String,
    },
    JobClaimed {
        worker_id: String,
        queue: String,
        job: Job,
    },
    JobReenqueued {
        worker_id: String,
        queue: String,
        job: Job,
        plugin: &'static str,
        run_at: DateTime<Utc>,
    },
    JobSucceeded {
        worker_id: String,
        queue: String,
        job: Job,
        result: PerformOutcome,
    },
    /// Terminal failure: the job has no attempts left.
    JobFailed {
        worker_id: String,
        queue: String,
        job: Job,
        reason: String,
    },
    JobErrored {
        worker_id: String,
        queue: String,
        job: Option<Job>,
        error: String,
    },
    Paused {
        worker_id: String,
    },
    InternalError {
        error: String,
    },
    BackpressureAction {
        verb: ScaleVerb,
        delay_ms: u64,
    },
}

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Started,
    Ended,
    Polled,
    BecameMaster { state: bool },
    Error { error: String },
    WorkingTimestamp { timestamp: i64 },
    JobTransferred { timestamp: i64, job: Job },
}

/// Sending half handed to emitters. Emitting never fails: with no
/// receiver left the event is dropped.
#[derive(Debug)]
pub struct EventSink<E> {
    tx: Option<mpsc::Sender<E>>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Send> EventSink<E> {
    pub fn new(tx: mpsc::Sender<E>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub async fn emit(&self, event: E) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}

pub fn channel<E: Send>(capacity: usize) -> (EventSink<E>, mpsc::Receiver<E>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSink::new(tx), rx)
}

/// Log every worker event and report terminal failures.
///
/// Runs until every sink is dropped, then waits for outstanding
/// failure reports before returning.
pub fn spawn_worker_event_handler(
    mut rx: mpsc::Receiver<WorkerEvent>,
    notifier: Option<Arc<FailureNotifier>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reports = JoinSet::new();

        while let Some(event) = rx.recv().await {
            log_worker_event(&event);

            if let (
                Some(notifier),
                WorkerEvent::JobFailed {
                    worker_id,
                    queue,
                    job,
                    reason,
                },
            ) = (&notifier, event)
            {
                let notifier = notifier.clone();
                let ctx = FailureContext {
                    job,
                    queue,
                    worker_id,
                    failure_reason: reason,
                };
                reports.spawn(async move {
                    // Outcome is logged by the notifier.
                    let _ = notifier.notify_failure(&ctx).await;
                });
            }

            while reports.try_join_next().is_some() {}
        }

        while reports.join_next().await.is_some() {}
    })
}

pub fn spawn_scheduler_event_handler(mut rx: mpsc::Receiver<SchedulerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            log_scheduler_event(&event);
        }
    })
}

fn log_worker_event(event: &WorkerEvent) {
    match event {
        WorkerEvent::Started { worker_id } => info!(worker_id = %worker_id, "Worker started"),
        WorkerEvent::Ended { worker_id } => info!(worker_id = %worker_id, "Worker ended"),
        WorkerEvent::WorkerCleaned {
            worker_id,
            stale_worker_id,
            pid,
        } => info!(
            worker_id = %worker_id,
            stale_worker_id = %stale_worker_id,
            pid,
            "Cleaned stale worker"
        ),
        WorkerEvent::Polled { worker_id, queue } => {
            debug!(worker_id = %worker_id, queue = %queue, "Polling")
        }
        WorkerEvent::JobClaimed {
            worker_id,
            queue,
            job,
        } => info!(worker_id = %worker_id, queue = %queue, job = %job, "Working job"),
        WorkerEvent::JobReenqueued {
            worker_id,
            queue,
            job,
            plugin,
            run_at,
        } => info!(
            worker_id = %worker_id,
            queue = %queue,
            job = %job,
            plugin = %plugin,
            run_at = %run_at,
            "Job re-enqueued"
        ),
        WorkerEvent::JobSucceeded {
            worker_id,
            queue,
            job,
            result,
        } => info!(
            worker_id = %worker_id,
            queue = %queue,
            job = %job,
            result = %result,
            "Job succeeded"
        ),
        WorkerEvent::JobFailed {
            worker_id,
            queue,
            job,
            reason,
        } => warn!(
            worker_id = %worker_id,
            queue = %queue,
            job = %job,
            reason = %reason,
            "Job failed with no attempts left"
        ),
        WorkerEvent::JobErrored {
            worker_id,
            queue,
            job,
            error,
        } => match job {
            Some(job) => error!(
                worker_id = %worker_id,
                queue = %queue,
                job = %job,
                error = %error,
                "Job errored"
            ),
            None => error!(worker_id = %worker_id, queue = %queue, error = %error, "Job errored"),
        },
        WorkerEvent::Paused { worker_id } => debug!(worker_id = %worker_id, "Worker paused"),
        WorkerEvent::InternalError { error } => error!(error = %error, "Worker pool error"),
        WorkerEvent::BackpressureAction { verb, delay_ms } => match verb {
            ScaleVerb::Hold => debug!(delay_ms, "Pool size unchanged"),
            _ => info!(verb = %verb, delay_ms, "Resizing worker pool"),
        },
    }
}

fn log_scheduler_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::Started => info!("Scheduler started"),
        SchedulerEvent::Ended => info!("Scheduler ended"),
        SchedulerEvent::Polled => debug!("Scheduler polling"),
        SchedulerEvent::BecameMaster { state } => {
            info!(state, "Scheduler leadership changed")
        }
        SchedulerEvent::Error { error } => error!(error = %error, "Scheduler error"),
        SchedulerEvent::WorkingTimestamp { timestamp } => {
            debug!(timestamp, "Scheduler working timestamp")
        }
        SchedulerEvent::JobTransferred { timestamp, job } => {
            info!(timestamp, job = %job, "Delayed job enqueued")
        }
    }
}

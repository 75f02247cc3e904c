//! Promotes delayed jobs to their queues once they are due.
//!
//! Any number of processes may run a scheduler; a lease in the broker
//! picks the single leader that moves jobs. The others keep polling for
//! the lease.

use crate::error::SchedulerError;
use crate::events::{EventSink, SchedulerEvent};
use buildq_config::SchedulerSettings;
use buildq_core::Broker;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub leader_lock_timeout: Duration,
    /// Lease holder name; unique per scheduler instance.
    pub instance_id: String,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            leader_lock_timeout: settings.leader_lock_timeout(),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

struct SchedulerState {
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    ended: bool,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    state: Mutex<SchedulerState>,
}

struct Inner {
    config: SchedulerConfig,
    broker: Arc<dyn Broker>,
    events: EventSink<SchedulerEvent>,
    leader: AtomicBool,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        broker: Arc<dyn Broker>,
        events: EventSink<SchedulerEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                broker,
                events,
                leader: AtomicBool::new(false),
            }),
            state: Mutex::new(SchedulerState {
                shutdown: CancellationToken::new(),
                task: None,
                ended: false,
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::SeqCst)
    }

    /// Check that the broker is reachable.
    pub async fn connect(&self) -> Result<(), SchedulerError> {
        if let Err(e) = self.inner.broker.ping().await {
            self.inner
                .events
                .emit(SchedulerEvent::Error {
                    error: e.to_string(),
                })
                .await;
            return Err(SchedulerError::Connect(e));
        }
        Ok(())
    }

    /// Start polling in the background.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        if state.task.is_some() || state.ended {
            return Err(SchedulerError::AlreadyStarted);
        }

        let inner = self.inner.clone();
        let shutdown = state.shutdown.clone();
        state.task = Some(tokio::spawn(async move { inner.run(shutdown).await }));

        self.inner.events.emit(SchedulerEvent::Started).await;
        info!(instance_id = %self.instance_id(), "Scheduler started");
        Ok(())
    }

    /// Stop polling and give up the lease if held.
    ///
    /// Calling `end` more than once, or before `start`, is a no-op.
    pub async fn end(&self) -> Result<(), SchedulerError> {
        let task = {
            let mut state = self.state.lock().await;
            if state.ended {
                return Ok(());
            }
            state.ended = true;
            state.shutdown.cancel();
            state.task.take()
        };
        let Some(task) = task else {
            return Ok(());
        };

        task.await.map_err(|e| SchedulerError::Task(e.to_string()))?;

        if self.inner.leader.swap(false, Ordering::SeqCst) {
            self.inner
                .broker
                .release_leadership(&self.inner.config.instance_id)
                .await
                .map_err(SchedulerError::Release)?;
        }

        self.inner.events.emit(SchedulerEvent::Ended).await;
        info!(instance_id = %self.instance_id(), "Scheduler ended");
        Ok(())
    }

    /// Run a single poll cycle.
    pub async fn poll(&self) {
        self.inner.poll(&CancellationToken::new()).await;
    }
}

impl Inner {
    async fn run(&self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            self.poll(&shutdown).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn poll(&self, shutdown: &CancellationToken) {
        self.events.emit(SchedulerEvent::Polled).await;

        if !self.try_lead().await {
            return;
        }

        while !shutdown.is_cancelled() {
            let timestamp = match self.broker.next_delayed_timestamp(Utc::now()).await {
                Ok(Some(timestamp)) => timestamp,
                Ok(None) => return,
                Err(e) => return self.error(e).await,
            };

            self.events
                .emit(SchedulerEvent::WorkingTimestamp { timestamp })
                .await;
            if !self.transfer(timestamp).await {
                return;
            }
        }
    }

    /// Acquire or renew the lease and report leadership changes.
    async fn try_lead(&self) -> bool {
        let leading = match self
            .broker
            .acquire_leadership(&self.config.instance_id, self.config.leader_lock_timeout)
            .await
        {
            Ok(leading) => leading,
            Err(e) => {
                self.error(e).await;
                false
            }
        };

        if self.leader.swap(leading, Ordering::SeqCst) != leading {
            self.events
                .emit(SchedulerEvent::BecameMaster { state: leading })
                .await;
        }
        leading
    }

    /// Move every job due at `timestamp`. Returns false when the poll
    /// should stop.
    async fn transfer(&self, timestamp: i64) -> bool {
        loop {
            let job = match self.broker.pop_delayed(timestamp).await {
                Ok(Some(job)) => job,
                Ok(None) => return true,
                Err(e) => {
                    self.error(e).await;
                    return false;
                }
            };

            if let Err(e) = self.broker.enqueue(&job).await {
                self.error(e).await;
                // Put it back so the next poll can try again.
                let at = Utc
                    .timestamp_opt(timestamp, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                if let Err(e) = self.broker.enqueue_at(at, &job).await {
                    self.error(e).await;
                }
                return false;
            }

            self.events
                .emit(SchedulerEvent::JobTransferred { timestamp, job })
                .await;
        }
    }

    async fn error(&self, error: buildq_core::Error) {
        self.events
            .emit(SchedulerEvent::Error {
                error: error.to_string(),
            })
            .await;
    }
}

//! Ordered, idempotent shutdown of the worker pool and scheduler.

use crate::error::{PoolError, SchedulerError};
use crate::pool::WorkerPool;
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OnceCell, watch};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// A component that can be asked to stop.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn component(&self) -> &'static str;

    async fn end(&self) -> Result<(), ShutdownError>;
}

#[async_trait]
impl Lifecycle for WorkerPool {
    fn component(&self) -> &'static str {
        "worker pool"
    }

    async fn end(&self) -> Result<(), ShutdownError> {
        Ok(WorkerPool::end(self).await?)
    }
}

#[async_trait]
impl Lifecycle for Scheduler {
    fn component(&self) -> &'static str {
        "scheduler"
    }

    async fn end(&self) -> Result<(), ShutdownError> {
        Ok(Scheduler::end(self).await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    EndingWorker,
    EndingScheduler,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Ok,
    WorkerFailed,
    SchedulerFailed,
}

impl ShutdownOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownOutcome::Ok => 0,
            ShutdownOutcome::WorkerFailed | ShutdownOutcome::SchedulerFailed => 128,
        }
    }
}

/// Ends the worker pool first, then the scheduler.
///
/// Only the first call does any work; later and concurrent calls wait
/// for it and get the same outcome. The scheduler is ended even when the
/// pool failed to.
pub struct ShutdownCoordinator {
    worker: Arc<dyn Lifecycle>,
    scheduler: Option<Arc<dyn Lifecycle>>,
    state: watch::Sender<ShutdownState>,
    outcome: OnceCell<ShutdownOutcome>,
}

impl ShutdownCoordinator {
    pub fn new(worker: Arc<dyn Lifecycle>, scheduler: Arc<dyn Lifecycle>) -> Self {
        Self::build(worker, Some(scheduler))
    }

    /// Coordinator for a process running no scheduler.
    pub fn single(worker: Arc<dyn Lifecycle>) -> Self {
        Self::build(worker, None)
    }

    fn build(worker: Arc<dyn Lifecycle>, scheduler: Option<Arc<dyn Lifecycle>>) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            worker,
            scheduler,
            state,
            outcome: OnceCell::new(),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    pub async fn shutdown(&self) -> ShutdownOutcome {
        *self.outcome.get_or_init(|| self.run()).await
    }

    /// Wait for SIGTERM or Ctrl-C, then shut down.
    pub async fn run_until_signal(&self) -> ShutdownOutcome {
        match wait_for_signal().await {
            Ok(signal) => info!(signal, "Received signal, shutting down"),
            Err(e) => error!(error = %e, "Failed to listen for signals, shutting down"),
        }
        self.shutdown().await
    }

    async fn run(&self) -> ShutdownOutcome {
        let mut outcome = ShutdownOutcome::Ok;

        self.state.send_replace(ShutdownState::EndingWorker);
        if let Err(e) = self.worker.end().await {
            error!(component = self.worker.component(), error = %e, "Failed to shut down");
            outcome = ShutdownOutcome::WorkerFailed;
        }

        if let Some(scheduler) = &self.scheduler {
            self.state.send_replace(ShutdownState::EndingScheduler);
            if let Err(e) = scheduler.end().await {
                error!(component = scheduler.component(), error = %e, "Failed to shut down");
                if outcome == ShutdownOutcome::Ok {
                    outcome = ShutdownOutcome::SchedulerFailed;
                }
            }
        }

        self.state.send_replace(ShutdownState::Done);
        info!(exit_code = outcome.exit_code(), "Shutdown complete");
        outcome
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = terminate.recv() => Ok("SIGTERM"),
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records end calls into a shared log.
    struct Component {
        name: &'static str,
        fail: bool,
        delay: Duration,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Lifecycle for Component {
        fn component(&self) -> &'static str {
            self.name
        }

        async fn end(&self) -> Result<(), ShutdownError> {
            tokio::time::sleep(self.delay).await;
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                Err(ShutdownError::Scheduler(SchedulerError::Task(
                    "refused".to_string(),
                )))
            } else {
                Ok(())
            }
        }
    }

    fn component(
        name: &'static str,
        fail: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<Component> {
        Arc::new(Component {
            name,
            fail,
            delay: Duration::ZERO,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn test_outcomes() {
        let cases = [
            (false, false, ShutdownOutcome::Ok, 0),
            (true, false, ShutdownOutcome::WorkerFailed, 128),
            (false, true, ShutdownOutcome::SchedulerFailed, 128),
            (true, true, ShutdownOutcome::WorkerFailed, 128),
        ];

        for (worker_fails, scheduler_fails, expected, code) in cases {
            let log = Arc::new(Mutex::new(Vec::new()));
            let coordinator = ShutdownCoordinator::new(
                component("worker", worker_fails, &log),
                component("scheduler", scheduler_fails, &log),
            );

            let outcome = coordinator.shutdown().await;
            assert_eq!(outcome, expected);
            assert_eq!(outcome.exit_code(), code);
            assert_eq!(*log.lock().unwrap(), vec!["worker", "scheduler"]);
            assert_eq!(coordinator.state(), ShutdownState::Done);
        }
    }

    #[tokio::test]
    async fn test_single_process_mode() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let coordinator = ShutdownCoordinator::single(component("worker", false, &log));

        assert_eq!(coordinator.shutdown().await, ShutdownOutcome::Ok);
        assert_eq!(*log.lock().unwrap(), vec!["worker"]);
    }

    #[tokio::test]
    async fn test_second_shutdown_is_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = Arc::new(Component {
            name: "worker",
            fail: false,
            delay: Duration::from_millis(20),
            log: log.clone(),
        });
        let coordinator =
            ShutdownCoordinator::new(worker, component("scheduler", true, &log));

        let (first, second) = tokio::join!(coordinator.shutdown(), coordinator.shutdown());
        let third = coordinator.shutdown().await;

        assert_eq!(first, ShutdownOutcome::SchedulerFailed);
        assert_eq!(second, first);
        assert_eq!(third, first);
        assert_eq!(*log.lock().unwrap(), vec!["worker", "scheduler"]);
    }

    #[tokio::test]
    async fn test_state_transitions_are_observable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let coordinator = ShutdownCoordinator::single(component("worker", false, &log));
        let mut rx = coordinator.subscribe();
        assert_eq!(*rx.borrow(), ShutdownState::Running);

        coordinator.shutdown().await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ShutdownState::Done);
    }
}

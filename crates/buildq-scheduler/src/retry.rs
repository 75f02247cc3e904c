//! Retry policy and the decorator that applies it around a perform.

use crate::jobs::{Attempt, JobDefinition, Perform, PerformOutcome};
use buildq_config::RetrySettings;
use buildq_core::{Broker, Job};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Name reported when a job is re-enqueued by the retry decorator.
pub const RETRY_PLUGIN: &str = "retry";

const DEFAULT_RETRY_LIMIT: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of re-attempts after the first failure.
    pub retry_limit: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_attempt: u32, delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    pub fn new(retry_limit: u32, retry_delay: Duration) -> Self {
        Self {
            retry_limit,
            retry_delay,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(settings.limit, settings.delay())
    }

    /// Decide what follows a failed attempt. Attempts are numbered from 1.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt <= self.retry_limit {
            RetryDecision::Retry {
                next_attempt: attempt + 1,
                delay: self.retry_delay,
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded(PerformOutcome),
    /// Failed, and a copy was scheduled for `run_at`.
    Reenqueued {
        next_attempt: u32,
        run_at: DateTime<Utc>,
        reason: String,
    },
    /// Failed with no attempts left.
    Failed { reason: String },
    /// The job could not be run or rescheduled at all.
    Errored { error: String },
}

/// Runs a job definition and turns failures into re-enqueues while
/// attempts remain.
pub struct Retrying {
    perform: Arc<dyn Perform>,
    policy: Option<RetryPolicy>,
    broker: Arc<dyn Broker>,
}

impl Retrying {
    pub fn new(definition: &JobDefinition, broker: Arc<dyn Broker>) -> Self {
        Self {
            perform: definition.perform.clone(),
            policy: definition.retry,
            broker,
        }
    }

    pub async fn run(&self, job: &Job) -> AttemptOutcome {
        let Some(payload) = job.payload() else {
            return AttemptOutcome::Errored {
                error: format!("job {} has no arguments", job),
            };
        };

        let number = job.current_attempt();
        let attempt = Attempt {
            number,
            last: self
                .policy
                .is_none_or(|policy| policy.decide(number) == RetryDecision::GiveUp),
        };

        match self.perform.perform(payload, attempt).await {
            Ok(outcome) => AttemptOutcome::Succeeded(outcome),
            Err(e) => self.on_failure(job, e.to_string()).await,
        }
    }

    async fn on_failure(&self, job: &Job, reason: String) -> AttemptOutcome {
        let Some(policy) = self.policy else {
            return AttemptOutcome::Failed { reason };
        };

        match policy.decide(job.current_attempt()) {
            RetryDecision::Retry {
                next_attempt,
                delay,
            } => {
                let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                let run_at = Utc::now() + delay;
                let next = job.next_attempt(next_attempt);

                match self.broker.enqueue_at(run_at, &next).await {
                    Ok(()) => {
                        debug!(job = %next, run_at = %run_at, "Scheduled retry");
                        AttemptOutcome::Reenqueued {
                            next_attempt,
                            run_at,
                            reason,
                        }
                    }
                    Err(e) => {
                        warn!(job = %job, error = %e, "Failed to schedule retry");
                        AttemptOutcome::Errored {
                            error: format!("failed to re-enqueue after '{}': {}", reason, e),
                        }
                    }
                }
            }
            RetryDecision::GiveUp => AttemptOutcome::Failed { reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use async_trait::async_trait;
    use buildq_core::{BuildId, BuildPayload, Error, JobKind, Result};

    #[derive(Default)]
    struct AlwaysFails {
        seen: std::sync::Mutex<Vec<Attempt>>,
    }

    #[async_trait]
    impl Perform for AlwaysFails {
        async fn perform(&self, _payload: &BuildPayload, attempt: Attempt) -> Result<PerformOutcome> {
            self.seen.lock().unwrap().push(attempt);
            Err(Error::ExecutionFailed("boom".to_string()))
        }
    }

    fn job(attempt: u32) -> Job {
        let mut job = Job::new("builds", JobKind::Start, BuildPayload::new(BuildId::new(42)));
        job.attempt = attempt;
        job
    }

    fn retrying(broker: Arc<InMemoryBroker>, policy: Option<RetryPolicy>) -> Retrying {
        Retrying::new(&JobDefinition::new(Arc::new(AlwaysFails::default()), policy), broker)
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        for attempt in 1..=3 {
            assert_eq!(
                policy.decide(attempt),
                RetryDecision::Retry {
                    next_attempt: attempt + 1,
                    delay: Duration::from_secs(5),
                }
            );
        }
        assert_eq!(policy.decide(4), RetryDecision::GiveUp);
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).decide(1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_from_settings() {
        let policy = RetryPolicy::from_settings(&RetrySettings::default());
        assert_eq!(policy, RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_failure_with_attempts_left_reenqueues() {
        let broker = Arc::new(InMemoryBroker::new());
        let retrying = retrying(broker.clone(), Some(RetryPolicy::new(3, Duration::from_secs(5))));

        let before = Utc::now();
        let outcome = retrying.run(&job(2)).await;

        let AttemptOutcome::Reenqueued {
            next_attempt,
            run_at,
            reason,
        } = outcome
        else {
            panic!("expected a re-enqueue");
        };
        assert_eq!(next_attempt, 3);
        assert!(run_at >= before + chrono::Duration::seconds(5));
        assert!(reason.contains("boom"));

        let delayed = broker.delayed().await;
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].0, run_at.timestamp());
        assert_eq!(delayed[0].1, job(3));
    }

    #[tokio::test]
    async fn test_failure_after_limit_is_terminal() {
        let broker = Arc::new(InMemoryBroker::new());
        let retrying = retrying(broker.clone(), Some(RetryPolicy::new(3, Duration::from_secs(5))));

        let outcome = retrying.run(&job(4)).await;
        assert!(matches!(outcome, AttemptOutcome::Failed { .. }));
        assert!(broker.delayed().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_without_policy_is_terminal() {
        let broker = Arc::new(InMemoryBroker::new());
        let outcome = retrying(broker.clone(), None).run(&job(1)).await;
        assert!(matches!(outcome, AttemptOutcome::Failed { .. }));
        assert!(broker.delayed().await.is_empty());
    }

    #[tokio::test]
    async fn test_perform_learns_whether_another_attempt_follows() {
        let broker = Arc::new(InMemoryBroker::new());
        let perform = Arc::new(AlwaysFails::default());
        let policy = Some(RetryPolicy::new(1, Duration::ZERO));
        let retrying = Retrying::new(&JobDefinition::new(perform.clone(), policy), broker.clone());

        retrying.run(&job(1)).await;
        retrying.run(&job(2)).await;
        Retrying::new(&JobDefinition::new(perform.clone(), None), broker)
            .run(&job(1))
            .await;

        assert_eq!(
            *perform.seen.lock().unwrap(),
            vec![
                Attempt {
                    number: 1,
                    last: false
                },
                Attempt {
                    number: 2,
                    last: true
                },
                Attempt::only(),
            ]
        );
    }

    #[tokio::test]
    async fn test_job_without_arguments_errors() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut empty = job(1);
        empty.args.clear();

        let outcome = retrying(broker, Some(RetryPolicy::default())).run(&empty).await;
        assert!(matches!(outcome, AttemptOutcome::Errored { .. }));
    }
}

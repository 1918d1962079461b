use crate::config::RetryPolicy;
use crate::queue::{BatchQueue, Pending};
use crate::result::{BatchFailure, BatchResult};

/// What happened to the failures of one batch.
#[derive(Debug)]
pub struct RequeueOutcome<T> {
    pub requeued: usize,
    /// Failures that were not put back, either filtered out or out of attempts.
    pub abandoned: Vec<BatchFailure<T>>,
}

/// Pushes retryable failures of a batch back into their queue.
#[derive(Debug, Clone)]
pub struct RetryReinjector {
    policy: RetryPolicy,
}

impl RetryReinjector {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Whether the failure passes the configured error filters. Transport
    /// failures always do.
    pub fn is_retryable<T>(&self, failure: &BatchFailure<T>) -> bool {
        if failure.is_transport() {
            return true;
        }
        if let Some(patterns) = &self.policy.retryable_error_patterns {
            return patterns.iter().any(|p| failure.message.contains(p.as_str()));
        }
        if let Some(patterns) = &self.policy.non_retryable_error_patterns {
            return !patterns.iter().any(|p| failure.message.contains(p.as_str()));
        }
        self.policy.retry_application_errors
    }

    /// Re-queue every retryable failed item of `result` with its attempt
    /// number increased. Successes are never touched.
    pub fn requeue<T: Clone>(
        &self,
        result: &BatchResult<T>,
        queue: &BatchQueue<T>,
    ) -> RequeueOutcome<T> {
        let mut retry = Vec::new();
        let mut abandoned = Vec::new();

        for failure in result.errors.values() {
            let next_attempt = failure.attempt.saturating_add(1);
            if self.is_retryable(failure) && next_attempt < self.policy.max_attempts {
                retry.push(Pending {
                    operation: failure.operation.clone(),
                    attempt: next_attempt,
                });
            } else {
                abandoned.push(failure.clone());
            }
        }

        let requeued = retry.len();
        if requeued > 0 {
            queue.extend_pending(retry);
        }
        RequeueOutcome {
            requeued,
            abandoned,
        }
    }
}

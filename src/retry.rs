//! Retry with exponential backoff over the transient/permanent/fatal taxonomy.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{FailureClass, FailureContext, LoginError, Phase};
use crate::wait::{Budget, Interrupt};

/// Jitter applied to each backoff delay, as a fraction of the delay
pub const JITTER_FRACTION: f64 = 0.15;

/// How often and how patiently to retry a login attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub attempt_count: u32,
    /// Base delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Randomize each delay by ±15%
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_count: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with default timing
    pub fn new(attempt_count: u32) -> Self {
        Self {
            attempt_count,
            ..Default::default()
        }
    }

    /// No retries
    pub fn none() -> Self {
        Self {
            attempt_count: 0,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempt_count.saturating_add(1)
    }

    /// Un-jittered delay before attempt number `attempt` (attempt 0 runs immediately)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delay before attempt number `attempt`, jittered when enabled
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = rng.gen_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION));
        base.mul_f64(factor)
    }

    /// Un-jittered delays before each retry
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.attempt_count).map(|n| self.base_delay(n)).collect()
    }
}

/// Classify an error for retry purposes
pub fn classify(error: &LoginError) -> FailureClass {
    error.class()
}

/// A successful result together with what it took to get there
#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Runs an operation under a [`RetryPolicy`]
pub struct RetryOrchestrator {
    policy: RetryPolicy,
    cancel: CancellationToken,
    /// Limit across all attempts and backoff delays
    deadline: Option<Duration>,
}

impl RetryOrchestrator {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            deadline: None,
        }
    }

    /// Stop retrying once `deadline` has passed since [`run`](Self::run) began
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails non-transiently, the policy is
    /// exhausted or the overall deadline passes.
    ///
    /// The closure receives the zero-based attempt index. Errors leaving this
    /// function carry the attempt count and total elapsed time in their
    /// failure context. Running out of overall time ends in
    /// [`LoginError::Timeout`] and no further attempt starts.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<Retried<T>, LoginError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LoginError>>,
    {
        let started = Instant::now();
        let budget = match self.deadline {
            Some(limit) => Budget::new(self.cancel.clone(), limit),
            None => Budget::unbounded(self.cancel.clone()),
        };
        let total = self.policy.total_attempts();
        let mut attempt = 0u32;
        let mut last_error: Option<LoginError> = None;

        loop {
            match budget.check() {
                Ok(()) => {}
                Err(Interrupt::Cancelled) => return Err(LoginError::Cancelled),
                Err(Interrupt::DeadlineExceeded) => {
                    warn!("Overall time limit reached before attempt {}", attempt + 1);
                    return Err(out_of_time(last_error, attempt, started.elapsed()));
                }
            }

            debug!("Starting attempt {}/{}", attempt + 1, total);
            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("Succeeded after {} attempts", attempt + 1);
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt + 1,
                        elapsed: started.elapsed(),
                    });
                }
                Err(error) => error,
            };

            let class = classify(&error);
            let exhausted = attempt >= self.policy.attempt_count;

            if class != FailureClass::Transient || exhausted {
                if class == FailureClass::Transient {
                    warn!("Giving up after {} attempts: {}", attempt + 1, error);
                } else {
                    debug!("Not retrying {:?} failure: {}", class, error);
                }
                return Err(annotate(error, attempt + 1, started.elapsed()));
            }

            attempt += 1;
            let delay = self.policy.delay(attempt, &mut rand::thread_rng());
            warn!(
                "Attempt {} failed transiently ({}); retrying in {:?}",
                attempt, error, delay
            );

            match budget.sleep(delay).await {
                Ok(()) => {}
                Err(Interrupt::Cancelled) => return Err(LoginError::Cancelled),
                Err(Interrupt::DeadlineExceeded) => {
                    warn!("Overall time limit reached during backoff");
                    return Err(out_of_time(Some(error), attempt, started.elapsed()));
                }
            }
            last_error = Some(error);
        }
    }
}

/// Timeout for an exhausted overall deadline, keeping where the last attempt failed
fn out_of_time(last_error: Option<LoginError>, attempts: u32, elapsed: Duration) -> LoginError {
    let context = match last_error.as_ref().and_then(|e| e.context()) {
        Some(last) => FailureContext {
            reason: format!("overall time limit reached; last attempt failed: {}", last.reason),
            ..last.clone()
        },
        None => FailureContext::new("", Phase::Navigation, "overall time limit reached"),
    };
    annotate(LoginError::Timeout(Box::new(context)), attempts, elapsed)
}

fn annotate(mut error: LoginError, attempts: u32, elapsed: Duration) -> LoginError {
    if let Some(context) = error.context_mut() {
        context.attempts = attempts;
        context.elapsed_ms = elapsed.as_millis() as u64;
    }
    error
}

#[cfg(test)]
#[path = "retry_test.rs"]
mod retry_test;

// Unit tests for retry module

use super::*;
use crate::errors::{FailureContext, PageError, PageErrorKind, Phase};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

fn fast_policy(attempt_count: u32) -> RetryPolicy {
    RetryPolicy::new(attempt_count)
        .with_backoff(1, 5, 2.0)
        .with_jitter(false)
}

fn ctx() -> Box<FailureContext> {
    Box::new(FailureContext::new(
        "https://example.com/login",
        Phase::Detection,
        "test",
    ))
}

#[test]
fn test_default_policy() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.attempt_count, 3);
    assert_eq!(policy.initial_delay_ms, 500);
    assert_eq!(policy.max_delay_ms, 10_000);
    assert_eq!(policy.multiplier, 2.0);
    assert!(policy.jitter);
    assert_eq!(policy.total_attempts(), 4);
}

#[test]
fn test_schedule_grows_and_caps() {
    let policy = RetryPolicy::new(6).with_jitter(false);
    let schedule = policy.schedule();

    assert_eq!(schedule.len(), 6);
    assert_eq!(schedule[0], Duration::from_millis(1000));
    assert_eq!(schedule[1], Duration::from_millis(2000));
    assert_eq!(schedule[2], Duration::from_millis(4000));
    assert_eq!(schedule[3], Duration::from_millis(8000));
    // Capped from here on
    assert_eq!(schedule[4], Duration::from_millis(10_000));
    assert_eq!(schedule[5], Duration::from_millis(10_000));
}

#[test]
fn test_schedule_strictly_increases_below_cap() {
    let policy = RetryPolicy::new(4).with_backoff(100, 60_000, 1.5);
    let schedule = policy.schedule();
    assert!(schedule.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_first_attempt_has_no_delay() {
    let policy = RetryPolicy::default();
    let mut rng = StdRng::seed_from_u64(7);
    assert_eq!(policy.delay(0, &mut rng), Duration::ZERO);
}

#[test]
fn test_jitter_stays_within_bounds() {
    let policy = RetryPolicy::default();
    let mut rng = StdRng::seed_from_u64(42);

    for attempt in 1..=3 {
        let base = policy.base_delay(attempt).as_secs_f64();
        for _ in 0..200 {
            let jittered = policy.delay(attempt, &mut rng).as_secs_f64();
            assert!(jittered >= base * (1.0 - JITTER_FRACTION) - 1e-9);
            assert!(jittered <= base * (1.0 + JITTER_FRACTION) + 1e-9);
        }
    }
}

#[test]
fn test_no_jitter_is_deterministic() {
    let policy = RetryPolicy::default().with_jitter(false);
    let mut rng = StdRng::seed_from_u64(1);
    assert_eq!(policy.delay(2, &mut rng), policy.base_delay(2));
}

#[tokio::test]
async fn test_transient_failure_uses_every_attempt() {
    let orchestrator = RetryOrchestrator::new(fast_policy(3), CancellationToken::new());
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<Retried<()>, LoginError> = orchestrator
        .run(|_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LoginError::Timeout(ctx()))
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let error = result.unwrap_err();
    assert!(matches!(error, LoginError::Timeout(_)));
    assert_eq!(error.context().unwrap().attempts, 4);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let orchestrator = RetryOrchestrator::new(fast_policy(3), CancellationToken::new());
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<Retried<()>, LoginError> = orchestrator
        .run(|_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LoginError::InvalidCredentials(ctx()))
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let error = result.unwrap_err();
    assert!(matches!(error, LoginError::InvalidCredentials(_)));
    assert_eq!(error.context().unwrap().attempts, 1);
}

#[tokio::test]
async fn test_fatal_failure_is_not_retried() {
    let orchestrator = RetryOrchestrator::new(fast_policy(3), CancellationToken::new());
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<Retried<()>, LoginError> = orchestrator
        .run(|_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LoginError::from_page(
                    PageError::new(PageErrorKind::Driver, "invalid session id"),
                    FailureContext::new("https://example.com", Phase::Entry, "driver gone"),
                ))
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.unwrap_err().class(), FailureClass::Fatal);
}

#[tokio::test]
async fn test_success_on_third_attempt() {
    let orchestrator = RetryOrchestrator::new(fast_policy(3), CancellationToken::new());

    let retried = orchestrator
        .run(|attempt| async move {
            if attempt < 2 {
                Err(LoginError::CredentialEntry(ctx()))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();

    assert_eq!(retried.value, 2);
    assert_eq!(retried.attempts, 3);
}

#[tokio::test]
async fn test_zero_retries_runs_once() {
    let orchestrator = RetryOrchestrator::new(RetryPolicy::none(), CancellationToken::new());
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<Retried<()>, LoginError> = orchestrator
        .run(|_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LoginError::Timeout(ctx()))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancellation_interrupts_backoff() {
    let cancel = CancellationToken::new();
    let policy = RetryPolicy::new(5)
        .with_backoff(60_000, 60_000, 1.0)
        .with_jitter(false);
    let orchestrator = RetryOrchestrator::new(policy, cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result: Result<Retried<()>, LoginError> = orchestrator
        .run(|_| async { Err(LoginError::Timeout(ctx())) })
        .await;

    assert!(matches!(result, Err(LoginError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_already_cancelled_never_runs() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let orchestrator = RetryOrchestrator::new(fast_policy(3), cancel);
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<Retried<()>, LoginError> = orchestrator
        .run(|_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

    assert!(matches!(result, Err(LoginError::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_spent_deadline_starts_no_attempt() {
    let orchestrator = RetryOrchestrator::new(fast_policy(3), CancellationToken::new())
        .with_deadline(Some(Duration::ZERO));
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<Retried<()>, LoginError> = orchestrator
        .run(|_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let error = result.unwrap_err();
    assert!(matches!(error, LoginError::Timeout(_)));
    assert_eq!(error.class(), FailureClass::Transient);
    assert_eq!(error.context().unwrap().attempts, 0);
}

#[tokio::test]
async fn test_deadline_during_backoff_stops_retrying() {
    let policy = RetryPolicy::new(5)
        .with_backoff(500, 1_000, 2.0)
        .with_jitter(false);
    let orchestrator = RetryOrchestrator::new(policy, CancellationToken::new())
        .with_deadline(Some(Duration::from_millis(50)));
    let calls = Arc::new(AtomicU32::new(0));

    let started = Instant::now();
    let result: Result<Retried<()>, LoginError> = orchestrator
        .run(|_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LoginError::CredentialEntry(ctx()))
            }
        })
        .await;

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let error = result.unwrap_err();
    assert!(matches!(error, LoginError::Timeout(_)));
    let context = error.context().unwrap();
    assert_eq!(context.attempts, 1);
    assert_eq!(context.phase, Phase::Detection);
    assert!(context.reason.contains("overall time limit"));
}

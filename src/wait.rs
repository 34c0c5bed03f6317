//! Suspension points for poll loops, keystroke pacing and retry backoff.
//!
//! Every wait goes through a [`Budget`], which couples a deadline with the
//! caller's cancellation token so loops stop at the next tick.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Why a wait stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

/// A deadline plus a cancellation signal
#[derive(Debug, Clone)]
pub struct Budget {
    token: CancellationToken,
    started: Instant,
    deadline: Instant,
}

impl Budget {
    pub fn new(token: CancellationToken, limit: Duration) -> Self {
        let started = Instant::now();
        Self {
            token,
            started,
            deadline: started + limit,
        }
    }

    /// A budget that only ends on cancellation
    pub fn unbounded(token: CancellationToken) -> Self {
        // A year is effectively forever for a login attempt
        Self::new(token, Duration::from_secs(365 * 24 * 60 * 60))
    }

    /// A nested budget that ends no later than this one
    pub fn child(&self, limit: Duration) -> Self {
        let started = Instant::now();
        Self {
            token: self.token.clone(),
            started,
            deadline: (started + limit).min(self.deadline),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail if cancelled or past the deadline
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.token.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else if self.is_expired() {
            Err(Interrupt::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// A sleep that would run past the deadline sleeps until the deadline and
    /// then reports [`Interrupt::DeadlineExceeded`].
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        self.check()?;
        let remaining = self.remaining();
        let overruns = duration > remaining;

        tokio::select! {
            _ = tokio::time::sleep(duration.min(remaining)) => {}
            _ = self.token.cancelled() => return Err(Interrupt::Cancelled),
        }

        if overruns {
            Err(Interrupt::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

//! Bounded exponential backoff for waiting on deployment readiness
//!
//! The policy polls a predicate, sleeping between attempts with an interval
//! that grows by a fixed multiplier up to a cap. It gives up once the next
//! sleep would cross the maximum elapsed time or a check outlives what is
//! left of it, and a shutdown signal cuts any sleep or check short.

use crate::error::ScalerError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

/// Configuration for the backoff policy
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Wait after the first failed check (default: 10 seconds)
    pub initial_interval: Duration,
    /// Growth factor applied after every failed check, no jitter (default: 1.0)
    pub multiplier: f64,
    /// Upper bound for a single wait (default: 60 seconds)
    pub max_interval: Duration,
    /// Total time budget before giving up (default: 60 seconds)
    pub max_elapsed_time: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(10),
            multiplier: 1.0,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ScalerError> {
        if self.initial_interval.is_zero() {
            return Err(ScalerError::InvalidConfig(
                "backoff initial interval must be positive".into(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ScalerError::InvalidConfig(format!(
                "backoff multiplier must be at least 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_interval < self.initial_interval {
            return Err(ScalerError::InvalidConfig(
                "backoff max interval is below the initial interval".into(),
            ));
        }
        Ok(())
    }
}

/// Result of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate held before the budget ran out
    Satisfied,
    /// The elapsed-time budget ran out first
    Exhausted,
    /// A shutdown signal interrupted the wait
    Cancelled,
}

impl WaitOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, WaitOutcome::Satisfied)
    }
}

/// Fires a [`ShutdownSignal`]
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation signal observed by backoff waits and the control loop
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Create a connected trigger/signal pair
    pub fn new() -> (ShutdownTrigger, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, ShutdownSignal { rx })
    }

    /// A signal that never fires
    pub fn never() -> ShutdownSignal {
        let (_tx, rx) = watch::channel(false);
        ShutdownSignal { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal has fired; pends forever if it never can
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Trigger dropped without firing
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Exponential backoff driven as a pull-based ticker
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Interval following `current`, grown by the multiplier and capped
    fn next_interval(&self, current: Duration) -> Duration {
        let grown = Duration::try_from_secs_f64(current.as_secs_f64() * self.config.multiplier)
            .unwrap_or(self.config.max_interval);
        grown.min(self.config.max_interval)
    }

    /// Poll `check` until it returns true, the budget runs out, or `shutdown` fires
    ///
    /// The first check runs immediately. Errors from `check` are returned
    /// as-is and end the wait without retrying. A check still pending when
    /// the budget runs out is dropped and the wait reports `Exhausted`.
    pub async fn wait_until<F, Fut, E>(
        &self,
        mut check: F,
        shutdown: &ShutdownSignal,
    ) -> Result<WaitOutcome, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let start = Instant::now();
        let mut interval = self.config.initial_interval;
        let mut attempt = 0u32;

        loop {
            if shutdown.is_triggered() {
                return Ok(WaitOutcome::Cancelled);
            }

            attempt += 1;
            let remaining = self.config.max_elapsed_time.saturating_sub(start.elapsed());
            let satisfied = tokio::select! {
                checked = timeout(remaining, check()) => match checked {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!(
                            attempt,
                            max_elapsed_secs = self.config.max_elapsed_time.as_secs(),
                            "Backoff check outlived the budget"
                        );
                        return Ok(WaitOutcome::Exhausted);
                    }
                },
                _ = shutdown.triggered() => {
                    debug!(attempt, "Backoff check interrupted by shutdown");
                    return Ok(WaitOutcome::Cancelled);
                }
            };
            if satisfied {
                debug!(attempt, elapsed_ms = start.elapsed().as_millis(), "Backoff condition met");
                return Ok(WaitOutcome::Satisfied);
            }

            let elapsed = start.elapsed();
            if elapsed + interval > self.config.max_elapsed_time {
                warn!(
                    attempt,
                    elapsed_secs = elapsed.as_secs(),
                    max_elapsed_secs = self.config.max_elapsed_time.as_secs(),
                    "Backoff budget exhausted"
                );
                return Ok(WaitOutcome::Exhausted);
            }

            debug!(
                attempt,
                next_retry_ms = interval.as_millis(),
                "Condition not met, backing off"
            );

            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.triggered() => {
                    debug!(attempt, "Backoff interrupted by shutdown");
                    return Ok(WaitOutcome::Cancelled);
                }
            }

            interval = self.next_interval(interval);
        }
    }
}

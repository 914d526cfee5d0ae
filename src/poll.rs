//! Bounded backoff primitives.
//!
//! The control plane converges slowly, on the order of tens of minutes for a new cluster. All
//! waiting on the control plane is expressed through `poll_until`, which probes a condition on
//! an exponentially growing interval capped at `max_interval`, and gives up once the deadline
//! passes. Transient failures of individual calls are retried with `retry_transient`, which is
//! bounded by attempts rather than by time.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio::time::Instant;

/// Classification of errors for the purpose of retrying.
pub trait Retryable {
    /// The error is a network or throttling error which may succeed if retried.
    fn is_transient(&self) -> bool;

    /// The error indicates that the awaited resource is simply not there yet.
    fn is_pending(&self) -> bool {
        false
    }
}

/// Backoff and retry budget configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// The first interval to wait between attempts.
    pub initial_interval: Duration,
    /// The factor by which the interval grows after each attempt.
    pub multiplier: f64,
    /// The cap of the interval between attempts.
    pub max_interval: Duration,
    /// The maximum total time to wait for a condition to be met.
    pub deadline: Duration,
    /// The maximum number of attempts of a call failing with transient errors.
    pub max_transient_attempts: u32,
    /// The maximum number of retries of a mutation rejected for presenting a stale version.
    pub max_version_conflict_retries: u32,
}

impl BackoffPolicy {
    /// Build a deterministic exponential backoff from this policy.
    ///
    /// The elapsed time is not bounded here, deadlines are enforced by the callers using the
    /// runtime's clock.
    pub fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff::default();
        backoff.current_interval = self.initial_interval;
        backoff.initial_interval = self.initial_interval;
        backoff.randomization_factor = 0.0;
        backoff.multiplier = self.multiplier;
        backoff.max_interval = self.max_interval;
        backoff.max_elapsed_time = None;
        backoff
    }
}

/// The outcome of a single probe of a polled condition.
#[derive(Debug, PartialEq)]
pub enum Probe<T> {
    /// The condition is met.
    Ready(T),
    /// The condition is not met yet.
    Pending,
}

/// An error returned from `poll_until`.
#[derive(Debug, PartialEq)]
pub enum PollError<E> {
    /// The probe failed with a non-retryable error.
    Failed(E),
    /// The deadline passed before the condition was met.
    DeadlineExceeded { elapsed: Duration, attempts: u32, last_error: Option<E> },
}

/// Poll the given probe until it reports `Probe::Ready`, or until the policy's deadline passes.
///
/// Transient and pending errors returned by the probe are treated as the condition not being met
/// yet. Any other error is returned immediately.
pub async fn poll_until<T, E, F, Fut>(policy: &BackoffPolicy, waiting_for: &'static str, mut probe: F) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, E>>,
    E: Retryable + fmt::Display,
{
    let started = Instant::now();
    let deadline = started + policy.deadline;
    let mut backoff = policy.backoff();
    let (mut attempts, mut last_error) = (0u32, None);
    loop {
        attempts += 1;
        match probe().await {
            Ok(Probe::Ready(val)) => {
                tracing::debug!(waiting_for, attempts, "condition met");
                return Ok(val);
            }
            Ok(Probe::Pending) => tracing::debug!(waiting_for, attempts, "condition not met yet"),
            Err(err) if err.is_transient() || err.is_pending() => {
                tracing::debug!(waiting_for, attempts, error = %err, "retryable error while polling");
                last_error = Some(err);
            }
            Err(err) => return Err(PollError::Failed(err)),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::DeadlineExceeded {
                elapsed: now - started,
                attempts,
                last_error,
            });
        }
        let interval = backoff.next_backoff().unwrap_or(policy.max_interval);
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// Invoke the given operation, retrying transient errors up to the policy's attempt budget.
///
/// Callers are responsible for making the operation idempotent across attempts, usually by
/// reusing the same client request token for every attempt.
pub async fn retry_transient<T, E, F, Fut>(policy: &BackoffPolicy, action: &'static str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    let max_attempts = policy.max_transient_attempts.max(1);
    let mut backoff = policy.backoff();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(val) => return Ok(val),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let interval = backoff.next_backoff().unwrap_or(policy.max_interval);
                tracing::warn!(action, attempt, error = %err, delay_ms = interval.as_millis() as u64, "transient error, retrying");
                tokio::time::sleep(interval).await;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::error!(action, attempt, error = %err, "transient error persisted after max attempts");
                }
                return Err(err);
            }
        }
    }
}

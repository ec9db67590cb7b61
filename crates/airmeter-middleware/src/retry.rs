//! Bounded, jittered exponential backoff.
//!
//! [`retry`] drives an async operation until it succeeds, the attempt budget
//! of the [`BackoffPolicy`] runs out, or the operation reports a
//! [`RetryError::Permanent`] failure.
//!
//! After failed attempt *n* (when attempts remain) the caller sleeps
//! `delay_n + jitter`, where `jitter` is uniform in
//! `[0, delay_n × jitter_fraction)`, and then `delay_{n+1} = delay_n ×
//! multiplier`.  The jitter keeps a fleet of agents that lost the same broker
//! from reconnecting in lockstep.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use airmeter_types::AirError;
use rand::Rng;
use tracing::{info, warn};

use crate::client::{BusClient, BusConnector};

/// Immutable retry schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Wait after the first failed attempt (before jitter).
    pub base_delay: Duration,
    /// Growth factor applied to the delay after every failed attempt.
    pub multiplier: u32,
    /// Total attempts, including the first one.  Zero is treated as one.
    pub max_attempts: u32,
    /// Upper bound of the random jitter as a fraction of the current delay.
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            multiplier: 2,
            max_attempts: 3,
            jitter_fraction: 0.5,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay slept after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay;
        for _ in 1..attempt.max(1) {
            delay = delay.saturating_mul(self.multiplier);
        }
        delay
    }

    fn jitter(&self, delay: Duration) -> Duration {
        let ceiling = delay.mul_f64(self.jitter_fraction.clamp(0.0, 1.0)).as_nanos() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..ceiling))
    }
}

/// Failure classification returned by a retried operation.
///
/// Any error converts into [`RetryError::Transient`] through `?`; wrap it in
/// [`RetryError::Permanent`] to stop retrying immediately.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    Transient(E),
    Permanent(E),
}

impl<E> From<E> for RetryError<E> {
    fn from(e: E) -> Self {
        RetryError::Transient(e)
    }
}

/// Run `operation` under `policy`.
///
/// `operation` receives the 1-based attempt number.  Returns the first
/// success, the wrapped error of a permanent failure, or the last transient
/// error once the budget is spent (no extra attempt is made).
pub async fn retry<T, E, F, Fut>(policy: &BackoffPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RetryError<E>>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(RetryError::Permanent(e)) => {
                warn!(attempt, error = %e, "permanent failure; not retrying");
                return Err(e);
            }
            Err(RetryError::Transient(e)) if attempt >= max_attempts => {
                warn!(attempts = attempt, error = %e, "retry budget exhausted");
                return Err(e);
            }
            Err(RetryError::Transient(e)) => {
                let delay = policy.delay_after(attempt);
                let wait = delay + policy.jitter(delay);
                warn!(
                    attempt,
                    error = %e,
                    wait_ms = wait.as_millis() as u64,
                    "attempt failed; backing off"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

/// Connect to the bus, retrying transient failures under `policy`.
///
/// [`AirError::Config`] (a malformed endpoint) is permanent: retrying cannot
/// fix it.
///
/// # Errors
///
/// Returns the last connection error once the budget is spent.  Callers
/// treat this as fatal to startup.
pub async fn connect_with_retry(
    connector: &dyn BusConnector,
    endpoint: &str,
    identity: &str,
    policy: &BackoffPolicy,
) -> Result<Arc<dyn BusClient>, AirError> {
    let client = retry(policy, move |attempt| async move {
        info!(attempt, endpoint, client_id = identity, "attempting to connect bus client");
        connector
            .connect(endpoint, identity)
            .await
            .map_err(|e| match e {
                AirError::Config(_) => RetryError::Permanent(e),
                other => RetryError::Transient(other),
            })
    })
    .await?;
    info!(endpoint, client_id = identity, "successfully connected bus client");
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use crate::bus::EventBus;
    use crate::client::LocalBusClient;

    /// Fails the first `failures` attempts with a transient error.
    struct FlakyConnector {
        failures: u32,
        attempts: AtomicU32,
    }

    impl FlakyConnector {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                attempts: AtomicU32::new(0),
            }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BusConnector for FlakyConnector {
        async fn connect(&self, _endpoint: &str, identity: &str) -> Result<Arc<dyn BusClient>, AirError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(AirError::Connect(format!("attempt {n} refused")))
            } else {
                Ok(Arc::new(LocalBusClient::new(EventBus::default(), identity)))
            }
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 2,
            max_attempts: 3,
            jitter_fraction: 0.5,
        }
    }

    #[test]
    fn delay_after_doubles() {
        let p = policy();
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_below_fraction() {
        let p = policy();
        for _ in 0..1_000 {
            assert!(p.jitter(Duration::from_millis(100)) < Duration::from_millis(50));
        }
        let none = BackoffPolicy {
            jitter_fraction: 0.0,
            ..p
        };
        assert_eq!(none.jitter(Duration::from_millis(100)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_within_backoff_window() {
        let connector = FlakyConnector::new(2);
        let started = Instant::now();

        let result = connect_with_retry(&connector, "ws://broker", "agent-1", &policy()).await;

        assert!(result.is_ok());
        assert_eq!(connector.attempts(), 3);
        let elapsed = started.elapsed();
        // 100 ms + 200 ms without jitter, at most 150 ms + 300 ms with it.
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(450), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error_without_fourth_attempt() {
        let connector = FlakyConnector::new(u32::MAX);

        let result = connect_with_retry(&connector, "ws://broker", "agent-1", &policy()).await;

        match result {
            Err(AirError::Connect(msg)) => assert!(msg.contains("attempt 3")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected failure"),
        }
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_stops_immediately() {
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), AirError> = retry(&policy(), |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RetryError::Permanent(AirError::Config("bad endpoint".to_string()))) }
        })
        .await;

        assert_eq!(result, Err(AirError::Config("bad endpoint".to_string())));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn question_mark_converts_to_transient() {
        async fn flaky(attempt: u32) -> Result<u32, AirError> {
            if attempt < 2 {
                Err(AirError::Connect("not yet".to_string()))
            } else {
                Ok(attempt)
            }
        }

        let result: Result<u32, AirError> =
            retry(&policy(), |attempt| async move { Ok(flaky(attempt).await?) }).await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempt_budget_still_tries_once() {
        let p = BackoffPolicy {
            max_attempts: 0,
            ..policy()
        };
        let connector = FlakyConnector::new(u32::MAX);
        assert!(connect_with_retry(&connector, "ws://broker", "a", &p).await.is_err());
        assert_eq!(connector.attempts(), 1);
    }
}

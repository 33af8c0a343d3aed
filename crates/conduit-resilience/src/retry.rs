use crate::deadline::Deadline;
use conduit_core::{ConduitError, ConduitResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configures retry behaviour for calls to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff; also the jitter range.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Few attempts with short backoff, for the persistent transport.
    pub fn low_latency() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 50,
            max_delay_ms: 500,
        }
    }

    /// More attempts with a higher ceiling, for the stateless fallback.
    pub fn resilient() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }

    /// Backoff before the attempt following `attempt` (1-based), without jitter.
    ///
    /// `min(max_delay, base_delay * 2^(attempt-1))`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exp));
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Backoff before the attempt following `attempt`, plus jitter.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        self.backoff(attempt) + self.jitter()
    }

    /// Uniform random jitter in `[0, base_delay]`.
    fn jitter(&self) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=self.base_delay_ms))
    }

    /// Run `operation` until it succeeds, attempts run out, `retry_if`
    /// rejects the error, or the next backoff would cross `deadline`.
    ///
    /// The last error is returned on exhaustion.
    pub async fn execute<T, F, Fut, P>(
        &self,
        mut operation: F,
        retry_if: P,
        deadline: Option<Deadline>,
    ) -> ConduitResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ConduitResult<T>>,
        P: Fn(&ConduitError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if deadline.is_some_and(|d| d.is_expired()) {
                return Err(ConduitError::Timeout(format!(
                    "deadline exhausted before attempt {attempt}"
                )));
            }

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !retry_if(&err) {
                debug!(attempt, error = %err, "Non-retryable error");
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(attempt, error = %err, "Retry attempts exhausted");
                return Err(err);
            }

            let delay = self.delay_with_jitter(attempt);
            if let Some(d) = deadline {
                if d.would_exceed(delay) {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        remaining_ms = d.remaining().as_millis() as u64,
                        "Backoff would exceed deadline, failing fast"
                    );
                    return Err(err);
                }
            }

            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retryable error, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// [`RetryPolicy::execute`] with the default predicate (connection and timeout errors).
    pub async fn run<T, F, Fut>(&self, operation: F, deadline: Option<Deadline>) -> ConduitResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ConduitResult<T>>,
    {
        self.execute(operation, ConduitError::is_retryable, deadline)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy(max_attempts: u32, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
        }
    }

    #[test]
    fn backoff_computation() {
        let p = policy(6, 500, 30_000);
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(2), Duration::from_millis(1_000));
        assert_eq!(p.backoff(3), Duration::from_millis(2_000));
        assert_eq!(p.backoff(6), Duration::from_millis(16_000));
        assert_eq!(p.backoff(7), Duration::from_millis(30_000));
        assert_eq!(p.backoff(200), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_is_bounded_by_base_delay() {
        let p = policy(3, 100, 1_000);
        for _ in 0..200 {
            assert!(p.jitter() <= Duration::from_millis(100));
        }
        assert_eq!(policy(3, 0, 0).jitter(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_makes_exactly_max_attempts() {
        let p = policy(3, 1_000, 30_000);
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: ConduitResult<()> = p
            .run(
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(ConduitError::Connection(format!("refused #{n}")))
                },
                None,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_secs(3));
        match result {
            Err(ConduitError::Connection(msg)) => assert_eq!(msg, "refused #3"),
            other => panic!("Expected final Connection error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let p = policy(3, 10, 100);
        let calls = AtomicU32::new(0);
        let result = p
            .run(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ConduitError::Timeout("slow".into()))
                    } else {
                        Ok("rows")
                    }
                },
                None,
            )
            .await;
        assert_eq!(result.unwrap(), "rows");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_stops_immediately() {
        let p = policy(5, 10, 100);
        let calls = AtomicU32::new(0);
        let result: ConduitResult<()> = p
            .run(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ConduitError::Validation("bad payload".into()))
                },
                None,
            )
            .await;
        assert!(matches!(result, Err(ConduitError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_fast_when_backoff_would_cross_deadline() {
        let p = policy(5, 1_000, 30_000);
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let deadline = Deadline::after(Duration::from_millis(1_500));

        let result: ConduitResult<()> = p
            .run(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ConduitError::Connection("down".into()))
                },
                Some(deadline),
            )
            .await;

        assert!(matches!(result, Err(ConduitError::Connection(_))));
        // 1s + jitter fits at most once inside 1.5s; the second backoff (2s+) never does.
        assert!(calls.load(Ordering::SeqCst) <= 2);
        assert!(start.elapsed() < Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn custom_predicate_is_respected() {
        let p = policy(4, 0, 0);
        let calls = AtomicU32::new(0);
        let result: ConduitResult<()> = p
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ConduitError::Timeout("slow".into()))
                },
                |_| false,
                None,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn presets_and_serde_defaults() {
        assert!(RetryPolicy::low_latency().max_attempts < RetryPolicy::resilient().max_attempts);
        assert!(RetryPolicy::low_latency().max_delay_ms < RetryPolicy::resilient().max_delay_ms);
        let p: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 7}"#).unwrap();
        assert_eq!(p.max_attempts, 7);
        assert_eq!(p.base_delay_ms, 500);
    }
}

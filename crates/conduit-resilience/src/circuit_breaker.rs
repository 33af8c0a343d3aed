use crate::deadline::{budget, Deadline};
use chrono::{DateTime, Utc};
use conduit_core::{ConduitError, ConduitResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tunables for a single breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is admitted.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Upper bound for a single wrapped call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_ms() -> u64 {
    30_000
}
fn default_call_timeout_ms() -> u64 {
    10_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// [`Self::recovery_timeout_ms`] as a `Duration`.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// [`Self::call_timeout_ms`] as a `Duration`.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// One probe call decides whether to close or reopen.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Emitted on every state change.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerTransition {
    /// Breaker name.
    pub breaker: String,
    /// State before the change.
    pub from: CircuitState,
    /// State after the change.
    pub to: CircuitState,
    /// Wall-clock time of the change.
    pub at: DateTime<Utc>,
}

/// Point-in-time view of a breaker for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Registry name, e.g. `data:stateless`.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last success while closed.
    pub consecutive_failures: u32,
    /// When the most recent counted failure happened.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// When the circuit last opened, if it is open.
    pub opened_at: Option<DateTime<Utc>>,
    /// Milliseconds until an open breaker admits its probe.
    pub recovery_remaining_ms: Option<u64>,
    /// Calls admitted since creation.
    pub total_calls: u64,
    /// Admitted calls counted as failures.
    pub total_failures: u64,
    /// Calls refused without running the operation.
    pub rejected_calls: u64,
    /// Tunables in effect.
    pub config: CircuitBreakerConfig,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            opened_at: None,
            opened_at_wall: None,
            probe_in_flight: false,
            total_calls: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.opened_at_wall = None;
        self.probe_in_flight = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Three-state circuit breaker.
///
/// Closed passes calls through and counts consecutive failures. Open rejects
/// with [`ConduitError::CircuitOpen`] without running the operation until the
/// recovery timeout elapses; the next call then becomes the single HalfOpen
/// probe. A successful probe closes the circuit, a failed one reopens it.
///
/// Retries are not performed here; compose a [`crate::RetryPolicy`] outside.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    events: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreaker {
    /// A closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            events,
        }
    }

    /// Registry name of this breaker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tunables in effect.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Receive state-transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }

    /// Whether a call issued now would be admitted. Does not change state.
    pub fn is_call_permitted(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .opened_at
                .is_some_and(|t| t.elapsed() >= self.config.recovery_timeout()),
            CircuitState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Run `operation` through the breaker with the configured call timeout.
    pub async fn call<T, F, Fut>(&self, operation: F) -> ConduitResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConduitResult<T>>,
    {
        self.run(self.config.call_timeout(), false, operation).await
    }

    /// Like [`CircuitBreaker::call`], with the call timeout capped by `deadline`.
    ///
    /// An already expired deadline fails with `Timeout` without touching the
    /// breaker, so a caller's exhausted budget is never blamed on the agent.
    pub async fn call_within<T, F, Fut>(
        &self,
        deadline: Option<Deadline>,
        operation: F,
    ) -> ConduitResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConduitResult<T>>,
    {
        if deadline.is_some_and(|d| d.is_expired()) {
            return Err(ConduitError::Timeout(format!(
                "deadline exhausted before '{}' call",
                self.name
            )));
        }
        let call_timeout = self.config.call_timeout();
        let timeout = budget(deadline, call_timeout);
        self.run(timeout, timeout < call_timeout, operation).await
    }

    /// `caller_bound` marks a timeout cut short by the caller's deadline;
    /// when that one fires the call is not counted as a failure.
    async fn run<T, F, Fut>(
        &self,
        timeout: Duration,
        caller_bound: bool,
        operation: F,
    ) -> ConduitResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConduitResult<T>>,
    {
        let admission = self.admit()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };

        let (result, budget_exhausted) = match tokio::time::timeout(timeout, operation()).await {
            Ok(result) => (result, false),
            Err(_) => (
                Err(ConduitError::Timeout(format!(
                    "'{}' call exceeded {}ms",
                    self.name,
                    timeout.as_millis()
                ))),
                caller_bound,
            ),
        };
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(admission),
            Err(ConduitError::Cancelled) => self.release_probe(admission),
            Err(_) if budget_exhausted => {
                debug!(breaker = %self.name, timeout_ms = timeout.as_millis() as u64, "Caller deadline hit, not counted");
                self.release_probe(admission);
            }
            Err(e) => self.record_failure(admission, e),
        }
        result
    }

    fn admit(&self) -> ConduitResult<Admission> {
        let mut transition = None;
        let admitted = {
            let mut inner = self.inner.lock();
            let admitted = match inner.state {
                CircuitState::Closed => Ok(Admission::Normal),
                CircuitState::Open => {
                    let recovered = inner
                        .opened_at
                        .is_some_and(|t| t.elapsed() >= self.config.recovery_timeout());
                    if recovered {
                        inner.state = CircuitState::HalfOpen;
                        inner.probe_in_flight = true;
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        Ok(Admission::Probe)
                    } else {
                        Err(self.open_error())
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        Err(self.open_error())
                    } else {
                        inner.probe_in_flight = true;
                        Ok(Admission::Probe)
                    }
                }
            };
            match admitted {
                Ok(_) => inner.total_calls += 1,
                Err(_) => inner.rejected_calls += 1,
            }
            admitted
        };
        self.publish(transition);
        admitted
    }

    fn record_success(&self, admission: Admission) {
        let mut transition = None;
        {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => inner.consecutive_failures = 0,
                CircuitState::HalfOpen if admission == Admission::Probe => {
                    inner.close();
                    transition = Some((CircuitState::HalfOpen, CircuitState::Closed));
                }
                _ => {}
            }
        }
        self.publish(transition);
    }

    fn record_failure(&self, admission: Admission, error: &ConduitError) {
        let mut transition = None;
        {
            let mut inner = self.inner.lock();
            inner.total_failures += 1;
            inner.last_failure_time = Some(Utc::now());
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.open();
                        transition = Some((CircuitState::Closed, CircuitState::Open));
                    }
                }
                CircuitState::HalfOpen if admission == Admission::Probe => {
                    inner.consecutive_failures += 1;
                    inner.open();
                    transition = Some((CircuitState::HalfOpen, CircuitState::Open));
                }
                _ => {}
            }
        }
        if transition.is_some() {
            warn!(breaker = %self.name, error = %error, "Breaker tripped");
        }
        self.publish(transition);
    }

    fn release_probe(&self, admission: Admission) {
        if admission == Admission::Probe {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.probe_in_flight = false;
            }
        }
    }

    /// Operator override: force the breaker closed and clear its counters.
    pub fn reset(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.close();
            previous
        };
        info!(breaker = %self.name, from = %previous, "Breaker reset by operator");
        if previous != CircuitState::Closed {
            self.publish(Some((previous, CircuitState::Closed)));
        }
    }

    /// Counters and state for the admin surface.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let recovery_remaining_ms = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(t)) => Some(
                self.config
                    .recovery_timeout()
                    .saturating_sub(t.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_time: inner.last_failure_time,
            opened_at: inner.opened_at_wall,
            recovery_remaining_ms,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            config: self.config.clone(),
        }
    }

    fn open_error(&self) -> ConduitError {
        ConduitError::CircuitOpen {
            breaker: self.name.clone(),
        }
    }

    fn publish(&self, transition: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = transition {
            info!(breaker = %self.name, from = %from, to = %to, "Breaker state change");
            // No subscribers is fine.
            let _ = self.events.send(BreakerTransition {
                breaker: self.name.clone(),
                from,
                to,
                at: Utc::now(),
            });
        }
    }
}

/// Frees the probe slot if the probe future is dropped mid-flight.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe(Admission::Probe);
        }
    }
}

/// Named breakers shared by transports and the admin surface.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the breaker registered under `name`, creating it if needed.
    pub fn get_or_create(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return existing.clone();
        }
        self.breakers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config.clone())))
            .clone()
    }

    /// The breaker registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> = self
            .breakers
            .read()
            .values()
            .map(|b| b.snapshot())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Force one breaker closed. Returns `false` if no such breaker exists.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Whether no breaker is registered yet.
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: u32, recovery_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_ms: recovery_ms,
            call_timeout_ms: 1_000,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> ConduitResult<()> {
        breaker
            .call(|| async { Err::<(), _>(ConduitError::Connection("refused".into())) })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_skips_operation() {
        let breaker = CircuitBreaker::new("data:stateless", config(3, 5_000));
        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(ConduitError::Connection(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ConduitError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.snapshot().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter_in_closed() {
        let breaker = CircuitBreaker::new("b", config(3, 5_000));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        breaker.call(|| async { Ok(()) }).await.unwrap();
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_probe_before_recovery_timeout() {
        let breaker = CircuitBreaker::new("b", config(1, 5_000));
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(!breaker.is_call_permitted());
        let result = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(ConduitError::CircuitOpen { .. })));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_while_half_open() {
        let breaker = Arc::new(CircuitBreaker::new("b", config(1, 1_000)));
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(breaker.is_call_permitted());

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_breaker = breaker.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| async move {
                    release_rx.await.ok();
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let rejected = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(rejected, Err(ConduitError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_and_restarts_window() {
        let breaker = CircuitBreaker::new("b", config(1, 1_000));
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!breaker.is_call_permitted());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(breaker.is_call_permitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(
            "slow",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout_ms: 1_000,
                call_timeout_ms: 100,
            },
        );
        let result = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ConduitError::Timeout(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let breaker = Arc::new(CircuitBreaker::new("b", config(1, 1_000)));
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let probe_breaker = breaker.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| async {
                    std::future::pending::<()>().await;
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert!(!breaker.is_call_permitted());
        probe.abort();
        let _ = probe.await;

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_events_and_reset() {
        let breaker = CircuitBreaker::new("viz:persistent", config(1, 60_000));
        let mut events = breaker.subscribe();
        fail(&breaker).await.unwrap_err();
        let event = events.recv().await.unwrap();
        assert_eq!(event.from, CircuitState::Closed);
        assert_eq!(event.to, CircuitState::Open);

        breaker.reset();
        let event = events.recv().await.unwrap();
        assert_eq!(event.to, CircuitState::Closed);
        breaker.call(|| async { Ok(()) }).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_does_not_count() {
        let breaker = CircuitBreaker::new("b", config(1, 1_000));
        let deadline = Deadline::after(Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(20)).await;
        let result = breaker.call_within(Some(deadline), || async { Ok(()) }).await;
        assert!(matches!(result, Err(ConduitError::Timeout(_))));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().total_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_shorter_than_call_timeout_does_not_count() {
        let breaker = CircuitBreaker::new(
            "data:persistent",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout_ms: 1_000,
                call_timeout_ms: 10_000,
            },
        );
        let deadline = Deadline::after(Duration::from_millis(50));
        let result = breaker
            .call_within(Some(deadline), || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ConduitError::Timeout(_))));
        assert_eq!(breaker.state(), CircuitState::Closed);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.total_failures, 0);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cut_probe_frees_slot() {
        let breaker = CircuitBreaker::new("b", config(1, 1_000));
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let deadline = Deadline::after(Duration::from_millis(50));
        let result = breaker
            .call_within(Some(deadline), || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ConduitError::Timeout(_))));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.is_call_permitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_within_long_deadline_still_counts() {
        let breaker = CircuitBreaker::new(
            "slow",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout_ms: 1_000,
                call_timeout_ms: 100,
            },
        );
        let deadline = Deadline::after(Duration::from_secs(60));
        let result = breaker
            .call_within(Some(deadline), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ConduitError::Timeout(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_shares_and_resets() {
        let registry = BreakerRegistry::new();
        let cfg = CircuitBreakerConfig::default();
        let a = registry.get_or_create("nlp:stateless", &cfg);
        let b = registry.get_or_create("nlp:stateless", &cfg);
        assert!(Arc::ptr_eq(&a, &b));
        registry.get_or_create("data:stateless", &cfg);

        let names: Vec<String> = registry.snapshot_all().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["data:stateless", "nlp:stateless"]);
        assert!(registry.reset("nlp:stateless"));
        assert!(!registry.reset("missing"));
    }

    #[test]
    fn test_config_defaults_from_json() {
        let cfg: CircuitBreakerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, CircuitBreakerConfig::default());
        assert_eq!(cfg.recovery_timeout(), Duration::from_secs(30));
    }
}

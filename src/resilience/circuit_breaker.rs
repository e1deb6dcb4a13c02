//! Circuit breaker for downstream dependencies.
//!
//! # States
//! - Closed: normal operation, calls pass through and are counted
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: one trial call decides whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: requests >= volume threshold and error % >= threshold,
//!                both measured over the rolling window
//! Open → Half-Open: after the sleep window, on the next call
//! Half-Open → Closed: trial call succeeds
//! Half-Open → Open: trial call fails or times out
//! ```
//!
//! # Design Decisions
//! - Per-dependency breaker (not global)
//! - Fail fast in Open state, the dependency is never invoked
//! - Single trial in Half-Open; concurrent callers fail fast meanwhile
//! - Timeouts and concurrency rejections count as failures

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::schema::BreakerConfig;
use crate::config::ConfigSnapshot;
use crate::observability::metrics;

/// Number of buckets the rolling window is split into.
const WINDOW_BUCKETS: u32 = 10;

/// Immutable policy for one dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSpec {
    pub name: String,
    pub timeout: Duration,
    pub error_percent_threshold: u32,
    pub request_volume_threshold: u32,
    pub sleep_window: Duration,
    pub max_concurrent_requests: usize,
    pub rolling_window: Duration,
}

impl BreakerSpec {
    /// Policy from the bootstrap defaults.
    pub fn from_defaults(name: impl Into<String>, defaults: &BreakerConfig) -> Self {
        Self {
            name: name.into(),
            timeout: Duration::from_millis(defaults.timeout_ms),
            error_percent_threshold: defaults.error_percent_threshold,
            request_volume_threshold: defaults.request_volume_threshold,
            sleep_window: Duration::from_millis(defaults.sleep_window_ms),
            max_concurrent_requests: defaults.max_concurrent_requests,
            rolling_window: Duration::from_secs(defaults.rolling_window_secs),
        }
    }

    /// Apply `hystrix.command.<name>.*` overrides from the remote snapshot.
    pub fn with_overrides(mut self, snapshot: &ConfigSnapshot) -> Self {
        let key = |property: &str| format!("hystrix.command.{}.{}", self.name, property);

        if let Some(ms) = snapshot.get_u64(&key("timeout")) {
            self.timeout = Duration::from_millis(ms);
        }
        if let Some(v) = snapshot.get_u64(&key("errorPercentThreshold")) {
            self.error_percent_threshold = v.clamp(1, 100) as u32;
        }
        if let Some(v) = snapshot.get_u64(&key("requestVolumeThreshold")) {
            self.request_volume_threshold = v.max(1).min(u32::MAX as u64) as u32;
        }
        if let Some(ms) = snapshot.get_u64(&key("sleepWindow")) {
            self.sleep_window = Duration::from_millis(ms);
        }
        if let Some(v) = snapshot.get_u64(&key("maxConcurrentRequests")) {
            self.max_concurrent_requests = v.max(1) as usize;
        }
        self
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a guarded call did not produce a value.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// Circuit open (or a trial already running): the dependency was not called.
    #[error("dependency '{dependency}' unavailable: circuit open")]
    DependencyUnavailable { dependency: String },

    #[error("call to '{dependency}' timed out after {timeout_ms} ms")]
    Timeout { dependency: String, timeout_ms: u64 },

    #[error("too many concurrent calls to '{dependency}'")]
    Saturated { dependency: String },

    #[error("no circuit breaker configured for '{0}'")]
    UnknownDependency(String),

    #[error("dependency call failed: {0}")]
    Failed(E),
}

impl<E> CallError<E> {
    /// True when the dependency was never invoked.
    pub fn is_fast_fail(&self) -> bool {
        matches!(
            self,
            CallError::DependencyUnavailable { .. }
                | CallError::Saturated { .. }
                | CallError::UnknownDependency(_)
        )
    }
}

/// Point-in-time health of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerHealth {
    pub name: String,
    pub state: CircuitState,
    pub error_percent: u32,
    pub requests: u32,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start: Instant,
    successes: u32,
    failures: u32,
}

/// Success/failure counts over the last `length` of time.
#[derive(Debug)]
struct RollingWindow {
    length: Duration,
    bucket_width: Duration,
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    fn new(length: Duration) -> Self {
        let bucket_width = (length / WINDOW_BUCKETS).max(Duration::from_millis(1));
        Self {
            length,
            bucket_width,
            buckets: VecDeque::with_capacity(WINDOW_BUCKETS as usize + 1),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.duration_since(front.start) >= self.length {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Instant, success: bool) {
        self.prune(now);
        let stale = self
            .buckets
            .back()
            .map(|b| now.duration_since(b.start) >= self.bucket_width)
            .unwrap_or(true);
        if stale {
            self.buckets.push_back(Bucket {
                start: now,
                successes: 0,
                failures: 0,
            });
        }
        if let Some(current) = self.buckets.back_mut() {
            if success {
                current.successes += 1;
            } else {
                current.failures += 1;
            }
        }
    }

    /// (total requests, failures)
    fn totals(&mut self, now: Instant) -> (u32, u32) {
        self.prune(now);
        self.buckets.iter().fold((0, 0), |(total, failed), b| {
            (total + b.successes + b.failures, failed + b.failures)
        })
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }
}

fn error_percent(total: u32, failures: u32) -> u32 {
    if total == 0 {
        0
    } else {
        ((failures as u64 * 100) / total as u64) as u32
    }
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Circuit breaker guarding one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    spec: BreakerSpec,
    core: Mutex<BreakerCore>,
    permits: Arc<Semaphore>,
}

impl CircuitBreaker {
    pub fn new(spec: BreakerSpec) -> Self {
        let permits = Arc::new(Semaphore::new(spec.max_concurrent_requests.max(1)));
        let window = RollingWindow::new(spec.rolling_window);
        metrics::set_breaker_state(&spec.name, CircuitState::Closed);
        Self {
            spec,
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                window,
                opened_at: None,
                trial_in_flight: false,
            }),
            permits,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &BreakerSpec {
        &self.spec
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn health(&self) -> BreakerHealth {
        let mut core = self.lock();
        let (total, failures) = core.window.totals(Instant::now());
        BreakerHealth {
            name: self.spec.name.clone(),
            state: core.state,
            error_percent: error_percent(total, failures),
            requests: total,
        }
    }

    /// Run `call` through the breaker.
    ///
    /// The future is not polled at all when the call fails fast.
    pub async fn call<F, T, E>(&self, call: F) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let _permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.record_rejection();
                return Err(CallError::Saturated {
                    dependency: self.spec.name.clone(),
                });
            }
        };

        let admission = self.admit().ok_or_else(|| CallError::DependencyUnavailable {
            dependency: self.spec.name.clone(),
        })?;
        let mut outcome = OutcomeGuard {
            breaker: self,
            admission,
            settled: false,
        };

        match tokio::time::timeout(self.spec.timeout, call).await {
            Ok(Ok(value)) => {
                outcome.settle(true);
                Ok(value)
            }
            Ok(Err(e)) => {
                outcome.settle(false);
                Err(CallError::Failed(e))
            }
            Err(_) => {
                outcome.settle(false);
                tracing::warn!(
                    dependency = %self.spec.name,
                    timeout_ms = self.spec.timeout.as_millis() as u64,
                    "Dependency call timed out"
                );
                Err(CallError::Timeout {
                    dependency: self.spec.name.clone(),
                    timeout_ms: self.spec.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Decide whether a call may proceed, moving Open → HalfOpen when due.
    fn admit(&self) -> Option<Admission> {
        let now = Instant::now();
        let mut core = self.lock();
        match core.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let due = core
                    .opened_at
                    .map(|at| now.duration_since(at) >= self.spec.sleep_window)
                    .unwrap_or(true);
                if due {
                    self.transition(&mut core, CircuitState::HalfOpen);
                    core.trial_in_flight = true;
                    Some(Admission::Trial)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if core.trial_in_flight {
                    None
                } else {
                    core.trial_in_flight = true;
                    Some(Admission::Trial)
                }
            }
        }
    }

    fn settle(&self, admission: Admission, success: bool) {
        let now = Instant::now();
        let mut core = self.lock();
        match admission {
            Admission::Trial => {
                core.trial_in_flight = false;
                if success {
                    core.window.clear();
                    core.opened_at = None;
                    self.transition(&mut core, CircuitState::Closed);
                } else {
                    core.opened_at = Some(now);
                    self.transition(&mut core, CircuitState::Open);
                }
            }
            Admission::Normal => {
                // Calls admitted before the circuit opened do not count twice.
                if core.state == CircuitState::Closed {
                    core.window.record(now, success);
                    if !success {
                        self.trip_if_unhealthy(&mut core, now);
                    }
                }
            }
        }
    }

    fn record_rejection(&self) {
        let now = Instant::now();
        let mut core = self.lock();
        if core.state == CircuitState::Closed {
            core.window.record(now, false);
            self.trip_if_unhealthy(&mut core, now);
        }
    }

    /// The trial call was dropped before it finished; let the next caller try.
    fn abandon(&self, admission: Admission) {
        if admission == Admission::Trial {
            self.lock().trial_in_flight = false;
        }
    }

    fn trip_if_unhealthy(&self, core: &mut BreakerCore, now: Instant) {
        let (total, failures) = core.window.totals(now);
        if total >= self.spec.request_volume_threshold
            && error_percent(total, failures) >= self.spec.error_percent_threshold
        {
            core.opened_at = Some(now);
            self.transition(core, CircuitState::Open);
        }
    }

    fn transition(&self, core: &mut BreakerCore, next: CircuitState) {
        if core.state == next {
            return;
        }
        let previous = core.state;
        core.state = next;
        tracing::info!(
            dependency = %self.spec.name,
            from = %previous,
            to = %next,
            "Circuit breaker state changed"
        );
        metrics::record_breaker_transition(&self.spec.name, next);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Settles the outcome exactly once, or abandons it if the call is dropped.
struct OutcomeGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl OutcomeGuard<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        self.breaker.settle(self.admission, success);
    }
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon(self.admission);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spec(volume: u32, percent: u32) -> BreakerSpec {
        BreakerSpec {
            name: "quotes-service".to_string(),
            timeout: Duration::from_millis(100),
            error_percent_threshold: percent,
            request_volume_threshold: volume,
            sleep_window: Duration::from_secs(5),
            max_concurrent_requests: 10,
            rolling_window: Duration::from_secs(10),
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CallError<&'static str>> {
        cb.call(async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CallError<&'static str>> {
        cb.call(async { Ok::<(), &'static str>(()) }).await
    }

    /// Remembers the name of every metric registered through it.
    #[derive(Default)]
    struct Registered(std::sync::Mutex<Vec<String>>);

    impl Registered {
        fn names(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn note(&self, key: &::metrics::Key) {
            self.0.lock().unwrap().push(key.name().to_string());
        }
    }

    impl ::metrics::Recorder for Registered {
        fn describe_counter(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}
        fn describe_gauge(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}
        fn describe_histogram(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}

        fn register_counter(&self, key: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Counter {
            self.note(key);
            ::metrics::Counter::noop()
        }

        fn register_gauge(&self, key: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Gauge {
            self.note(key);
            ::metrics::Gauge::noop()
        }

        fn register_histogram(&self, key: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Histogram {
            self.note(key);
            ::metrics::Histogram::noop()
        }
    }

    #[test]
    fn test_construction_sets_gauge_without_transition() {
        let recorder = Registered::default();
        ::metrics::with_local_recorder(&recorder, || {
            let _cb = CircuitBreaker::new(spec(4, 50));
        });
        let names = recorder.names();
        assert!(names.contains(&"account_breaker_state".to_string()));
        assert!(!names.contains(&"account_breaker_transitions_total".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_when_threshold_exceeded() {
        let cb = CircuitBreaker::new(spec(4, 50));

        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);

        // 4 requests, 50% errors
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_volume_never_opens() {
        let cb = CircuitBreaker::new(spec(20, 50));
        for _ in 0..19 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_fails_fast_without_calling() {
        let cb = CircuitBreaker::new(spec(2, 50));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = cb
            .call(async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;

        assert!(matches!(result, Err(CallError::DependencyUnavailable { .. })));
        assert!(result.unwrap_err().is_fast_fail());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_trial_then_close() {
        let cb = Arc::new(CircuitBreaker::new(spec(2, 50)));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        // Trial call parks until released; a concurrent call must fail fast.
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .call(async {
                    let _ = release_rx.await;
                    Ok::<(), &'static str>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(
            succeed(&cb).await,
            Err(CallError::DependencyUnavailable { .. })
        ));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.health().requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(spec(2, 50));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(matches!(
            succeed(&cb).await,
            Err(CallError::DependencyUnavailable { .. })
        ));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(fail(&cb).await, Err(CallError::Failed("boom"))));
        assert_eq!(cb.state(), CircuitState::Open);

        // Cooldown restarts from the failed trial.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(
            succeed(&cb).await,
            Err(CallError::DependencyUnavailable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(spec(1, 100));
        let result = cb
            .call(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<(), &'static str>(())
            })
            .await;

        assert!(matches!(result, Err(CallError::Timeout { timeout_ms: 100, .. })));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_forgets_old_failures() {
        let cb = CircuitBreaker::new(spec(3, 50));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        succeed(&cb).await.unwrap();
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.health().requests, 2);
    }

    #[test]
    fn test_overrides_from_snapshot() {
        use crate::config::{ConfigValue, ServiceIdentity};

        let values = [
            ("hystrix.command.quotes-service.timeout", ConfigValue::Integer(250)),
            ("hystrix.command.quotes-service.sleepWindow", ConfigValue::String("1000".into())),
            ("hystrix.command.imageservice.timeout", ConfigValue::Integer(9)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let snapshot =
            ConfigSnapshot::new(ServiceIdentity::new("accountservice", "", ""), None, values);

        let spec = BreakerSpec::from_defaults("quotes-service", &BreakerConfig::default())
            .with_overrides(&snapshot);
        assert_eq!(spec.timeout, Duration::from_millis(250));
        assert_eq!(spec.sleep_window, Duration::from_millis(1000));
        assert_eq!(spec.error_percent_threshold, 50);
    }
}

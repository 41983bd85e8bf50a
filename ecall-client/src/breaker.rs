//! # Circuit Breaker
//!
//! Purpose: Isolate a failing resource by rejecting calls to it once its
//! failure rate crosses a threshold, then probe it back to health.
//!
//! ## Design Principles
//! 1. **Explicit Registry**: Breakers live in a [`BreakerRegistry`] owned by
//!    whoever needs them; there is no process-wide table.
//! 2. **Per-Name Locking**: The registry lock only covers lookup/create. Each
//!    breaker has its own lock for state decisions, so unrelated names never
//!    contend.
//! 3. **Atomic Hot Path**: Invoke and failure counters are bumped with atomics
//!    outside the decision lock; the wrapped call itself never runs under a
//!    lock.
//! 4. **Window By Reset**: The failure rate is measured since the last reset,
//!    and a closed breaker resets its counters every `reset_interval`.
//!
//! ## State Machine
//!
//! ```text
//!            rate > fail_rate && invokes > minimum
//!   CLOSED ──────────────────────────────────────────> OPEN
//!     ▲                                                 │
//!     │ half_open_duration elapsed                      │ open_duration elapsed
//!     │                                                 ▼
//!     └──────────────────────────────────────────── HALF_OPEN
//!                 (admits a half_open_pass_rate share; may re-trip to OPEN)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ecall_common::config::duration_ms;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Failure ratio above which the breaker opens.
pub const DEFAULT_FAIL_RATE: f64 = 0.5;
/// Share of calls admitted while half-open.
pub const DEFAULT_HALF_OPEN_PASS_RATE: f64 = 0.2;
/// Invocations required before the failure ratio is trusted.
pub const DEFAULT_MINIMUM_INVOKES: u64 = 10;
pub const DEFAULT_OPEN_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_HALF_OPEN_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_RESET_INTERVAL: Duration = Duration::from_secs(60);

/// Thresholds for one named breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub fail_rate: f64,
    pub half_open_pass_rate: f64,
    pub minimum_invokes: u64,
    #[serde(with = "duration_ms")]
    pub open_duration: Duration,
    #[serde(with = "duration_ms")]
    pub half_open_duration: Duration,
    #[serde(with = "duration_ms")]
    pub reset_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            fail_rate: DEFAULT_FAIL_RATE,
            half_open_pass_rate: DEFAULT_HALF_OPEN_PASS_RATE,
            minimum_invokes: DEFAULT_MINIMUM_INVOKES,
            open_duration: DEFAULT_OPEN_DURATION,
            half_open_duration: DEFAULT_HALF_OPEN_DURATION,
            reset_interval: DEFAULT_RESET_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerStatus::Closed => f.write_str("closed"),
            BreakerStatus::Open => f.write_str("open"),
            BreakerStatus::HalfOpen => f.write_str("half-open"),
        }
    }
}

struct BreakerState {
    status: BreakerStatus,
    config: BreakerConfig,
    last_open: Option<Instant>,
    last_half_open: Option<Instant>,
    last_reset: Instant,
}

/// One named breaker record.
pub struct Breaker {
    name: String,
    invoke_count: AtomicU64,
    fail_count: AtomicU64,
    state: Mutex<BreakerState>,
}

impl Breaker {
    fn new(name: &str, config: BreakerConfig) -> Self {
        Breaker {
            name: name.to_string(),
            invoke_count: AtomicU64::new(0),
            fail_count: AtomicU64::new(0),
            state: Mutex::new(BreakerState {
                status: BreakerStatus::Closed,
                config,
                last_open: None,
                last_half_open: None,
                last_reset: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> BreakerStatus {
        self.state.lock().status
    }

    pub fn config(&self) -> BreakerConfig {
        self.state.lock().config.clone()
    }

    /// `(invokes, failures)` since the last reset.
    pub fn counts(&self) -> (u64, u64) {
        (
            self.invoke_count.load(Ordering::Acquire),
            self.fail_count.load(Ordering::Acquire),
        )
    }

    fn reconfigure(&self, config: BreakerConfig) {
        self.state.lock().config = config;
    }

    /// Runs `run` if the breaker admits it; `Ok(None)` when rejected.
    pub async fn call<T, E, F, Fut>(&self, run: F) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            return Ok(None);
        }
        self.run_counted(run).await.map(Some)
    }

    /// Runs `run` if admitted, otherwise `fail`.
    pub async fn call_or_else<T, E, F, Fut, R>(&self, run: F, fail: R) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnOnce() -> Result<T, E>,
    {
        if !self.admit() {
            return fail();
        }
        self.run_counted(run).await
    }

    async fn run_counted<T, E, F, Fut>(&self, run: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.invoke_count.fetch_add(1, Ordering::AcqRel);
        let result = run().await;
        if result.is_err() {
            self.fail_count.fetch_add(1, Ordering::AcqRel);
        }
        self.evaluate();
        result
    }

    /// Applies time-driven transitions and decides whether one call may run.
    fn admit(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();

        if state.status == BreakerStatus::Open {
            let expired = state
                .last_open
                .map_or(true, |opened| now.duration_since(opened) >= state.config.open_duration);
            if !expired {
                debug!(breaker = %self.name, "call rejected by open breaker");
                return false;
            }
            state.status = BreakerStatus::HalfOpen;
            state.last_half_open = Some(now);
            state.last_open = None;
            self.reset_counts();
            warn!(breaker = %self.name, "circuit breaker half-open");
        }

        if state.status == BreakerStatus::HalfOpen {
            let probing_over = state
                .last_half_open
                .map_or(true, |since| now.duration_since(since) >= state.config.half_open_duration);
            if probing_over {
                state.status = BreakerStatus::Closed;
                state.last_half_open = None;
                state.last_reset = now;
                self.reset_counts();
                info!(breaker = %self.name, "circuit breaker closed");
            } else {
                let pass_rate = state.config.half_open_pass_rate.clamp(0.0, 1.0);
                if !rand::thread_rng().gen_bool(pass_rate) {
                    debug!(breaker = %self.name, "call rejected by half-open breaker");
                    return false;
                }
                return true;
            }
        }

        if now.duration_since(state.last_reset) >= state.config.reset_interval {
            state.last_reset = now;
            self.reset_counts();
            info!(breaker = %self.name, "circuit breaker counters reset");
        }
        true
    }

    /// Trips the breaker when the failure ratio crosses the threshold.
    fn evaluate(&self) {
        let mut state = self.state.lock();
        if state.status == BreakerStatus::Open {
            return;
        }
        let (invokes, failures) = self.counts();
        if invokes <= state.config.minimum_invokes {
            return;
        }
        let rate = failures as f64 / invokes as f64;
        if rate > state.config.fail_rate {
            state.status = BreakerStatus::Open;
            state.last_open = Some(Instant::now());
            state.last_half_open = None;
            warn!(breaker = %self.name, invokes, failures, "circuit breaker open");
        }
    }

    fn reset_counts(&self) {
        self.invoke_count.store(0, Ordering::Release);
        self.fail_count.store(0, Ordering::Release);
    }
}

/// Name-keyed set of breakers, created lazily with the registry defaults.
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<Breaker>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        BreakerRegistry::with_defaults(BreakerConfig::default())
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        BreakerRegistry::default()
    }

    pub fn with_defaults(defaults: BreakerConfig) -> Self {
        BreakerRegistry {
            defaults,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `name`, creating it on first use.
    pub fn get(&self, name: &str) -> Arc<Breaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Breaker::new(name, self.defaults.clone())))
            .clone()
    }

    /// Creates `name` with `config`, or replaces the thresholds of an
    /// existing record without touching its state or counters.
    pub fn configure(&self, name: &str, config: BreakerConfig) {
        let existing = {
            let mut breakers = self.breakers.lock();
            match breakers.get(name) {
                Some(breaker) => breaker.clone(),
                None => {
                    breakers.insert(name.to_string(), Arc::new(Breaker::new(name, config)));
                    return;
                }
            }
        };
        existing.reconfigure(config);
    }

    pub fn status(&self, name: &str) -> Option<BreakerStatus> {
        let breaker = self.breakers.lock().get(name).cloned();
        breaker.map(|breaker| breaker.status())
    }

    pub fn len(&self) -> usize {
        self.breakers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// [`Breaker::call`] on the breaker named `name`.
    pub async fn call<T, E, F, Fut>(&self, name: &str, run: F) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get(name).call(run).await
    }

    /// [`Breaker::call_or_else`] on the breaker named `name`.
    pub async fn call_or_else<T, E, F, Fut, R>(&self, name: &str, run: F, fail: R) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnOnce() -> Result<T, E>,
    {
        self.get(name).call_or_else(run, fail).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            open_duration: Duration::from_millis(60),
            half_open_duration: Duration::from_millis(60),
            ..BreakerConfig::default()
        }
    }

    async fn feed(registry: &BreakerRegistry, name: &str, ok: usize, failed: usize) {
        for _ in 0..ok {
            let _ = registry.call(name, || async { Ok::<_, ()>(()) }).await;
        }
        for _ in 0..failed {
            let _ = registry.call(name, || async { Err::<(), _>(()) }).await;
        }
    }

    #[tokio::test]
    async fn eleven_calls_six_failed_opens() {
        let registry = BreakerRegistry::new();
        feed(&registry, "svc.get", 5, 6).await;
        assert_eq!(registry.status("svc.get"), Some(BreakerStatus::Open));
        assert_eq!(registry.get("svc.get").counts(), (11, 6));
    }

    #[tokio::test]
    async fn minimum_invokes_guards_the_ratio() {
        let registry = BreakerRegistry::new();
        feed(&registry, "svc.get", 0, 10).await;
        assert_eq!(registry.status("svc.get"), Some(BreakerStatus::Closed));
        feed(&registry, "svc.get", 0, 1).await;
        assert_eq!(registry.status("svc.get"), Some(BreakerStatus::Open));
    }

    #[tokio::test]
    async fn ratio_at_threshold_stays_closed() {
        let registry = BreakerRegistry::new();
        feed(&registry, "svc.get", 6, 6).await;
        assert_eq!(registry.status("svc.get"), Some(BreakerStatus::Closed));
    }

    #[tokio::test]
    async fn open_breaker_skips_wrapped_call() {
        let registry = BreakerRegistry::with_defaults(fast_config());
        feed(&registry, "svc.get", 5, 6).await;

        let runs = AtomicUsize::new(0);
        for _ in 0..20 {
            let outcome = registry
                .call("svc.get", || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(1)
                })
                .await;
            assert_eq!(outcome, Ok(None));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(registry.get("svc.get").counts(), (11, 6));
    }

    #[tokio::test]
    async fn rejection_runs_fail_callback() {
        let registry = BreakerRegistry::with_defaults(fast_config());
        feed(&registry, "svc.get", 0, 11).await;
        let outcome = registry
            .call_or_else("svc.get", || async { Ok::<_, &str>("ran") }, || Err("rejected"))
            .await;
        assert_eq!(outcome, Err("rejected"));
    }

    #[tokio::test]
    async fn open_expires_into_half_open() {
        let mut config = fast_config();
        config.half_open_pass_rate = 1.0;
        config.half_open_duration = Duration::from_secs(30);
        let registry = BreakerRegistry::with_defaults(config);
        feed(&registry, "svc.get", 0, 11).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let outcome = registry.call("svc.get", || async { Ok::<_, ()>(7) }).await;
        assert_eq!(outcome, Ok(Some(7)));
        assert_eq!(registry.status("svc.get"), Some(BreakerStatus::HalfOpen));
        assert_eq!(registry.get("svc.get").counts(), (1, 0));
    }

    #[tokio::test]
    async fn half_open_can_retrip() {
        let mut config = fast_config();
        config.half_open_pass_rate = 1.0;
        config.half_open_duration = Duration::from_secs(30);
        let registry = BreakerRegistry::with_defaults(config);
        feed(&registry, "svc.get", 0, 11).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        feed(&registry, "svc.get", 0, 11).await;
        assert_eq!(registry.status("svc.get"), Some(BreakerStatus::Open));
    }

    #[tokio::test]
    async fn half_open_rejects_everything_at_zero_pass_rate() {
        let mut config = fast_config();
        config.half_open_pass_rate = 0.0;
        config.half_open_duration = Duration::from_secs(30);
        let registry = BreakerRegistry::with_defaults(config);
        feed(&registry, "svc.get", 0, 11).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        for _ in 0..10 {
            assert_eq!(registry.call("svc.get", || async { Ok::<_, ()>(()) }).await, Ok(None));
        }
        assert_eq!(registry.status("svc.get"), Some(BreakerStatus::HalfOpen));
    }

    #[tokio::test]
    async fn quiet_half_open_closes() {
        let mut config = fast_config();
        config.half_open_pass_rate = 1.0;
        let registry = BreakerRegistry::with_defaults(config);
        feed(&registry, "svc.get", 0, 11).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        feed(&registry, "svc.get", 1, 0).await;
        assert_eq!(registry.status("svc.get"), Some(BreakerStatus::HalfOpen));

        tokio::time::sleep(Duration::from_millis(80)).await;
        feed(&registry, "svc.get", 1, 0).await;
        assert_eq!(registry.status("svc.get"), Some(BreakerStatus::Closed));
        assert_eq!(registry.get("svc.get").counts(), (1, 0));
    }

    #[tokio::test]
    async fn closed_counters_reset_periodically() {
        let mut config = fast_config();
        config.reset_interval = Duration::from_millis(50);
        let registry = BreakerRegistry::with_defaults(config);
        feed(&registry, "svc.get", 0, 8).await;
        tokio::time::sleep(Duration::from_millis(70)).await;

        // The stale failures are gone, so five more cannot trip it.
        feed(&registry, "svc.get", 0, 5).await;
        assert_eq!(registry.status("svc.get"), Some(BreakerStatus::Closed));
        assert_eq!(registry.get("svc.get").counts(), (5, 5));
    }

    #[tokio::test]
    async fn names_are_isolated() {
        let registry = BreakerRegistry::new();
        feed(&registry, "a.x", 0, 11).await;
        feed(&registry, "b.y", 3, 0).await;
        assert_eq!(registry.status("a.x"), Some(BreakerStatus::Open));
        assert_eq!(registry.status("b.y"), Some(BreakerStatus::Closed));
        assert_eq!(registry.status("c.z"), None);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn configure_updates_thresholds_in_place() {
        let registry = BreakerRegistry::new();
        feed(&registry, "svc.get", 0, 3).await;

        let config = BreakerConfig {
            minimum_invokes: 2,
            ..BreakerConfig::default()
        };
        registry.configure("svc.get", config.clone());
        assert_eq!(registry.get("svc.get").config(), config);
        assert_eq!(registry.get("svc.get").counts(), (3, 3));

        feed(&registry, "svc.get", 0, 1).await;
        assert_eq!(registry.status("svc.get"), Some(BreakerStatus::Open));

        registry.configure("fresh.name", config.clone());
        assert_eq!(registry.get("fresh.name").config(), config);
    }

    #[test]
    fn config_from_partial_json() {
        let config: BreakerConfig = serde_json::from_str(r#"{"fail_rate":0.25,"open_duration":1500}"#).unwrap();
        assert_eq!(config.fail_rate, 0.25);
        assert_eq!(config.open_duration, Duration::from_millis(1500));
        assert_eq!(config.minimum_invokes, DEFAULT_MINIMUM_INVOKES);
    }
}

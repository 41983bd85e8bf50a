//! # Call Monitor
//!
//! Per-method counters and a latency histogram for served calls, collected by
//! a middleware and reported (then reset) on a fixed interval.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events cheaply; the
//!    method table lock is only taken to find or create an accumulator.
//! 2. **Fixed Buckets**: Histogram buckets live in a contiguous array.
//! 3. **Report And Reset**: `take_snapshot` swaps the method table out, so
//!    every report covers one interval.
//!
//! ## Notes
//! - A call is an error when the pipeline returned an error, i.e. the response
//!   carries a non-zero `ret`.
//! - Bucket boundaries are expressed in microseconds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ecall_common::error::RpcResult;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::middleware::{Middleware, Next};
use crate::router::RequestContext;

/// Default latency bucket boundaries in microseconds (50us .. 1s).
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 14] = [
    50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000, 1_000_000,
];

/// Default reporting interval.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Snapshot of one method's metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Total number of requests observed.
    pub requests_total: u64,
    /// Requests answered with a non-zero `ret`.
    pub errors_total: u64,
    /// Requests still running when the snapshot was taken.
    pub inflight: u64,
    pub latency: LatencySnapshot,
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    /// Total number of samples.
    pub samples: u64,
    /// Sum of latencies in microseconds.
    pub sum_us: u64,
}

impl LatencySnapshot {
    /// Mean latency in microseconds, 0 without samples.
    pub fn mean_us(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            self.sum_us / self.samples
        }
    }

    /// Upper bound (microseconds) of the bucket holding quantile `q`.
    ///
    /// `None` without samples or when the quantile falls in the overflow
    /// bucket.
    pub fn quantile_us(&self, q: f64) -> Option<u64> {
        if self.samples == 0 {
            return None;
        }
        let rank = ((q.clamp(0.0, 1.0) * self.samples as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (index, count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return self.bounds_us.get(index).copied();
            }
        }
        None
    }
}

/// Counters for one method.
///
/// `Ordering::Relaxed` is enough; fields are read independently.
pub struct Metrics {
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    inflight: AtomicU64,
    latency: LatencyHistogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::with_latency_buckets(DEFAULT_LATENCY_BUCKETS_US.to_vec())
    }
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    /// **Input**: `bounds_us` ascending microsecond thresholds.
    pub fn with_latency_buckets(bounds_us: Vec<u64>) -> Self {
        Metrics {
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            inflight: AtomicU64::new(0),
            latency: LatencyHistogram::new(bounds_us),
        }
    }

    pub fn record_request_start(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_end(&self, latency: Duration) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        self.latency.record(latency);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

/// Fixed-bucket latency histogram.
///
/// Bucket selection is a binary search over the sorted bounds.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// **Output**: histogram with `bounds_us.len() + 1` buckets (last is overflow).
    pub fn new(mut bounds_us: Vec<u64>) -> Self {
        bounds_us.sort_unstable();
        bounds_us.dedup();
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// **Logic**:
    /// 1. Convert to microseconds.
    /// 2. Increment `samples` and add to `sum_us`.
    /// 3. Find the first bucket where `micros <= bound`, otherwise use overflow.
    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);
        let index = self.bounds_us.partition_point(|bound| *bound < micros);
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}

/// Receives one report per interval, keyed by method name.
pub trait MonitorSink: Send + Sync + 'static {
    fn on_report(&self, report: &HashMap<String, MetricsSnapshot>);
}

/// Sink that writes each method's numbers to the log.
pub struct LogSink;

impl MonitorSink for LogSink {
    fn on_report(&self, report: &HashMap<String, MetricsSnapshot>) {
        for (method, snapshot) in report {
            info!(
                method = %method,
                total = snapshot.requests_total,
                errors = snapshot.errors_total,
                inflight = snapshot.inflight,
                mean_us = snapshot.latency.mean_us(),
                p99_us = ?snapshot.latency.quantile_us(0.99),
                "call monitor report"
            );
        }
    }
}

/// Middleware collecting [`Metrics`] per method.
#[derive(Default)]
pub struct CallMonitor {
    methods: Mutex<HashMap<String, Arc<Metrics>>>,
}

impl CallMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(CallMonitor::default())
    }

    fn metrics_for(&self, method: &str) -> Arc<Metrics> {
        let mut methods = self.methods.lock();
        if let Some(metrics) = methods.get(method) {
            return metrics.clone();
        }
        let metrics = Arc::new(Metrics::new());
        methods.insert(method.to_string(), metrics.clone());
        metrics
    }

    /// Current numbers without resetting them.
    pub fn snapshot(&self) -> HashMap<String, MetricsSnapshot> {
        let methods = self.methods.lock();
        methods
            .iter()
            .map(|(method, metrics)| (method.clone(), metrics.snapshot()))
            .collect()
    }

    /// Current numbers; counting restarts from zero.
    pub fn take_snapshot(&self) -> HashMap<String, MetricsSnapshot> {
        let taken = std::mem::take(&mut *self.methods.lock());
        taken
            .into_iter()
            .map(|(method, metrics)| (method, metrics.snapshot()))
            .collect()
    }

    /// Hands `sink` a report every `interval` until the task is aborted.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration, sink: Arc<dyn MonitorSink>) -> JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else { break };
                let report = monitor.take_snapshot();
                sink.on_report(&report);
            }
        })
    }
}

impl Middleware for CallMonitor {
    fn handle<'a>(&'a self, ctx: RequestContext, body: Bytes, next: Next<'a>) -> BoxFuture<'a, RpcResult<Bytes>> {
        Box::pin(async move {
            let metrics = self.metrics_for(ctx.method());
            metrics.record_request_start();
            let started = Instant::now();
            let result = next.run(ctx, body).await;
            metrics.record_request_end(started.elapsed());
            if result.is_err() {
                metrics.record_error();
            }
            result
        })
    }
}

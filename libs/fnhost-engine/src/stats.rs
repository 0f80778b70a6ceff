//! Per-instance statistics.
//!
//! Two views are kept side by side:
//! - a *window* of plain atomics, read by `snapshot()` and drained by
//!   `snapshot_and_reset()` so a periodic scraper sees every increment exactly
//!   once;
//! - cumulative Prometheus collectors registered in the registry handed to the
//!   instance, labeled with the instance's constant label tuple and never reset.
//!
//! The execution loop is the only writer. Readers never block it: counters are
//! lock-free and the exception ring buffers are only touched on failure paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use serde::Serialize;

use crate::error::InstanceError;
use crate::sync::lock;

/// Number of most recent exceptions kept per kind.
pub const MAX_LATEST_EXCEPTIONS: usize = 10;

pub const PROCESSED_TOTAL: &str = "fn_processed_total";
pub const PROCESSED_SUCCESSFULLY_TOTAL: &str = "fn_processed_successfully_total";
pub const SYSTEM_EXCEPTIONS_TOTAL: &str = "fn_system_exceptions_total";
pub const USER_EXCEPTIONS_TOTAL: &str = "fn_user_exceptions_total";
pub const RECEIVED_TOTAL: &str = "fn_received_total";
pub const PROCESS_LATENCY_MS: &str = "fn_process_latency_ms";
pub const LAST_INVOCATION: &str = "fn_last_invocation";
pub const USER_METRIC_PREFIX: &str = "user_metric_";

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Constant label tuple identifying one instance, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsLabels {
    pub tenant: String,
    /// `tenant/namespace`.
    pub namespace: String,
    /// `tenant/namespace/name`.
    pub name: String,
    pub instance_id: String,
    pub cluster: String,
}

impl MetricsLabels {
    fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("tenant".to_string(), self.tenant.clone()),
            ("namespace".to_string(), self.namespace.clone()),
            ("name".to_string(), self.name.clone()),
            ("instance_id".to_string(), self.instance_id.clone()),
            ("cluster".to_string(), self.cluster.clone()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionInfo {
    pub message: String,
    pub ms_since_epoch: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub sum_ms: f64,
}

impl LatencySummary {
    /// Mean latency in milliseconds; 0 when nothing was observed.
    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub processed_successfully: u64,
    pub user_exceptions: u64,
    pub system_exceptions: u64,
    pub latency: LatencySummary,
    pub last_invocation_ms: i64,
    pub latest_user_exceptions: Vec<ExceptionInfo>,
    pub latest_system_exceptions: Vec<ExceptionInfo>,
}

/// Summary of one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DataDigest {
    pub count: f64,
    pub sum: f64,
    pub max: f64,
    pub min: f64,
}

impl DataDigest {
    /// Digest of a single system value: count = sum = max = value, min = 0.
    fn of_value(value: f64) -> Self {
        Self {
            count: value,
            sum: value,
            max: value,
            min: 0.0,
        }
    }

    fn observe(&mut self, value: f64) {
        if self.count == 0.0 {
            self.max = value;
            self.min = value;
        } else {
            self.max = self.max.max(value);
            self.min = self.min.min(value);
        }
        self.count += 1.0;
        self.sum += value;
    }
}

/// Metric name → digest, as returned by the monitoring surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsData {
    pub metrics: BTreeMap<String, DataDigest>,
}

impl MetricsData {
    pub fn from_parts(stats: &StatsSnapshot, user: HashMap<String, DataDigest>) -> Self {
        let mut metrics = BTreeMap::new();
        let mut put = |name: &str, value: f64| {
            metrics.insert(name.to_string(), DataDigest::of_value(value));
        };
        put(PROCESSED_TOTAL, stats.processed as f64);
        put(PROCESSED_SUCCESSFULLY_TOTAL, stats.processed_successfully as f64);
        put(SYSTEM_EXCEPTIONS_TOTAL, stats.system_exceptions as f64);
        put(USER_EXCEPTIONS_TOTAL, stats.user_exceptions as f64);
        put(RECEIVED_TOTAL, stats.received as f64);
        put(PROCESS_LATENCY_MS, stats.latency.mean_ms());
        put(LAST_INVOCATION, stats.last_invocation_ms as f64);
        for (name, digest) in user {
            metrics.insert(format!("{USER_METRIC_PREFIX}{name}"), digest);
        }
        Self { metrics }
    }

    pub fn get(&self, name: &str) -> Option<&DataDigest> {
        self.metrics.get(name)
    }
}

#[derive(Default)]
struct Window {
    received: AtomicU64,
    processed: AtomicU64,
    processed_successfully: AtomicU64,
    user_exceptions: AtomicU64,
    system_exceptions: AtomicU64,
    latency_count: AtomicU64,
    latency_sum_us: AtomicU64,
    last_invocation_ms: AtomicI64,
}

struct Exported {
    registry: Registry,
    received: IntCounter,
    processed: IntCounter,
    processed_successfully: IntCounter,
    user_exceptions: IntCounter,
    system_exceptions: IntCounter,
    latency: Histogram,
    last_invocation: IntGauge,
}

impl Exported {
    fn register(registry: &Registry, labels: &MetricsLabels) -> Result<Self, prometheus::Error> {
        let const_labels = labels.to_map();
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::with_opts(Opts::new(name, help).const_labels(const_labels.clone()))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let received = counter("fnhost_function_received_total", "Records received from the source")?;
        let processed = counter("fnhost_function_processed_total", "Records handed to the function")?;
        let processed_successfully = counter(
            "fnhost_function_processed_successfully_total",
            "Records processed without error",
        )?;
        let user_exceptions = counter("fnhost_function_user_exceptions_total", "Errors raised by user code")?;
        let system_exceptions = counter("fnhost_function_system_exceptions_total", "Fatal instance errors")?;

        let latency = Histogram::with_opts(
            HistogramOpts::new("fnhost_function_process_latency_ms", "Invocation latency in milliseconds")
                .const_labels(const_labels.clone())
                .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
        )?;
        registry.register(Box::new(latency.clone()))?;

        let last_invocation = IntGauge::with_opts(
            Opts::new("fnhost_function_last_invocation", "Epoch millis of the last invocation")
                .const_labels(const_labels),
        )?;
        registry.register(Box::new(last_invocation.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            received,
            processed,
            processed_successfully,
            user_exceptions,
            system_exceptions,
            latency,
            last_invocation,
        })
    }

    fn unregister(&self) {
        let collectors: [Box<dyn prometheus::core::Collector>; 7] = [
            Box::new(self.received.clone()),
            Box::new(self.processed.clone()),
            Box::new(self.processed_successfully.clone()),
            Box::new(self.user_exceptions.clone()),
            Box::new(self.system_exceptions.clone()),
            Box::new(self.latency.clone()),
            Box::new(self.last_invocation.clone()),
        ];
        for c in collectors {
            if let Err(e) = self.registry.unregister(c) {
                tracing::debug!(error = %e, "metric already unregistered");
            }
        }
    }
}

/// Statistics aggregator of one instance.
pub struct FunctionStats {
    window: Window,
    latest_user_exceptions: Mutex<VecDeque<ExceptionInfo>>,
    latest_system_exceptions: Mutex<VecDeque<ExceptionInfo>>,
    exported: Exported,
}

impl FunctionStats {
    /// Create the aggregator and register its collectors in `registry`.
    pub fn new(registry: &Registry, labels: &MetricsLabels) -> Result<Self, InstanceError> {
        Ok(Self {
            window: Window::default(),
            latest_user_exceptions: Mutex::new(VecDeque::with_capacity(MAX_LATEST_EXCEPTIONS)),
            latest_system_exceptions: Mutex::new(VecDeque::with_capacity(MAX_LATEST_EXCEPTIONS)),
            exported: Exported::register(registry, labels)?,
        })
    }

    pub fn incr_received(&self) {
        self.window.received.fetch_add(1, Ordering::Relaxed);
        self.exported.received.inc();
    }

    pub fn incr_processed(&self) {
        self.window.processed.fetch_add(1, Ordering::Relaxed);
        self.exported.processed.inc();
    }

    pub fn incr_processed_successfully(&self) {
        self.window.processed_successfully.fetch_add(1, Ordering::Relaxed);
        self.exported.processed_successfully.inc();
    }

    pub fn add_user_exception(&self, message: impl Into<String>) {
        self.window.user_exceptions.fetch_add(1, Ordering::Relaxed);
        self.exported.user_exceptions.inc();
        push_bounded(&self.latest_user_exceptions, message.into());
    }

    pub fn add_system_exception(&self, message: impl Into<String>) {
        self.window.system_exceptions.fetch_add(1, Ordering::Relaxed);
        self.exported.system_exceptions.inc();
        push_bounded(&self.latest_system_exceptions, message.into());
    }

    pub fn record_latency(&self, elapsed: Duration) {
        self.window.latency_count.fetch_add(1, Ordering::Relaxed);
        self.window
            .latency_sum_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.exported.latency.observe(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn set_last_invocation(&self, ms_since_epoch: i64) {
        self.window.last_invocation_ms.store(ms_since_epoch, Ordering::Relaxed);
        self.exported.last_invocation.set(ms_since_epoch);
    }

    /// Non-destructive read of the current window.
    pub fn snapshot(&self) -> StatsSnapshot {
        let w = &self.window;
        StatsSnapshot {
            received: w.received.load(Ordering::Relaxed),
            processed: w.processed.load(Ordering::Relaxed),
            processed_successfully: w.processed_successfully.load(Ordering::Relaxed),
            user_exceptions: w.user_exceptions.load(Ordering::Relaxed),
            system_exceptions: w.system_exceptions.load(Ordering::Relaxed),
            latency: LatencySummary {
                count: w.latency_count.load(Ordering::Relaxed),
                sum_ms: w.latency_sum_us.load(Ordering::Relaxed) as f64 / 1000.0,
            },
            last_invocation_ms: w.last_invocation_ms.load(Ordering::Relaxed),
            latest_user_exceptions: lock(&self.latest_user_exceptions).iter().cloned().collect(),
            latest_system_exceptions: lock(&self.latest_system_exceptions).iter().cloned().collect(),
        }
    }

    /// Read and clear the window. Each counter is swapped atomically, so an
    /// increment racing with the scrape lands in exactly one window.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let w = &self.window;
        StatsSnapshot {
            received: w.received.swap(0, Ordering::Relaxed),
            processed: w.processed.swap(0, Ordering::Relaxed),
            processed_successfully: w.processed_successfully.swap(0, Ordering::Relaxed),
            user_exceptions: w.user_exceptions.swap(0, Ordering::Relaxed),
            system_exceptions: w.system_exceptions.swap(0, Ordering::Relaxed),
            latency: LatencySummary {
                count: w.latency_count.swap(0, Ordering::Relaxed),
                sum_ms: w.latency_sum_us.swap(0, Ordering::Relaxed) as f64 / 1000.0,
            },
            last_invocation_ms: w.last_invocation_ms.swap(0, Ordering::Relaxed),
            latest_user_exceptions: std::mem::take(&mut *lock(&self.latest_user_exceptions)).into(),
            latest_system_exceptions: std::mem::take(&mut *lock(&self.latest_system_exceptions)).into(),
        }
    }

    pub fn reset(&self) {
        let _ = self.snapshot_and_reset();
    }

    /// Remove the cumulative collectors from the registry.
    pub fn unregister(&self) {
        self.exported.unregister();
    }
}

fn push_bounded(buffer: &Mutex<VecDeque<ExceptionInfo>>, message: String) {
    let mut buf = lock(buffer);
    if buf.len() >= MAX_LATEST_EXCEPTIONS {
        buf.pop_front();
    }
    buf.push_back(ExceptionInfo {
        message,
        ms_since_epoch: now_ms(),
    });
}

/// Metrics recorded by user code through its context, aggregated per name.
#[derive(Default)]
pub struct UserMetrics {
    digests: Mutex<HashMap<String, DataDigest>>,
}

impl UserMetrics {
    pub fn record(&self, name: &str, value: f64) {
        lock(&self.digests).entry(name.to_string()).or_default().observe(value);
    }

    pub fn snapshot(&self) -> HashMap<String, DataDigest> {
        lock(&self.digests).clone()
    }

    pub fn take(&self) -> HashMap<String, DataDigest> {
        std::mem::take(&mut *lock(&self.digests))
    }

    pub fn reset(&self) {
        lock(&self.digests).clear();
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thread_local::ThreadLocal;
use tracing::warn;

use crate::time::Ticker;

/// Per-trace aggregate for one named timer on one thread.
///
/// Mutated only by the trace thread; snapshot readers observe the aggregate
/// fields racily and package them into an immutable [`MetricSnapshot`].
/// Re-entry is tracked with an explicit depth counter so only the outermost
/// start/stop pair records a duration.
pub struct TraceMetric {
    name: Arc<str>,
    total: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    count: AtomicU64,
    current_start_tick: AtomicU64,
    self_nesting_level: AtomicU32,
    first_start: AtomicBool,
}

impl TraceMetric {
    fn new(name: Arc<str>) -> Self {
        TraceMetric {
            name,
            total: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            count: AtomicU64::new(0),
            current_start_tick: AtomicU64::new(0),
            self_nesting_level: AtomicU32::new(0),
            first_start: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self, tick: u64) {
        if self.self_nesting_level.load(Ordering::Relaxed) == 0 {
            self.current_start_tick.store(tick, Ordering::Relaxed);
            self.self_nesting_level.store(1, Ordering::Relaxed);
        } else {
            // re-entry, the clock keeps running from the outermost start
            self.self_nesting_level.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stop(&self, end_tick: u64) {
        let level = self.self_nesting_level.load(Ordering::Relaxed);
        if level == 0 {
            warn!(metric = %self.name, "stop without matching start");
            return;
        }
        self.self_nesting_level.store(level - 1, Ordering::Relaxed);
        if level == 1 {
            let duration =
                end_tick.saturating_sub(self.current_start_tick.load(Ordering::Relaxed));
            self.total.fetch_add(duration, Ordering::Relaxed);
            self.count.fetch_add(1, Ordering::Relaxed);
            if duration < self.min.load(Ordering::Relaxed) {
                self.min.store(duration, Ordering::Relaxed);
            }
            if duration > self.max.load(Ordering::Relaxed) {
                self.max.store(duration, Ordering::Relaxed);
            }
        }
    }

    /// True exactly until [`first_start_seen`](Self::first_start_seen) is
    /// first called. The trace uses this to register each metric in its
    /// per-trace metric list exactly once.
    pub fn is_first_start(&self) -> bool {
        self.first_start.load(Ordering::Relaxed)
    }

    pub fn first_start_seen(&self) {
        self.first_start.store(false, Ordering::Relaxed);
    }

    pub fn self_nesting_level(&self) -> u32 {
        self.self_nesting_level.load(Ordering::Relaxed)
    }

    /// Clears all aggregate state, called by the trace thread at trace end
    /// so the instance can be reused by the next trace on this thread.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.current_start_tick.store(0, Ordering::Relaxed);
        self.self_nesting_level.store(0, Ordering::Relaxed);
        self.first_start.store(true, Ordering::Relaxed);
    }

    /// Immutable copy of the aggregates, each field read once. A metric that
    /// has not yet recorded a stop reports min and max as zero rather than
    /// the min sentinel.
    pub fn snapshot(&self) -> MetricSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);
        let max = self.max.load(Ordering::Relaxed);
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            MetricSnapshot {
                name: self.name.to_string(),
                total,
                min: 0,
                max: 0,
                count,
            }
        } else {
            MetricSnapshot {
                name: self.name.to_string(),
                total,
                min,
                max,
                count,
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub total: u64,
    pub min: u64,
    pub max: u64,
    pub count: u64,
}

/// Process-wide named timer. One instance per advice identity, holding a
/// thread-local [`TraceMetric`] so the instance is reused across traces on
/// the same thread.
pub struct Metric {
    name: Arc<str>,
    ticker: Arc<dyn Ticker>,
    locals: ThreadLocal<Arc<TraceMetric>>,
}

impl Metric {
    fn new(name: Arc<str>, ticker: Arc<dyn Ticker>) -> Self {
        Metric {
            name,
            ticker,
            locals: ThreadLocal::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current thread's aggregate for this metric, created on first use.
    pub fn trace_metric(&self) -> Arc<TraceMetric> {
        self.locals
            .get_or(|| Arc::new(TraceMetric::new(self.name.clone())))
            .clone()
    }

    pub fn start_internal(&self, tick: u64) -> Arc<TraceMetric> {
        let trace_metric = self.trace_metric();
        trace_metric.start(tick);
        trace_metric
    }

    pub fn start_internal_now(&self) -> Arc<TraceMetric> {
        self.start_internal(self.ticker.read())
    }

    pub fn reset_thread_local(&self) {
        if let Some(trace_metric) = self.locals.get() {
            trace_metric.reset();
        }
    }
}

/// Cheap cloneable handle to a registered [`Metric`], the identity plugins
/// cache once per advice.
#[derive(Clone)]
pub struct MetricName(Arc<Metric>);

impl MetricName {
    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl std::ops::Deref for MetricName {
    type Target = Metric;

    fn deref(&self) -> &Metric {
        &self.0
    }
}

/// Process-wide metric lookup, populated lazily and never drained during the
/// process lifetime.
pub struct MetricRegistry {
    ticker: Arc<dyn Ticker>,
    metrics: Mutex<HashMap<String, MetricName>>,
}

impl MetricRegistry {
    pub fn new(ticker: Arc<dyn Ticker>) -> Self {
        MetricRegistry {
            ticker,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn metric(&self, name: &str) -> MetricName {
        let mut metrics = self.metrics.lock();
        if let Some(existing) = metrics.get(name) {
            return existing.clone();
        }
        let metric = MetricName(Arc::new(Metric::new(
            Arc::from(name),
            self.ticker.clone(),
        )));
        metrics.insert(name.to_string(), metric.clone());
        metric
    }
}

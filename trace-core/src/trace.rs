use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::message::MessageSupplier;
use crate::metric::{MetricName, TraceMetric};
use crate::root_span::RootSpan;
use crate::span::Span;
use crate::span_list::SpanIter;
use crate::stack::{MergedStackTree, ThreadSource};
use crate::time::{Clock, Ticker};

/// Deferred username producer, evaluated at snapshot time.
pub trait UsernameSupplier: Send + Sync {
    fn username(&self) -> Option<String>;
}

impl<F> UsernameSupplier for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn username(&self) -> Option<String> {
        self()
    }
}

/// Cancellation handle for a scheduled collaborator. `cancel` is idempotent
/// and best-effort: a concurrently running task must observe trace
/// completion and no-op on its own.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);
}

/// Immutable name/value pair; the attribute list keeps insertion order and
/// replaces in place on a repeated name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TraceAttribute {
    name: String,
    value: Option<String>,
}

impl TraceAttribute {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

/// All data captured for one top-level unit of work.
///
/// Span and metric mutations come from exactly one trace thread; flags,
/// suppliers, attributes and scheduled handles may be written by other
/// threads, and any number of readers observe the whole object concurrently
/// without blocking the writer.
pub struct Trace {
    id: String,
    // ticks cannot be converted into dates, so the start is also kept as
    // wall-clock millis
    start_millis: u64,
    ticker: Arc<dyn Ticker>,
    stuck: AtomicBool,
    error: AtomicBool,
    background: AtomicBool,
    username_supplier: Mutex<Option<Arc<dyn UsernameSupplier>>>,
    attributes: Mutex<Vec<TraceAttribute>>,
    trace_metrics: Mutex<Vec<Arc<TraceMetric>>>,
    // participating metrics, for the end-of-trace thread-local reset
    metrics: Mutex<Vec<MetricName>>,
    root_span: RootSpan,
    merged_stack_tree: MergedStackTree,
    thread: Weak<dyn ThreadSource>,
    capture_stack_trace_handle: Mutex<Option<Arc<dyn Cancellable>>>,
    stuck_marker_handle: Mutex<Option<Arc<dyn Cancellable>>>,
}

impl Trace {
    pub fn new(
        metric: &MetricName,
        message_supplier: Arc<dyn MessageSupplier>,
        clock: &dyn Clock,
        ticker: Arc<dyn Ticker>,
        thread: Weak<dyn ThreadSource>,
    ) -> Self {
        let start_millis = clock.current_time_millis();
        let id = format!("{:x}-{:016x}", start_millis, rand::random::<u64>());
        let start_tick = ticker.read();
        let trace_metric = metric.start_internal(start_tick);
        let root_span = RootSpan::new(message_supplier, trace_metric.clone(), start_tick);
        trace_metric.first_start_seen();
        Trace {
            id,
            start_millis,
            ticker,
            stuck: AtomicBool::new(false),
            error: AtomicBool::new(false),
            background: AtomicBool::new(false),
            username_supplier: Mutex::new(None),
            attributes: Mutex::new(Vec::new()),
            trace_metrics: Mutex::new(vec![trace_metric]),
            metrics: Mutex::new(vec![metric.clone()]),
            root_span,
            merged_stack_tree: MergedStackTree::new(),
            thread,
            capture_stack_trace_handle: Mutex::new(None),
            stuck_marker_handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start_millis(&self) -> u64 {
        self.start_millis
    }

    pub fn start_tick(&self) -> u64 {
        self.root_span.start_tick()
    }

    pub fn end_tick(&self) -> u64 {
        self.root_span.end_tick()
    }

    /// Duration in ticks, still moving for a running trace.
    pub fn duration(&self) -> u64 {
        let end_tick = self.root_span.end_tick();
        if end_tick == 0 {
            self.ticker.read().saturating_sub(self.root_span.start_tick())
        } else {
            end_tick - self.root_span.start_tick()
        }
    }

    pub fn is_completed(&self) -> bool {
        self.root_span.is_completed()
    }

    pub fn is_stuck(&self) -> bool {
        self.stuck.load(Ordering::Relaxed)
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::Relaxed)
    }

    pub fn is_background(&self) -> bool {
        self.background.load(Ordering::Relaxed)
    }

    pub fn set_background(&self) {
        self.background.store(true, Ordering::Relaxed);
    }

    /// Atomically sets the stuck flag, returning the previous value.
    pub fn set_stuck(&self) -> bool {
        self.stuck.swap(true, Ordering::Relaxed)
    }

    pub fn set_username_supplier(&self, supplier: Arc<dyn UsernameSupplier>) {
        *self.username_supplier.lock() = Some(supplier);
    }

    pub fn username_supplier(&self) -> Option<Arc<dyn UsernameSupplier>> {
        self.username_supplier.lock().clone()
    }

    pub fn username(&self) -> Option<String> {
        self.username_supplier().and_then(|s| s.username())
    }

    pub fn put_attribute(&self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        let mut attributes = self.attributes.lock();
        for attribute in attributes.iter_mut() {
            if attribute.name == name {
                attribute.value = value;
                return;
            }
        }
        attributes.push(TraceAttribute { name, value });
    }

    /// Immutable copy of the attribute list in insertion order.
    pub fn attributes(&self) -> Vec<TraceAttribute> {
        self.attributes.lock().clone()
    }

    pub fn trace_metrics(&self) -> Vec<Arc<TraceMetric>> {
        self.trace_metrics.lock().clone()
    }

    pub fn root_span(&self) -> &RootSpan {
        &self.root_span
    }

    pub fn span_count(&self) -> usize {
        self.root_span.span_count()
    }

    pub fn spans(&self) -> SpanIter {
        self.root_span.spans()
    }

    pub fn merged_stack_tree(&self) -> &MergedStackTree {
        &self.merged_stack_tree
    }

    pub fn push_span(
        &self,
        metric: &MetricName,
        message_supplier: Arc<dyn MessageSupplier>,
    ) -> Arc<Span> {
        let start_tick = self.ticker.read();
        let trace_metric = metric.start_internal(start_tick);
        let span = self
            .root_span
            .push_span(start_tick, message_supplier, trace_metric.clone());
        self.register_first_start(metric, &trace_metric);
        span
    }

    /// Zero-duration event span; `error` also latches the trace-level error
    /// flag.
    pub fn add_span(&self, message_supplier: Arc<dyn MessageSupplier>, error: bool) -> Arc<Span> {
        if error {
            self.error.store(true, Ordering::Relaxed);
        }
        self.root_span
            .add_span(self.ticker.read(), message_supplier, error)
    }

    /// Error-flagged event span that leaves the trace-level error flag
    /// alone; that latch belongs to span ends.
    pub fn add_error_span(&self, message_supplier: Arc<dyn MessageSupplier>) -> Arc<Span> {
        self.root_span
            .add_span(self.ticker.read(), message_supplier, true)
    }

    pub fn pop_span(&self, span: &Arc<Span>, end_tick: u64, error: bool) {
        if error {
            self.error.store(true, Ordering::Relaxed);
        }
        self.root_span.pop_span(span, end_tick, error);
        if let Some(trace_metric) = span.trace_metric() {
            trace_metric.stop(end_tick);
        }
    }

    /// Timer-only start with the same first-start bookkeeping as a span
    /// push.
    pub fn start_trace_metric(&self, metric: &MetricName) -> Arc<TraceMetric> {
        let trace_metric = metric.start_internal_now();
        self.register_first_start(metric, &trace_metric);
        trace_metric
    }

    fn register_first_start(&self, metric: &MetricName, trace_metric: &Arc<TraceMetric>) {
        if trace_metric.is_first_start() {
            self.trace_metrics.lock().push(trace_metric.clone());
            trace_metric.first_start_seen();
            self.metrics.lock().push(metric.clone());
        }
    }

    /// Samples the trace thread's stack into the merged tree. A collected
    /// thread source turns this into a no-op.
    pub fn capture_stack_trace(&self) {
        let Some(thread) = self.thread.upgrade() else {
            debug!(id = %self.id, "thread source gone, skipping stack capture");
            return;
        };
        let snapshot = thread.sample();
        self.merged_stack_tree.add_stack_trace(&snapshot);
    }

    /// Trace-thread only, called at trace end.
    pub fn reset_thread_local_metrics(&self) {
        for metric in self.metrics.lock().iter() {
            metric.reset_thread_local();
        }
    }

    pub fn set_capture_stack_trace_handle(&self, handle: Arc<dyn Cancellable>) {
        *self.capture_stack_trace_handle.lock() = Some(handle);
    }

    pub fn capture_stack_trace_handle(&self) -> Option<Arc<dyn Cancellable>> {
        self.capture_stack_trace_handle.lock().clone()
    }

    pub fn set_stuck_marker_handle(&self, handle: Arc<dyn Cancellable>) {
        *self.stuck_marker_handle.lock() = Some(handle);
    }

    pub fn stuck_marker_handle(&self) -> Option<Arc<dyn Cancellable>> {
        self.stuck_marker_handle.lock().clone()
    }

    /// Best-effort cancellation of both scheduled collaborators.
    pub fn cancel_scheduled(&self) {
        if let Some(handle) = self.capture_stack_trace_handle() {
            handle.cancel();
        }
        if let Some(handle) = self.stuck_marker_handle() {
            handle.cancel();
        }
    }
}

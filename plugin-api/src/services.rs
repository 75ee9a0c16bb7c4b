use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use trace_core::{
    Clock, ErrorMessage, Message, MessageSupplier, MetricName, MetricRegistry, Span, StackFrame,
    SystemClock, SystemTicker, ThreadSnapshot, ThreadSource, ThreadState, Ticker, Trace,
    TraceMetric,
};

use crate::config::{ConfigListener, PluginConfig};
use crate::registry::TraceRegistry;

/// Builds the per-thread stack observation seam for newly started traces.
/// The concrete sampling integration is supplied by the host; without one,
/// stack capture on the trace degrades to a no-op.
pub trait ThreadSourceFactory: Send + Sync {
    fn for_current_thread(&self) -> Arc<dyn ThreadSource>;
}

thread_local! {
    // strong reference kept for the lifetime of the thread's active trace;
    // the trace itself only holds a weak one
    static ACTIVE_THREAD_SOURCE: RefCell<Option<Arc<dyn ThreadSource>>> =
        const { RefCell::new(None) };
}

struct Inner {
    ticker: Arc<dyn Ticker>,
    clock: Arc<dyn Clock>,
    config: PluginConfig,
    metrics: MetricRegistry,
    registry: TraceRegistry,
    thread_source_factory: Mutex<Option<Arc<dyn ThreadSourceFactory>>>,
}

/// The primary service handed to plugins. Cheap to clone; plugins cache one
/// instance for the process lifetime.
#[derive(Clone)]
pub struct PluginServices {
    inner: Arc<Inner>,
}

impl PluginServices {
    pub fn new(ticker: Arc<dyn Ticker>, clock: Arc<dyn Clock>) -> Self {
        PluginServices {
            inner: Arc::new(Inner {
                metrics: MetricRegistry::new(ticker.clone()),
                ticker,
                clock,
                config: PluginConfig::new(),
                registry: TraceRegistry::new(),
                thread_source_factory: Mutex::new(None),
            }),
        }
    }

    pub fn with_system_time() -> Self {
        Self::new(Arc::new(SystemTicker), Arc::new(SystemClock))
    }

    pub fn config(&self) -> &PluginConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &TraceRegistry {
        &self.inner.registry
    }

    pub fn ticker(&self) -> &Arc<dyn Ticker> {
        &self.inner.ticker
    }

    pub fn set_thread_source_factory(&self, factory: Arc<dyn ThreadSourceFactory>) {
        *self.inner.thread_source_factory.lock() = Some(factory);
    }

    /// The named timer identity for one advice, registered once and cached
    /// by the plugin.
    pub fn metric_name(&self, name: &str) -> MetricName {
        self.inner.metrics.metric(name)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.is_enabled()
    }

    pub fn string_property(&self, name: &str) -> String {
        self.inner.config.string_property(name)
    }

    pub fn boolean_property(&self, name: &str) -> bool {
        self.inner.config.boolean_property(name)
    }

    pub fn double_property(&self, name: &str) -> Option<f64> {
        self.inner.config.double_property(name)
    }

    pub fn register_config_listener(&self, listener: Arc<dyn ConfigListener>) {
        self.inner.config.register_listener(listener);
    }

    /// Begins a top-level trace if none is active on this thread; otherwise
    /// behaves as [`start_span`](Self::start_span).
    pub fn start_trace(
        &self,
        message_supplier: Arc<dyn MessageSupplier>,
        metric: &MetricName,
    ) -> PluginSpan {
        self.start_trace_internal(message_supplier, metric, false)
    }

    /// As [`start_trace`](Self::start_trace), additionally marking a fresh
    /// trace as background. An already-active trace is left unmarked.
    pub fn start_background_trace(
        &self,
        message_supplier: Arc<dyn MessageSupplier>,
        metric: &MetricName,
    ) -> PluginSpan {
        self.start_trace_internal(message_supplier, metric, true)
    }

    fn start_trace_internal(
        &self,
        message_supplier: Arc<dyn MessageSupplier>,
        metric: &MetricName,
        background: bool,
    ) -> PluginSpan {
        if let Some(trace) = self.inner.registry.current_trace() {
            return self.start_span_on(trace, message_supplier, metric);
        }
        let thread = self.thread_source_for_current_thread();
        let trace = Arc::new(Trace::new(
            metric,
            message_supplier,
            &*self.inner.clock,
            self.inner.ticker.clone(),
            thread,
        ));
        if background {
            trace.set_background();
        }
        self.inner.registry.set_current_trace(trace.clone());
        let root = trace.root_span().root().clone();
        PluginSpan {
            inner: SpanInner::Real {
                services: self.clone(),
                trace,
                span: root,
            },
        }
    }

    fn thread_source_for_current_thread(&self) -> Weak<dyn ThreadSource> {
        let factory = self.inner.thread_source_factory.lock().clone();
        match factory {
            Some(factory) => {
                let source = factory.for_current_thread();
                let weak = Arc::downgrade(&source);
                ACTIVE_THREAD_SOURCE.with(|active| *active.borrow_mut() = Some(source));
                weak
            }
            None => {
                // no sampling integration, hand out an already-dead weak
                let source: Arc<dyn ThreadSource> = Arc::new(UnsampledThread);
                Arc::downgrade(&source)
            }
        }
    }

    /// Pushes a span and starts its metric timer. Over the soft span cap a
    /// dummy span is returned that still drives the timer but leaves the
    /// tree untouched.
    pub fn start_span(
        &self,
        message_supplier: Arc<dyn MessageSupplier>,
        metric: &MetricName,
    ) -> PluginSpan {
        match self.inner.registry.current_trace() {
            Some(trace) => self.start_span_on(trace, message_supplier, metric),
            None => PluginSpan {
                inner: SpanInner::Nop { message_supplier },
            },
        }
    }

    fn start_span_on(
        &self,
        trace: Arc<Trace>,
        message_supplier: Arc<dyn MessageSupplier>,
        metric: &MetricName,
    ) -> PluginSpan {
        if trace.span_count() >= self.inner.config.max_spans() {
            let trace_metric = trace.start_trace_metric(metric);
            PluginSpan {
                inner: SpanInner::Dummy {
                    services: self.clone(),
                    trace,
                    trace_metric,
                    message_supplier,
                },
            }
        } else {
            let span = trace.push_span(metric, message_supplier);
            PluginSpan {
                inner: SpanInner::Real {
                    services: self.clone(),
                    trace,
                    span,
                },
            }
        }
    }

    /// Zero-duration span, silently dropped over the soft cap.
    pub fn add_span(&self, message_supplier: Arc<dyn MessageSupplier>) {
        if let Some(trace) = self.inner.registry.current_trace() {
            if trace.span_count() < self.inner.config.max_spans() {
                trace.add_span(message_supplier, false);
            }
        }
    }

    /// Zero-duration error span. Bypasses the soft cap up to the hard cap
    /// and does not latch the trace-level error flag by itself.
    pub fn add_error_span(&self, error_message: ErrorMessage) {
        if let Some(trace) = self.inner.registry.current_trace() {
            if trace.span_count() < self.inner.config.max_spans() * 2 {
                trace.add_error_span(Message::supplier_of(error_message.into_text()));
            } else {
                debug!(id = %trace.id(), "hard span cap reached, dropping error span");
            }
        }
    }

    /// Re-entrant timer-only start; a no-op handle when no trace is active.
    pub fn start_metric_timer(&self, metric: &MetricName) -> MetricTimer {
        match self.inner.registry.current_trace() {
            Some(trace) => MetricTimer {
                inner: Some((trace.start_trace_metric(metric), self.inner.ticker.clone())),
            },
            None => MetricTimer { inner: None },
        }
    }

    /// Sets the user id on the current trace. Shared across plugins.
    pub fn set_user_id(&self, user_id: Option<String>) {
        if let Some(trace) = self.inner.registry.current_trace() {
            trace.set_username_supplier(Arc::new(move || user_id.clone()));
        }
    }

    /// Adds or replaces an attribute on the current trace.
    pub fn set_trace_attribute(&self, name: impl Into<String>, value: Option<String>) {
        if let Some(trace) = self.inner.registry.current_trace() {
            trace.put_attribute(name, value);
        }
    }

    fn complete_trace(&self, trace: &Arc<Trace>) {
        self.inner.registry.clear_current_trace(trace);
        ACTIVE_THREAD_SOURCE.with(|active| *active.borrow_mut() = None);
        trace.cancel_scheduled();
        trace.reset_thread_local_metrics();
    }
}

struct UnsampledThread;

impl ThreadSource for UnsampledThread {
    fn sample(&self) -> ThreadSnapshot {
        ThreadSnapshot::new(ThreadState::Runnable, Vec::new())
    }
}

enum SpanInner {
    Real {
        services: PluginServices,
        trace: Arc<Trace>,
        span: Arc<Span>,
    },
    /// Over the soft cap: drives the metric timer, leaves the tree alone.
    Dummy {
        services: PluginServices,
        trace: Arc<Trace>,
        trace_metric: Arc<TraceMetric>,
        message_supplier: Arc<dyn MessageSupplier>,
    },
    /// No active trace.
    Nop {
        message_supplier: Arc<dyn MessageSupplier>,
    },
}

/// Handle returned to plugins for every started span; ending it stops the
/// timer and, for the root span, completes the trace.
pub struct PluginSpan {
    inner: SpanInner,
}

impl PluginSpan {
    pub fn message_supplier(&self) -> &Arc<dyn MessageSupplier> {
        match &self.inner {
            SpanInner::Real { span, .. } => span.message_supplier(),
            SpanInner::Dummy {
                message_supplier, ..
            } => message_supplier,
            SpanInner::Nop { message_supplier } => message_supplier,
        }
    }

    pub fn end(self) {
        self.end_internal(None);
    }

    /// Ends the span, capturing the current thread's stack on the span when
    /// it ran for at least `threshold`.
    pub fn end_with_stack_trace(self, threshold: Duration) {
        self.end_internal(Some(threshold));
    }

    /// Ends the span as an error, which also latches the trace-level error
    /// flag. On a dummy span this records an error span up to the hard cap,
    /// with the span's original message supplier.
    pub fn end_with_error(self, _error_message: ErrorMessage) {
        match self.inner {
            SpanInner::Real {
                services,
                trace,
                span,
            } => {
                let end_tick = services.inner.ticker.read();
                trace.pop_span(&span, end_tick, true);
                if trace.is_completed() {
                    services.complete_trace(&trace);
                }
            }
            SpanInner::Dummy {
                services,
                trace,
                trace_metric,
                message_supplier,
            } => {
                trace_metric.stop(services.inner.ticker.read());
                if trace.span_count() < services.inner.config.max_spans() * 2 {
                    trace.add_span(message_supplier, true);
                } else {
                    debug!(id = %trace.id(), "hard span cap reached, dropping error span");
                }
            }
            SpanInner::Nop { .. } => {}
        }
    }

    fn end_internal(self, stack_threshold: Option<Duration>) {
        match self.inner {
            SpanInner::Real {
                services,
                trace,
                span,
            } => {
                let end_tick = services.inner.ticker.read();
                if let Some(threshold) = stack_threshold {
                    let elapsed = end_tick.saturating_sub(span.start_tick());
                    if u128::from(elapsed) >= threshold.as_nanos() {
                        span.set_stack_trace(capture_own_stack());
                    }
                }
                trace.pop_span(&span, end_tick, false);
                if trace.is_completed() {
                    services.complete_trace(&trace);
                }
            }
            SpanInner::Dummy {
                services,
                trace_metric,
                ..
            } => {
                trace_metric.stop(services.inner.ticker.read());
            }
            SpanInner::Nop { .. } => {}
        }
    }
}

/// Timer-only handle from `start_metric_timer`.
pub struct MetricTimer {
    inner: Option<(Arc<TraceMetric>, Arc<dyn Ticker>)>,
}

impl MetricTimer {
    pub fn stop(self) {
        if let Some((trace_metric, ticker)) = self.inner {
            trace_metric.stop(ticker.read());
        }
    }
}

fn capture_own_stack() -> Vec<StackFrame> {
    let backtrace = backtrace::Backtrace::new();
    backtrace
        .frames()
        .iter()
        .flat_map(|frame| frame.symbols())
        .map(|symbol| {
            StackFrame::with_location(
                symbol
                    .name()
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| "<unknown>".to_string()),
                symbol.filename().map(|path| path.display().to_string()),
                symbol.lineno(),
            )
        })
        .collect()
}

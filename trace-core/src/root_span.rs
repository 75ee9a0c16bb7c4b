use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::message::MessageSupplier;
use crate::metric::TraceMetric;
use crate::span::Span;
use crate::span_list::{SpanIter, SpanList};

/// The trace's span tree: creation-order span storage plus the stack of
/// currently open spans.
///
/// Push, pop and add are trace-thread operations; iteration is safe from any
/// thread while the trace thread keeps mutating.
pub struct RootSpan {
    root: Arc<Span>,
    trace_start_tick: u64,
    spans: SpanList,
    stack: Mutex<Vec<Arc<Span>>>,
    // completion tick, 0 while the trace is running
    end_tick: AtomicU64,
}

impl RootSpan {
    pub(crate) fn new(
        message_supplier: Arc<dyn MessageSupplier>,
        trace_metric: Arc<TraceMetric>,
        start_tick: u64,
    ) -> Self {
        let root = Arc::new(Span::new(
            0,
            None,
            0,
            start_tick,
            start_tick,
            message_supplier,
            Some(trace_metric),
        ));
        let spans = SpanList::new();
        spans.push(root.clone());
        RootSpan {
            root: root.clone(),
            trace_start_tick: start_tick,
            spans,
            stack: Mutex::new(vec![root]),
            end_tick: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Arc<Span> {
        &self.root
    }

    pub fn start_tick(&self) -> u64 {
        self.trace_start_tick
    }

    /// 0 while the trace is running; set exactly once when the open-span
    /// stack empties.
    pub fn end_tick(&self) -> u64 {
        self.end_tick.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.end_tick() != 0
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    pub fn spans(&self) -> SpanIter {
        self.spans.iter()
    }

    pub(crate) fn push_span(
        &self,
        start_tick: u64,
        message_supplier: Arc<dyn MessageSupplier>,
        trace_metric: Arc<TraceMetric>,
    ) -> Arc<Span> {
        let mut stack = self.stack.lock();
        let (parent_index, level) = match stack.last() {
            Some(parent) => (Some(parent.index()), parent.level() + 1),
            None => (None, 0),
        };
        let span = Arc::new(Span::new(
            self.spans.len(),
            parent_index,
            level,
            self.trace_start_tick,
            start_tick,
            message_supplier,
            Some(trace_metric),
        ));
        self.spans.push(span.clone());
        stack.push(span.clone());
        span
    }

    /// Pops spans until `span` has been removed. A missed pop by a caller
    /// must not keep the trace permanently open, so unexpected spans on top
    /// are unwound (and logged) rather than surfaced as an error.
    pub(crate) fn pop_span(&self, span: &Arc<Span>, end_tick: u64, error: bool) {
        span.set_end_tick(end_tick);
        if error {
            span.set_error();
        }
        let mut stack = self.stack.lock();
        loop {
            match stack.pop() {
                Some(top) => {
                    if Arc::ptr_eq(&top, span) {
                        break;
                    }
                    warn!(index = top.index(), "unwinding span that was never popped");
                }
                None => {
                    warn!(index = span.index(), "popped span was not on the stack");
                    break;
                }
            }
        }
        if stack.is_empty() {
            self.end_tick.store(end_tick, Ordering::Release);
        }
    }

    /// Zero-duration leaf under the current top of stack; the stack itself
    /// is not modified.
    pub(crate) fn add_span(
        &self,
        tick: u64,
        message_supplier: Arc<dyn MessageSupplier>,
        error: bool,
    ) -> Arc<Span> {
        let stack = self.stack.lock();
        let (parent_index, level) = match stack.last() {
            Some(parent) => (Some(parent.index()), parent.level() + 1),
            None => (None, 0),
        };
        let span = Arc::new(Span::new(
            self.spans.len(),
            parent_index,
            level,
            self.trace_start_tick,
            tick,
            message_supplier,
            None,
        ));
        span.set_end_tick(tick);
        if error {
            span.set_error();
        }
        self.spans.push(span.clone());
        span
    }
}

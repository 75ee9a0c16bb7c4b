use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::message::MessageSupplier;
use crate::metric::TraceMetric;
use crate::stack::StackFrame;

/// One node of the span tree.
///
/// Identity fields are fixed at creation; `end_tick` is written once
/// (0 while active) and `error` is a one-way latch, so readers never need a
/// lock to observe a consistent span.
pub struct Span {
    index: usize,
    parent_index: Option<usize>,
    level: u32,
    start_tick: u64,
    offset: u64,
    end_tick: AtomicU64,
    error: AtomicBool,
    message_supplier: Arc<dyn MessageSupplier>,
    stack_trace: OnceLock<Arc<[StackFrame]>>,
    trace_metric: Option<Arc<TraceMetric>>,
}

impl Span {
    pub(crate) fn new(
        index: usize,
        parent_index: Option<usize>,
        level: u32,
        trace_start_tick: u64,
        start_tick: u64,
        message_supplier: Arc<dyn MessageSupplier>,
        trace_metric: Option<Arc<TraceMetric>>,
    ) -> Self {
        Span {
            index,
            parent_index,
            level,
            start_tick,
            offset: start_tick.saturating_sub(trace_start_tick),
            end_tick: AtomicU64::new(0),
            error: AtomicBool::new(false),
            message_supplier,
            stack_trace: OnceLock::new(),
            trace_metric,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parent_index(&self) -> Option<usize> {
        self.parent_index
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn start_tick(&self) -> u64 {
        self.start_tick
    }

    /// Offset from the trace start tick.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// 0 while the span is still active.
    pub fn end_tick(&self) -> u64 {
        self.end_tick.load(Ordering::Acquire)
    }

    pub(crate) fn set_end_tick(&self, end_tick: u64) {
        self.end_tick.store(end_tick, Ordering::Release);
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::Relaxed)
    }

    pub(crate) fn set_error(&self) {
        self.error.store(true, Ordering::Relaxed);
    }

    pub fn message_supplier(&self) -> &Arc<dyn MessageSupplier> {
        &self.message_supplier
    }

    /// Stack captured when an end-with-stack-trace threshold was exceeded.
    pub fn stack_trace(&self) -> Option<Arc<[StackFrame]>> {
        self.stack_trace.get().cloned()
    }

    pub fn set_stack_trace(&self, frames: Vec<StackFrame>) {
        let _ = self.stack_trace.set(frames.into());
    }

    pub fn trace_metric(&self) -> Option<&Arc<TraceMetric>> {
        self.trace_metric.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn test_offset_relative_to_trace_start() {
        let span = Span::new(3, Some(0), 1, 1000, 1250, Message::supplier_of("s"), None);
        assert_eq!(span.offset(), 250);
        assert_eq!(span.start_tick(), 1250);
        assert_eq!(span.end_tick(), 0);
    }

    #[test]
    fn test_error_latch() {
        let span = Span::new(0, None, 0, 0, 0, Message::supplier_of("s"), None);
        assert!(!span.is_error());
        span.set_error();
        span.set_error();
        assert!(span.is_error());
    }

    #[test]
    fn test_stack_trace_set_once() {
        let span = Span::new(0, None, 0, 0, 0, Message::supplier_of("s"), None);
        assert!(span.stack_trace().is_none());
        span.set_stack_trace(vec![StackFrame::new("a"), StackFrame::new("b")]);
        span.set_stack_trace(vec![StackFrame::new("c")]);
        let frames = span.stack_trace().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].symbol(), "a");
    }
}

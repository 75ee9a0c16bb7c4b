use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::Mutex;

use trace_core::Trace;

thread_local! {
    static CURRENT_TRACE: RefCell<Option<Arc<Trace>>> = const { RefCell::new(None) };
}

/// Tracks the trace active on each thread plus the process-wide set of
/// active traces, in start order, for the stuck-trace watcher and
/// snapshotters to iterate.
pub struct TraceRegistry {
    traces: Mutex<Vec<Arc<Trace>>>,
}

impl TraceRegistry {
    pub fn new() -> Self {
        TraceRegistry {
            traces: Mutex::new(Vec::new()),
        }
    }

    pub fn current_trace(&self) -> Option<Arc<Trace>> {
        CURRENT_TRACE.with(|current| current.borrow().clone())
    }

    pub(crate) fn set_current_trace(&self, trace: Arc<Trace>) {
        self.traces.lock().push(trace.clone());
        CURRENT_TRACE.with(|current| *current.borrow_mut() = Some(trace));
    }

    pub(crate) fn clear_current_trace(&self, trace: &Arc<Trace>) {
        CURRENT_TRACE.with(|current| {
            let mut current = current.borrow_mut();
            if current
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, trace))
            {
                *current = None;
            }
        });
        self.traces.lock().retain(|active| !Arc::ptr_eq(active, trace));
    }

    /// Active traces in start order.
    pub fn active_traces(&self) -> Vec<Arc<Trace>> {
        self.traces.lock().clone()
    }
}

impl Default for TraceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

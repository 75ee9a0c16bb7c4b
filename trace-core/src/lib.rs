pub mod message;
pub mod metric;
pub mod root_span;
pub mod span;
mod span_list;
pub mod stack;
pub mod time;
pub mod trace;

pub use message::{ErrorMessage, Message, MessageSupplier};
pub use metric::{Metric, MetricName, MetricRegistry, MetricSnapshot, TraceMetric};
pub use root_span::RootSpan;
pub use span::Span;
pub use span_list::SpanIter;
pub use stack::{
    MergedStackTree, StackFrame, StackNode, ThreadSnapshot, ThreadSource, ThreadState,
};
pub use time::{Clock, SystemClock, SystemTicker, TestClock, TestTicker, Ticker};
pub use trace::{Cancellable, Trace, TraceAttribute, UsernameSupplier};

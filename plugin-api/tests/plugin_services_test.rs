use std::sync::Arc;
use std::time::Duration;

use rstest::*;

use plugin_api::PluginServices;
use trace_core::{
    Clock, ErrorMessage, Message, StackFrame, TestClock, TestTicker, ThreadSnapshot, ThreadState,
    Ticker,
};

struct Setup {
    ticker: Arc<TestTicker>,
    services: PluginServices,
}

#[fixture]
fn setup() -> Setup {
    let ticker = Arc::new(TestTicker::new(1000));
    let clock = Arc::new(TestClock::new(1_700_000_000_000));
    let services = PluginServices::new(
        ticker.clone() as Arc<dyn Ticker>,
        clock as Arc<dyn Clock>,
    );
    Setup { ticker, services }
}

#[rstest]
fn test_start_trace_and_complete(setup: Setup) {
    let metric = setup.services.metric_name("http request");
    let root = setup
        .services
        .start_trace(Message::supplier_of("GET /"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();
    assert_eq!(setup.services.registry().active_traces().len(), 1);

    setup.ticker.set(2000);
    root.end();
    assert!(trace.is_completed());
    assert_eq!(trace.duration(), 1000);
    assert!(setup.services.registry().current_trace().is_none());
    assert!(setup.services.registry().active_traces().is_empty());
}

#[rstest]
fn test_start_trace_while_active_acts_as_span(setup: Setup) {
    let metric = setup.services.metric_name("http request");
    let root = setup
        .services
        .start_trace(Message::supplier_of("GET /"), &metric);
    let nested = setup
        .services
        .start_trace(Message::supplier_of("inner"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();
    assert_eq!(trace.span_count(), 2);
    assert_eq!(setup.services.registry().active_traces().len(), 1);
    nested.end();
    root.end();
    assert!(trace.is_completed());
}

#[rstest]
fn test_start_span_without_trace_is_noop(setup: Setup) {
    let metric = setup.services.metric_name("m");
    let span = setup
        .services
        .start_span(Message::supplier_of("orphan"), &metric);
    assert_eq!(span.message_supplier().message().text(), "orphan");
    span.end();
    assert!(setup.services.registry().current_trace().is_none());
}

#[rstest]
fn test_background_trace_flag(setup: Setup) {
    let metric = setup.services.metric_name("job");
    let root = setup
        .services
        .start_background_trace(Message::supplier_of("cleanup"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();
    assert!(trace.is_background());
    root.end();
}

#[rstest]
fn test_span_cap_returns_dummy_that_still_times(setup: Setup) {
    setup.services.config().set_max_spans(3);
    let metric = setup.services.metric_name("root");
    let child = setup.services.metric_name("child");
    let root = setup
        .services
        .start_trace(Message::supplier_of("r"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();

    let capped = setup.services.metric_name("capped");
    let a = setup.services.start_span(Message::supplier_of("a"), &child);
    let b = setup.services.start_span(Message::supplier_of("b"), &child);
    assert_eq!(trace.span_count(), 3);

    // over the soft cap now
    setup.ticker.set(1400);
    let dummy = setup.services.start_span(Message::supplier_of("c"), &capped);
    assert_eq!(trace.span_count(), 3);
    setup.ticker.set(1600);
    dummy.end();

    b.end();
    a.end();
    // the dummy still drove its metric timer
    let capped_snapshot = trace
        .trace_metrics()
        .iter()
        .find(|m| m.name() == "capped")
        .unwrap()
        .snapshot();
    assert_eq!(capped_snapshot.count, 1);
    assert_eq!(capped_snapshot.max, 200);
    root.end();
}

#[rstest]
fn test_dummy_end_with_error_records_up_to_hard_cap(setup: Setup) {
    setup.services.config().set_max_spans(2);
    let metric = setup.services.metric_name("root");
    let child = setup.services.metric_name("child");
    let root = setup
        .services
        .start_trace(Message::supplier_of("r"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();

    let a = setup.services.start_span(Message::supplier_of("a"), &child);
    assert_eq!(trace.span_count(), 2);

    // soft cap reached: error ends keep recording until max_spans * 2
    for i in 0..5 {
        let dummy = setup
            .services
            .start_span(Message::supplier_of(format!("d{i}")), &child);
        dummy.end_with_error(ErrorMessage::new("failed"));
    }
    assert_eq!(trace.span_count(), 4);
    assert!(trace.is_error());

    a.end();
    root.end();
}

#[rstest]
fn test_add_span_respects_soft_cap(setup: Setup) {
    setup.services.config().set_max_spans(2);
    let metric = setup.services.metric_name("root");
    let root = setup
        .services
        .start_trace(Message::supplier_of("r"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();

    setup.services.add_span(Message::supplier_of("event 1"));
    setup.services.add_span(Message::supplier_of("event 2"));
    assert_eq!(trace.span_count(), 2);

    // error spans bypass the soft cap up to the hard cap, without latching
    setup.services.add_error_span(ErrorMessage::new("deadline"));
    setup.services.add_error_span(ErrorMessage::new("deadline"));
    setup.services.add_error_span(ErrorMessage::new("deadline"));
    assert_eq!(trace.span_count(), 4);
    assert!(!trace.is_error());

    root.end();
}

#[rstest]
fn test_end_with_error_latches_trace(setup: Setup) {
    let metric = setup.services.metric_name("root");
    let child = setup.services.metric_name("child");
    let root = setup
        .services
        .start_trace(Message::supplier_of("r"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();

    let span = setup.services.start_span(Message::supplier_of("a"), &child);
    span.end_with_error(ErrorMessage::new("boom"));
    assert!(trace.is_error());
    root.end();
}

#[rstest]
fn test_end_with_stack_trace_threshold(setup: Setup) {
    let metric = setup.services.metric_name("root");
    let child = setup.services.metric_name("child");
    let root = setup
        .services
        .start_trace(Message::supplier_of("r"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();

    // too fast, no stack captured
    let quick = setup.services.start_span(Message::supplier_of("q"), &child);
    setup.ticker.advance(10);
    quick.end_with_stack_trace(Duration::from_nanos(1000));

    let slow = setup.services.start_span(Message::supplier_of("s"), &child);
    setup.ticker.advance(5000);
    slow.end_with_stack_trace(Duration::from_nanos(1000));

    let spans: Vec<_> = trace.spans().collect();
    assert!(spans[1].stack_trace().is_none());
    let frames = spans[2].stack_trace().expect("stack captured");
    assert!(!frames.is_empty());
    root.end();
}

#[rstest]
fn test_metric_timer_without_trace_is_noop(setup: Setup) {
    let metric = setup.services.metric_name("m");
    let timer = setup.services.start_metric_timer(&metric);
    setup.ticker.advance(100);
    timer.stop();
    assert_eq!(metric.trace_metric().snapshot().count, 0);
}

#[rstest]
fn test_metric_timer_reentry(setup: Setup) {
    let metric = setup.services.metric_name("root");
    let timed = setup.services.metric_name("work");
    let root = setup
        .services
        .start_trace(Message::supplier_of("r"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();

    setup.ticker.set(1100);
    let outer = setup.services.start_metric_timer(&timed);
    setup.ticker.set(1150);
    let inner = setup.services.start_metric_timer(&timed);
    setup.ticker.set(1200);
    inner.stop();
    setup.ticker.set(1300);
    outer.stop();

    let snapshot = trace
        .trace_metrics()
        .iter()
        .find(|m| m.name() == "work")
        .unwrap()
        .snapshot();
    assert_eq!(snapshot.total, 200);
    assert_eq!(snapshot.count, 1);
    root.end();
}

#[rstest]
fn test_user_id_and_attributes(setup: Setup) {
    let metric = setup.services.metric_name("root");
    let root = setup
        .services
        .start_trace(Message::supplier_of("r"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();

    setup.services.set_user_id(Some("alice".to_string()));
    setup
        .services
        .set_trace_attribute("route", Some("/a".to_string()));
    setup
        .services
        .set_trace_attribute("route", Some("/b".to_string()));

    assert_eq!(trace.username(), Some("alice".to_string()));
    let attributes = trace.attributes();
    assert_eq!(attributes.len(), 1);
    assert_eq!(attributes[0].value(), Some("/b"));
    root.end();
}

#[rstest]
fn test_thread_local_metrics_reset_on_completion(setup: Setup) {
    let metric = setup.services.metric_name("root");
    let root = setup
        .services
        .start_trace(Message::supplier_of("r"), &metric);
    setup.ticker.set(1500);
    root.end();
    // reusable for the next trace on this thread
    let trace_metric = metric.trace_metric();
    assert_eq!(trace_metric.snapshot().count, 0);
    assert!(trace_metric.is_first_start());

    let again = setup
        .services
        .start_trace(Message::supplier_of("r2"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();
    assert_eq!(trace.trace_metrics().len(), 1);
    again.end();
}

#[rstest]
fn test_thread_source_factory_enables_sampling(setup: Setup) {
    struct FixedFactory;
    struct Fixed;
    impl trace_core::ThreadSource for Fixed {
        fn sample(&self) -> ThreadSnapshot {
            ThreadSnapshot::new(
                ThreadState::Runnable,
                vec![StackFrame::new("inner"), StackFrame::new("outer")],
            )
        }
    }
    impl plugin_api::ThreadSourceFactory for FixedFactory {
        fn for_current_thread(&self) -> Arc<dyn trace_core::ThreadSource> {
            Arc::new(Fixed)
        }
    }

    setup
        .services
        .set_thread_source_factory(Arc::new(FixedFactory));
    let metric = setup.services.metric_name("root");
    let root = setup
        .services
        .start_trace(Message::supplier_of("r"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();

    trace.capture_stack_trace();
    assert_eq!(trace.merged_stack_tree().root_nodes().len(), 1);
    root.end();

    // after completion the thread source is released and capture degrades
    trace.capture_stack_trace();
    assert_eq!(trace.merged_stack_tree().root_nodes()[0].sample_count(), 1);
}

#[rstest]
fn test_without_factory_capture_is_noop(setup: Setup) {
    let metric = setup.services.metric_name("root");
    let root = setup
        .services
        .start_trace(Message::supplier_of("r"), &metric);
    let trace = setup.services.registry().current_trace().unwrap();
    trace.capture_stack_trace();
    assert!(trace.merged_stack_tree().is_empty());
    root.end();
}

#[rstest]
fn test_config_reads_through_services(setup: Setup) {
    setup.services.config().set_property(
        "endpoint",
        plugin_api::PropertyValue::String("https://example.invalid".to_string()),
    );
    assert_eq!(
        setup.services.string_property("endpoint"),
        "https://example.invalid"
    );
    assert!(!setup.services.boolean_property("endpoint"));
    assert_eq!(setup.services.double_property("missing"), None);
    assert!(setup.services.is_enabled());
}

// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! # Snapshot Format
//!
//! Stable external representation of a possibly-still-running trace,
//! captured against a chosen monotonic instant.
//!
//! A [`TraceSnapshot`] is built from a live trace without blocking its
//! writer: timings of anything still active are normalized to the capture
//! tick, so the snapshot presents a coherent picture of the trace at that
//! exact instant even while mutation continues. The snapshot then encodes
//! itself through [`ByteStream`] as a single JSON document:
//!
//! ```json
//! { "id": "...", "start": 1700000000000, "stuck": false, "error": false,
//!   "duration": 1500000, "completed": true, "description": "http request",
//!   "username": "alice", "attributes": [{"name":"route","value":"/a"}],
//!   "metrics": [{"name":"http request","total":1500000,"min":1500000,
//!                "max":1500000,"count":1}],
//!   "spans": [ ... ], "mergedStackTree": { ... } }
//! ```
//!
//! The span sequence and the merged stack tree are unbounded, so both are
//! emitted through lazy chunked encoders rather than being materialized.

use std::collections::BTreeMap;
use std::io::{self, Write};

use bon::Builder;
use thiserror::Error;

use trace_core::{MetricSnapshot, Trace};

mod spans;
mod stream;
mod tree;

pub use spans::SpansByteStream;
pub use stream::{ByteStream, Bytes, Chain, TARGET_CHUNK_SIZE};
pub use tree::MergedStackTreeByteStream;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Immutable record of a trace at a capture instant.
///
/// Scalar fields and the small attribute/metric sections are rendered at
/// build time; the span sequence and merged stack tree stay lazy.
#[derive(Builder)]
pub struct TraceSnapshot {
    id: String,
    start: u64,
    stuck: bool,
    error: bool,
    background: bool,
    duration: u64,
    completed: bool,
    description: String,
    username: Option<String>,
    attributes: Option<String>,
    metrics: Option<String>,
    spans: Option<SpansByteStream>,
    #[builder(default)]
    span_stack_traces: BTreeMap<String, String>,
    merged_stack_tree: Option<MergedStackTreeByteStream>,
}

impl TraceSnapshot {
    /// Captures `trace` against `capture_tick`.
    ///
    /// A trace counts as completed only when its end tick is set and lies
    /// at or before the capture tick; otherwise the duration is normalized
    /// to the capture tick and the trace is reported as still running.
    pub fn from(
        trace: &Trace,
        capture_tick: u64,
        include_detail: bool,
    ) -> Result<TraceSnapshot, SnapshotError> {
        let end_tick = trace.end_tick();
        let (duration, completed) = if end_tick != 0 && end_tick <= capture_tick {
            (end_tick - trace.start_tick(), true)
        } else {
            (capture_tick.saturating_sub(trace.start_tick()), false)
        };
        let description = trace
            .root_span()
            .root()
            .message_supplier()
            .message()
            .into_text();
        let attributes = trace.attributes();
        let attributes_json = if attributes.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&attributes)?)
        };
        let (spans, span_stack_traces, merged_stack_tree) = if include_detail {
            (
                Some(SpansByteStream::new(trace.spans(), capture_tick)),
                collect_span_stack_traces(trace, capture_tick)?,
                MergedStackTreeByteStream::from_tree(trace.merged_stack_tree()),
            )
        } else {
            (None, BTreeMap::new(), None)
        };
        Ok(TraceSnapshot::builder()
            .id(trace.id().to_string())
            .start(trace.start_millis())
            .stuck(trace.is_stuck() && !trace.is_completed())
            .error(trace.is_error())
            .background(trace.is_background())
            .duration(duration)
            .completed(completed)
            .description(description)
            .maybe_username(trace.username())
            .maybe_attributes(attributes_json)
            .maybe_metrics(metrics_json(trace)?)
            .maybe_spans(spans)
            .span_stack_traces(span_stack_traces)
            .maybe_merged_stack_tree(merged_stack_tree)
            .build())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn is_stuck(&self) -> bool {
        self.stuck
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn duration(&self) -> u64 {
        self.duration
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Deduplicated per-span stack traces, keyed by the content hash that
    /// span records reference. Emitted alongside the snapshot document.
    pub fn span_stack_traces(&self) -> &BTreeMap<String, String> {
        &self.span_stack_traces
    }

    /// Renders the snapshot as one JSON document in lazy chunks.
    pub fn into_byte_stream(
        self,
        include_detail: bool,
    ) -> Result<Box<dyn ByteStream>, SnapshotError> {
        let mut streams: Vec<Box<dyn ByteStream>> = Vec::new();
        let mut head: Vec<u8> = Vec::new();
        head.extend_from_slice(b"{\"id\":");
        serde_json::to_writer(&mut head, &self.id)?;
        write!(head, ",\"start\":{}", self.start)?;
        write!(head, ",\"stuck\":{}", self.stuck)?;
        write!(head, ",\"error\":{}", self.error)?;
        if self.background {
            head.extend_from_slice(b",\"background\":true");
        }
        write!(head, ",\"duration\":{}", self.duration)?;
        write!(head, ",\"completed\":{}", self.completed)?;
        head.extend_from_slice(b",\"description\":");
        serde_json::to_writer(&mut head, &self.description)?;
        if let Some(username) = &self.username {
            head.extend_from_slice(b",\"username\":");
            serde_json::to_writer(&mut head, username)?;
        }
        // attributes and metrics are pre-rendered, inject them raw
        if let Some(attributes) = &self.attributes {
            head.extend_from_slice(b",\"attributes\":");
            head.extend_from_slice(attributes.as_bytes());
        }
        if let Some(metrics) = &self.metrics {
            head.extend_from_slice(b",\"metrics\":");
            head.extend_from_slice(metrics.as_bytes());
        }
        if include_detail {
            if let Some(spans) = self.spans {
                head.extend_from_slice(b",\"spans\":");
                streams.push(Box::new(Bytes::new(std::mem::take(&mut head))));
                streams.push(Box::new(spans));
            }
            if let Some(tree) = self.merged_stack_tree {
                head.extend_from_slice(b",\"mergedStackTree\":");
                streams.push(Box::new(Bytes::new(std::mem::take(&mut head))));
                streams.push(Box::new(tree));
            }
        }
        head.push(b'}');
        streams.push(Box::new(Bytes::new(head)));
        Ok(Box::new(Chain::new(streams)))
    }
}

fn metrics_json(trace: &Trace) -> Result<Option<String>, SnapshotError> {
    let trace_metrics = trace.trace_metrics();
    if trace_metrics.is_empty() {
        return Ok(None);
    }
    let mut snapshots: Vec<MetricSnapshot> =
        trace_metrics.iter().map(|m| m.snapshot()).collect();
    // total descending, name ascending for deterministic output
    snapshots.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));
    Ok(Some(serde_json::to_string(&snapshots)?))
}

fn collect_span_stack_traces(
    trace: &Trace,
    capture_tick: u64,
) -> Result<BTreeMap<String, String>, SnapshotError> {
    let mut stack_traces = BTreeMap::new();
    for span in trace.spans() {
        if span.start_tick() > capture_tick {
            continue;
        }
        if let Some(frames) = span.stack_trace() {
            let json = spans::stack_trace_json(&frames)?;
            let hash = spans::stack_trace_hash(&json);
            stack_traces.insert(hash, json);
        }
    }
    Ok(stack_traces)
}

use std::io;

use serde::Serialize;
use sha1::{Digest, Sha1};

use trace_core::{Span, SpanIter, StackFrame};

use crate::stream::{ByteStream, TARGET_CHUNK_SIZE};

/// Streams the span sequence as a JSON array, one creation-order span at a
/// time, normalized to the capture tick.
pub struct SpansByteStream {
    spans: SpanIter,
    capture_tick: u64,
    buf: Vec<u8>,
    wrote_first: bool,
    done: bool,
}

#[derive(Serialize)]
struct SpanJson<'a> {
    offset: u64,
    duration: u64,
    #[serde(skip_serializing_if = "is_false")]
    active: bool,
    index: usize,
    #[serde(rename = "parentIndex")]
    parent_index: i64,
    level: u32,
    description: &'a str,
    #[serde(skip_serializing_if = "is_false")]
    error: bool,
    #[serde(rename = "contextMap", skip_serializing_if = "Option::is_none")]
    context_map: Option<&'a serde_json::Map<String, serde_json::Value>>,
    #[serde(rename = "stackTraceHash", skip_serializing_if = "Option::is_none")]
    stack_trace_hash: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl SpansByteStream {
    pub(crate) fn new(spans: SpanIter, capture_tick: u64) -> Self {
        SpansByteStream {
            spans,
            capture_tick,
            buf: vec![b'['],
            wrote_first: false,
            done: false,
        }
    }

    fn write_span(&mut self, span: &Span) -> io::Result<()> {
        if span.start_tick() > self.capture_tick {
            // started after the capture tick
            return Ok(());
        }
        let end_tick = span.end_tick();
        let (duration, active) = if end_tick != 0 && end_tick <= self.capture_tick {
            (end_tick - span.start_tick(), false)
        } else {
            (self.capture_tick - span.start_tick(), true)
        };
        let message = span.message_supplier().message();
        let stack_trace_hash = match span.stack_trace() {
            Some(frames) => {
                let json = stack_trace_json(&frames).map_err(io::Error::from)?;
                Some(stack_trace_hash(&json))
            }
            None => None,
        };
        if self.wrote_first {
            self.buf.push(b',');
        } else {
            self.wrote_first = true;
        }
        let record = SpanJson {
            offset: span.offset(),
            duration,
            active,
            index: span.index(),
            parent_index: span.parent_index().map(|i| i as i64).unwrap_or(-1),
            level: span.level(),
            description: message.text(),
            error: span.is_error(),
            context_map: message.context(),
            stack_trace_hash,
        };
        serde_json::to_writer(&mut self.buf, &record).map_err(io::Error::from)
    }
}

impl ByteStream for SpansByteStream {
    fn has_next(&self) -> bool {
        !self.done || !self.buf.is_empty()
    }

    fn next(&mut self) -> io::Result<Vec<u8>> {
        while self.buf.len() < TARGET_CHUNK_SIZE && !self.done {
            match self.spans.next() {
                Some(span) => self.write_span(&span)?,
                None => {
                    self.buf.push(b']');
                    self.done = true;
                }
            }
        }
        Ok(std::mem::take(&mut self.buf))
    }
}

/// Frames rendered as a JSON array of display strings; the per-span hash
/// references this exact rendering.
pub(crate) fn stack_trace_json(frames: &[StackFrame]) -> Result<String, serde_json::Error> {
    let rendered: Vec<String> = frames.iter().map(|f| f.to_string()).collect();
    serde_json::to_string(&rendered)
}

pub(crate) fn stack_trace_hash(json: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}

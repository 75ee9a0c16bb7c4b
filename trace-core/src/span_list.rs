use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use tracing::error;

use crate::span::Span;

const CHUNK_SIZE: usize = 32;

struct Chunk {
    slots: [OnceLock<Arc<Span>>; CHUNK_SIZE],
    next: OnceLock<Arc<Chunk>>,
}

impl Chunk {
    fn new() -> Self {
        Chunk {
            slots: std::array::from_fn(|_| OnceLock::new()),
            next: OnceLock::new(),
        }
    }
}

/// Append-only span storage in creation order.
///
/// Exactly one writer appends; any number of readers iterate concurrently
/// without locking. The visible length only moves after the slot (and, on a
/// chunk boundary, the chunk link) is fully written, so a reader observing
/// length N sees spans 0..N fully constructed.
pub(crate) struct SpanList {
    head: Arc<Chunk>,
    tail: ArcSwap<Chunk>,
    len: CachePadded<AtomicUsize>,
}

impl SpanList {
    pub(crate) fn new() -> Self {
        let head = Arc::new(Chunk::new());
        SpanList {
            tail: ArcSwap::from(head.clone()),
            head,
            len: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn push(&self, span: Arc<Span>) {
        let len = self.len.load(Ordering::Relaxed);
        let slot = len % CHUNK_SIZE;
        let mut tail = self.tail.load_full();
        if slot == 0 && len != 0 {
            let next = Arc::new(Chunk::new());
            if tail.next.set(next.clone()).is_err() {
                error!(index = len, "span chunk already linked, dropping span");
                return;
            }
            self.tail.store(next.clone());
            tail = next;
        }
        if tail.slots[slot].set(span).is_err() {
            error!(index = len, "span slot already occupied, dropping span");
            return;
        }
        self.len.store(len + 1, Ordering::Release);
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Iterator over the prefix visible at the time of the call. Safe while
    /// the writer keeps appending.
    pub(crate) fn iter(&self) -> SpanIter {
        SpanIter {
            chunk: self.head.clone(),
            index: 0,
            len: self.len(),
        }
    }
}

/// Creation-order iterator over a consistent span prefix.
pub struct SpanIter {
    chunk: Arc<Chunk>,
    index: usize,
    len: usize,
}

impl Iterator for SpanIter {
    type Item = Arc<Span>;

    fn next(&mut self) -> Option<Arc<Span>> {
        if self.index >= self.len {
            return None;
        }
        if self.index != 0 && self.index % CHUNK_SIZE == 0 {
            let next = self.chunk.next.get()?.clone();
            self.chunk = next;
        }
        let span = self.chunk.slots[self.index % CHUNK_SIZE].get()?.clone();
        self.index += 1;
        Some(span)
    }
}

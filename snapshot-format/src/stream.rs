use std::collections::VecDeque;
use std::io::{self, Write};

/// Target size for emitted chunks. Writers fill at least this many bytes
/// before yielding, except on the final chunk.
pub const TARGET_CHUNK_SIZE: usize = 8192;

/// Lazy chunked byte emission.
///
/// Every `next` call returns at least one byte until the logical document is
/// finished; the concatenation of all chunks is the document. No chunk
/// crosses document completion, so closing brackets flush deterministically
/// on the last call.
pub trait ByteStream: Send {
    fn has_next(&self) -> bool;

    fn next(&mut self) -> io::Result<Vec<u8>>;

    fn write_to(&mut self, out: &mut dyn Write) -> io::Result<()> {
        while self.has_next() {
            out.write_all(&self.next()?)?;
        }
        Ok(())
    }

    fn collect(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }
}

/// Single pre-rendered chunk.
pub struct Bytes {
    data: Option<Vec<u8>>,
}

impl Bytes {
    pub fn new(data: Vec<u8>) -> Self {
        Bytes {
            data: if data.is_empty() { None } else { Some(data) },
        }
    }
}

impl ByteStream for Bytes {
    fn has_next(&self) -> bool {
        self.data.is_some()
    }

    fn next(&mut self) -> io::Result<Vec<u8>> {
        Ok(self.data.take().unwrap_or_default())
    }
}

/// Concatenation of streams, drained in order.
pub struct Chain {
    streams: VecDeque<Box<dyn ByteStream>>,
}

impl Chain {
    pub fn new(streams: Vec<Box<dyn ByteStream>>) -> Self {
        Chain {
            streams: streams.into(),
        }
    }

    fn skip_finished(&mut self) {
        while let Some(front) = self.streams.front() {
            if front.has_next() {
                return;
            }
            self.streams.pop_front();
        }
    }
}

impl ByteStream for Chain {
    fn has_next(&self) -> bool {
        self.streams.iter().any(|s| s.has_next())
    }

    fn next(&mut self) -> io::Result<Vec<u8>> {
        self.skip_finished();
        match self.streams.front_mut() {
            Some(front) => front.next(),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_emits_once() {
        let mut stream = Bytes::new(b"hello".to_vec());
        assert!(stream.has_next());
        assert_eq!(stream.next().unwrap(), b"hello");
        assert!(!stream.has_next());
    }

    #[test]
    fn test_empty_bytes_is_finished() {
        let stream = Bytes::new(Vec::new());
        assert!(!stream.has_next());
    }

    #[test]
    fn test_chain_concatenates_in_order() {
        let mut chain = Chain::new(vec![
            Box::new(Bytes::new(b"a".to_vec())),
            Box::new(Bytes::new(Vec::new())),
            Box::new(Bytes::new(b"bc".to_vec())),
        ]);
        assert_eq!(chain.collect().unwrap(), b"abc");
        assert!(!chain.has_next());
    }

    #[test]
    fn test_chunks_are_never_empty_mid_document() {
        let mut chain = Chain::new(vec![
            Box::new(Bytes::new(b"x".to_vec())),
            Box::new(Bytes::new(b"y".to_vec())),
        ]);
        while chain.has_next() {
            assert!(!chain.next().unwrap().is_empty());
        }
    }
}

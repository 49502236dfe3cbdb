//! Size-tracked queue of pending chunks.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use super::{Chunk, Payload};
use crate::config::Mode;

/// Ordered queue of chunks with a running size.
///
/// `total_size` is always the sum of the queued chunk sizes under the queue
/// [`Mode`]. Binary chunks may be merged on append when coalescing is
/// enabled; object queues never merge.
#[derive(Debug, Clone)]
pub struct BufferQueue<T> {
    chunks: VecDeque<Chunk<T>>,
    total_size: usize,
    mode: Mode,
    coalesce: bool,
}

impl<T> BufferQueue<T> {
    /// Create an empty queue.
    pub fn new(mode: Mode) -> Self {
        Self::with_coalescing(mode, false)
    }

    /// Create an empty queue, optionally merging adjacent binary chunks.
    pub fn with_coalescing(mode: Mode, coalesce: bool) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_size: 0,
            mode,
            coalesce: coalesce && mode == Mode::Binary,
        }
    }

    /// Size accounting mode.
    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Sum of queued chunk sizes.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Number of queued chunks.
    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the queue holds no chunks.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Head chunk.
    #[inline]
    pub fn front(&self) -> Option<&Chunk<T>> {
        self.chunks.front()
    }

    /// Iterate over queued chunks, head first.
    pub fn iter(&self) -> impl Iterator<Item = &Chunk<T>> {
        self.chunks.iter()
    }

    /// Append a chunk.
    pub fn push_back(&mut self, chunk: Chunk<T>) {
        self.total_size += chunk.size(self.mode);

        if self.coalesce {
            if let Some(back) = self.chunks.back_mut() {
                let merged = match (back.payload(), chunk.payload()) {
                    (Payload::Bytes(last), Payload::Bytes(next)) => {
                        let mut merged = BytesMut::with_capacity(last.len() + next.len());
                        merged.extend_from_slice(last);
                        merged.extend_from_slice(next);
                        Some(merged.freeze())
                    }
                    _ => None,
                };
                if let Some(merged) = merged {
                    *back = Chunk::bytes(merged);
                    return;
                }
            }
        }

        self.chunks.push_back(chunk);
    }

    /// Prepend a chunk.
    pub fn push_front(&mut self, chunk: Chunk<T>) {
        self.total_size += chunk.size(self.mode);
        self.chunks.push_front(chunk);
    }

    /// Remove the head chunk.
    pub fn pop_front(&mut self) -> Option<Chunk<T>> {
        let chunk = self.chunks.pop_front()?;
        self.total_size -= chunk.size(self.mode);
        Some(chunk)
    }

    /// Remove the first `n` units.
    ///
    /// Object queues return the head item. Binary queues return exactly
    /// `min(n, total_size)` bytes, splitting the head chunk if needed; text
    /// chunks are split on the next character boundary at or after `n`.
    pub fn take(&mut self, n: usize) -> Option<Chunk<T>> {
        if self.mode == Mode::Object || self.chunks.is_empty() {
            return self.pop_front();
        }
        if n >= self.total_size {
            return self.take_all();
        }

        let head_len = self.chunks.front().map(Chunk::byte_len).unwrap_or(0);
        if n <= head_len {
            return self.split_head(n);
        }

        let mut parts = Vec::new();
        let mut taken = 0;
        while taken < n {
            let remaining = n - taken;
            let head_len = self.chunks.front().map(Chunk::byte_len).unwrap_or(0);
            let part = if remaining >= head_len {
                self.pop_front()
            } else {
                self.split_head(remaining)
            };
            match part {
                Some(part) => {
                    taken += part.byte_len();
                    parts.push(part);
                }
                None => break,
            }
        }
        Some(concat(parts))
    }

    /// Remove everything as one chunk.
    ///
    /// Object queues return the head item only.
    pub fn take_all(&mut self) -> Option<Chunk<T>> {
        if self.mode == Mode::Object || self.chunks.len() <= 1 {
            return self.pop_front();
        }
        self.total_size = 0;
        let parts: Vec<_> = self.chunks.drain(..).collect();
        Some(concat(parts))
    }

    /// Drain every chunk in order.
    pub fn drain(&mut self) -> impl Iterator<Item = Chunk<T>> + '_ {
        self.total_size = 0;
        self.chunks.drain(..)
    }

    /// Drop every chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_size = 0;
    }

    fn split_head(&mut self, n: usize) -> Option<Chunk<T>> {
        let head = self.chunks.pop_front()?;
        let head_len = head.byte_len();
        let (taken, rest) = match head.into_payload() {
            Payload::Bytes(mut bytes) => {
                let taken = bytes.split_to(n);
                (Chunk::bytes(taken), Chunk::bytes(bytes))
            }
            Payload::Text(mut text) => {
                let mut at = n;
                while !text.is_char_boundary(at) {
                    at += 1;
                }
                let rest = text.split_off(at);
                (Chunk::text(text), Chunk::text(rest))
            }
            Payload::Value(v) => (Chunk::value(v), Chunk::bytes(Bytes::new())),
        };
        self.total_size -= head_len - rest.byte_len();
        if !rest.is_empty() {
            self.chunks.push_front(rest);
        }
        Some(taken)
    }
}

/// Concatenate binary or text parts into one chunk.
///
/// The result is text when the first part is text.
fn concat<T>(mut parts: Vec<Chunk<T>>) -> Chunk<T> {
    if parts.len() == 1 {
        if let Some(only) = parts.pop() {
            return only;
        }
    }

    let as_text = matches!(parts.first().map(Chunk::payload), Some(Payload::Text(_)));
    if as_text {
        let mut text = String::new();
        for part in parts {
            match part.into_payload() {
                Payload::Text(s) => text.push_str(&s),
                Payload::Bytes(b) => text.push_str(&String::from_utf8_lossy(&b)),
                Payload::Value(_) => {}
            }
        }
        Chunk::text(text)
    } else {
        let total: usize = parts.iter().map(Chunk::byte_len).sum();
        let mut bytes = BytesMut::with_capacity(total);
        for part in parts {
            match part.payload() {
                Payload::Bytes(b) => bytes.extend_from_slice(b),
                Payload::Text(s) => bytes.extend_from_slice(s.as_bytes()),
                Payload::Value(_) => {}
            }
        }
        Chunk::bytes(bytes.freeze())
    }
}

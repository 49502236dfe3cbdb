//! Source state machine.
//!
//! A [`Readable`] owns a [`BufferQueue`] filled by a [`Producer`] and drained
//! either by explicit [`read`](Readable::read) calls (paused mode) or by
//! draining [`ReadableEvent::Data`] notifications (flowing mode).
//!
//! The producer is only asked for data through [`Producer::on_need_data`]
//! when the buffer is below its high-water mark and no fetch is already in
//! flight. It pushes through a staging [`Pusher`]; staged operations are
//! applied once the callback returned, so the producer never observes the
//! stream mid-update. Producers that deliver data later (for example from
//! an async reader) push through [`Readable::push`] instead and use
//! [`Readable::is_reading`] to see outstanding demand.
//!
//! # Example
//!
//! ```ignore
//! use flowstream::{Chunk, Readable, ReadableConfig, ReadableEvent};
//!
//! let mut source = Readable::from_iter(
//!     ReadableConfig::objects(),
//!     (1..=3).map(Chunk::value),
//! );
//! source.resume();
//! while let Some(event) = source.next_event() {
//!     if let ReadableEvent::Data(chunk) = event {
//!         println!("{:?}", chunk.into_value());
//!     }
//! }
//! ```

use std::collections::VecDeque;

use crate::chunk::{BufferQueue, Chunk, Decoder, Encoding, Payload};
use crate::config::{Mode, ReadableConfig, MAX_HIGH_WATER_MARK};
use crate::error::{ProtocolViolation, Result, StreamError};
use crate::stream::StreamId;

/// Delivery mode of a readable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    /// Nobody consumes yet.
    Initial,
    /// Data is delivered as `Data` notifications.
    Flowing,
    /// Data waits in the buffer for `read()`.
    Paused,
}

/// Notifications emitted by a [`Readable`].
#[derive(Debug, Clone)]
pub enum ReadableEvent<T> {
    /// A chunk delivered in flowing mode.
    Data(Chunk<T>),
    /// Data or end-of-data can be read (non-flowing mode).
    Readable,
    /// Switched to paused mode.
    Pause,
    /// Switched to flowing mode.
    Resume,
    /// All data was consumed.
    End,
    /// The stream was destroyed with an error.
    Error(StreamError),
    /// The stream is closed. Always the last notification.
    Close,
}

/// Data source behind a [`Readable`].
pub trait Producer<T> {
    /// More data is wanted. `requested_size` is the high-water mark.
    fn on_need_data(&mut self, requested_size: usize, pusher: &mut Pusher<T>);

    /// The stream was destroyed. Called exactly once.
    fn on_destroy(&mut self, _error: Option<&StreamError>) {}
}

/// Producer for streams fed from outside through [`Readable::push`].
struct External;

impl<T> Producer<T> for External {
    fn on_need_data(&mut self, _requested_size: usize, _pusher: &mut Pusher<T>) {}
}

/// Producer backed by a closure.
struct FnProducer<F>(F);

impl<T, F> Producer<T> for FnProducer<F>
where
    F: FnMut(usize, &mut Pusher<T>),
{
    fn on_need_data(&mut self, requested_size: usize, pusher: &mut Pusher<T>) {
        (self.0)(requested_size, pusher)
    }
}

/// Producer that yields the items of an iterator, then ends.
#[derive(Debug)]
pub struct IterProducer<I> {
    iter: I,
}

impl<I> IterProducer<I> {
    /// Create a new iterator producer.
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<T, I> Producer<T> for IterProducer<I>
where
    I: Iterator<Item = Chunk<T>>,
{
    fn on_need_data(&mut self, _requested_size: usize, pusher: &mut Pusher<T>) {
        loop {
            let more = match self.iter.next() {
                Some(chunk) => pusher.push(chunk),
                None => pusher.end().map(|()| false),
            };
            match more {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "iterator producer stopped");
                    break;
                }
            }
        }
    }
}

enum PushOp<T> {
    Push(Option<Chunk<T>>),
    Destroy(Option<StreamError>),
}

/// Staging area handed to [`Producer::on_need_data`].
///
/// The return value of [`push`](Pusher::push) projects what
/// [`Readable::push`] will return once the staged chunks are applied.
pub struct Pusher<T> {
    ops: Vec<PushOp<T>>,
    projected_size: usize,
    high_water_mark: usize,
    mode: Mode,
    ended: bool,
}

impl<T> Pusher<T> {
    fn new(buffered: usize, high_water_mark: usize, mode: Mode, ended: bool) -> Self {
        Self {
            ops: Vec::new(),
            projected_size: buffered,
            high_water_mark,
            mode,
            ended,
        }
    }

    /// Stage a chunk. Returns whether the producer should keep producing.
    ///
    /// Fails with [`ProtocolViolation::PushAfterEof`] once end-of-data was
    /// staged or the stream already ended.
    pub fn push(&mut self, chunk: Chunk<T>) -> Result<bool> {
        if self.ended {
            return Err(ProtocolViolation::PushAfterEof.into());
        }
        self.projected_size += chunk.size(self.mode);
        self.ops.push(PushOp::Push(Some(chunk)));
        Ok(self.projected_size <= self.high_water_mark)
    }

    /// Stage end-of-data.
    pub fn end(&mut self) -> Result<()> {
        if self.ended {
            return Err(ProtocolViolation::PushAfterEof.into());
        }
        self.ended = true;
        self.ops.push(PushOp::Push(None));
        Ok(())
    }

    /// Stage destruction of the stream.
    pub fn destroy(&mut self, error: Option<StreamError>) {
        self.ops.push(PushOp::Destroy(error));
    }

    /// Whether nothing was staged.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Readable stream state machine.
pub struct Readable<T = ()> {
    id: StreamId,
    buffer: BufferQueue<T>,
    high_water_mark: usize,
    mode: Mode,
    default_encoding: Option<Encoding>,
    decoder: Option<Decoder>,
    flow: FlowMode,
    ended: bool,
    end_emitted: bool,
    reading: bool,
    needs_readable: bool,
    destroyed: bool,
    errored: Option<StreamError>,
    auto_destroy: bool,
    events: VecDeque<ReadableEvent<T>>,
    producer: Box<dyn Producer<T> + Send>,
}

impl<T> Readable<T> {
    /// Create a readable fed from outside through [`push`](Self::push).
    pub fn new(config: ReadableConfig) -> Self {
        Self::with_boxed_producer(config, Box::new(External))
    }

    /// Create a readable driven by a producer.
    pub fn with_producer<P>(config: ReadableConfig, producer: P) -> Self
    where
        P: Producer<T> + Send + 'static,
    {
        Self::with_boxed_producer(config, Box::new(producer))
    }

    /// Create a readable driven by a closure producer.
    pub fn from_fn<F>(config: ReadableConfig, f: F) -> Self
    where
        F: FnMut(usize, &mut Pusher<T>) + Send + 'static,
    {
        Self::with_boxed_producer(config, Box::new(FnProducer(f)))
    }

    /// Create a readable that yields the chunks of an iterator, then ends.
    pub fn from_iter<I>(config: ReadableConfig, iter: I) -> Self
    where
        I: IntoIterator<Item = Chunk<T>>,
        I::IntoIter: Send + 'static,
    {
        Self::with_boxed_producer(config, Box::new(IterProducer::new(iter.into_iter())))
    }

    fn with_boxed_producer(config: ReadableConfig, producer: Box<dyn Producer<T> + Send>) -> Self {
        let mode = config.mode();
        let mut stream = Self {
            id: StreamId::next(),
            buffer: BufferQueue::with_coalescing(mode, config.coalesce_chunks),
            high_water_mark: config.effective_high_water_mark(),
            mode,
            default_encoding: config.encoding,
            decoder: None,
            flow: FlowMode::Initial,
            ended: false,
            end_emitted: false,
            reading: false,
            needs_readable: true,
            destroyed: false,
            errored: None,
            auto_destroy: config.auto_destroy,
            events: VecDeque::new(),
            producer,
        };
        if let Some(encoding) = config.encoding {
            stream.decoder = Some(Decoder::new(encoding));
        }
        stream
    }

    /// Stream identifier.
    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Size accounting mode.
    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current high-water mark.
    #[inline]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Buffered size (bytes or items).
    #[inline]
    pub fn buffered_size(&self) -> usize {
        self.buffer.total_size()
    }

    /// Current flow mode.
    #[inline]
    pub fn flow_mode(&self) -> FlowMode {
        self.flow
    }

    /// Whether data is delivered as `Data` notifications.
    #[inline]
    pub fn is_flowing(&self) -> bool {
        self.flow == FlowMode::Flowing
    }

    /// Whether end-of-data was pushed.
    #[inline]
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Whether the `End` notification was queued.
    #[inline]
    pub fn is_end_emitted(&self) -> bool {
        self.end_emitted
    }

    /// Whether a fetch is outstanding.
    #[inline]
    pub fn is_reading(&self) -> bool {
        self.reading
    }

    /// Whether the stream was destroyed.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Error the stream was destroyed with.
    #[inline]
    pub fn errored(&self) -> Option<&StreamError> {
        self.errored.as_ref()
    }

    /// Encoding delivered chunks are decoded with.
    #[inline]
    pub fn encoding(&self) -> Option<Encoding> {
        self.decoder.as_ref().map(Decoder::encoding)
    }

    /// Whether the producer should be asked for more data.
    pub fn needs_more(&self) -> bool {
        let size = self.buffer.total_size();
        (size < self.high_water_mark || (self.flow == FlowMode::Flowing && size == 0))
            && !self.ended
            && !self.reading
            && !self.destroyed
    }

    /// Push a chunk, or end-of-data with `None`.
    ///
    /// Returns whether the producer should keep producing.
    pub fn push(&mut self, chunk: Option<Chunk<T>>) -> Result<bool> {
        if self.destroyed {
            return Ok(false);
        }
        if self.ended {
            tracing::warn!(stream = %self.id, "push after EOF");
            return Err(ProtocolViolation::PushAfterEof.into());
        }

        let Some(chunk) = chunk else {
            self.reading = false;
            self.on_eof();
            return Ok(false);
        };

        self.reading = false;
        if !(self.mode == Mode::Binary && chunk.is_empty()) {
            match self.prepare(chunk) {
                Ok(Some(chunk)) => self.add_chunk(chunk, false),
                Ok(None) => {}
                Err(e) => {
                    self.destroy(Some(e.clone()));
                    return Err(e);
                }
            }
        }

        let size = self.buffer.total_size();
        tracing::trace!(stream = %self.id, buffered = size, "chunk pushed");
        Ok(size <= self.high_water_mark)
    }

    /// Put a chunk back at the head of the buffer.
    pub fn unshift(&mut self, chunk: Chunk<T>) -> Result<bool> {
        if self.destroyed {
            return Ok(false);
        }
        if self.end_emitted {
            tracing::warn!(stream = %self.id, "unshift after end event");
            return Err(ProtocolViolation::UnshiftAfterEndEvent.into());
        }

        let chunk = match chunk.normalize(self.mode, self.default_encoding) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.destroy(Some(e.clone()));
                return Err(e);
            }
        };
        if !(self.mode == Mode::Binary && chunk.is_empty()) {
            let decoded = match (&self.decoder, chunk.as_bytes()) {
                (Some(decoder), Some(bytes)) => Some(Chunk::text(decoder.encoding().decode(bytes))),
                _ => None,
            };
            self.add_chunk(decoded.unwrap_or(chunk), true);
        }
        Ok(self.buffer.total_size() <= self.high_water_mark)
    }

    /// Read from the buffer.
    ///
    /// Object streams return one item. Binary streams return the whole
    /// buffer for `None`, or exactly `n` bytes (the remainder once ended).
    /// Returns `None` when not enough data is buffered.
    pub fn read(&mut self, n: Option<usize>) -> Option<Chunk<T>> {
        if self.destroyed {
            return None;
        }
        if let Some(n) = n {
            if n > self.high_water_mark {
                self.high_water_mark = compute_new_high_water_mark(n);
            }
        }

        if n == Some(0) {
            if self.ended && self.buffer.is_empty() {
                self.end_readable();
            } else {
                if self.buffer.total_size() >= self.high_water_mark || self.ended {
                    self.needs_readable = true;
                    self.emit_readable();
                }
                if self.needs_more() {
                    self.fetch();
                }
            }
            return None;
        }

        let mut wanted = self.how_much_to_read(n);
        if wanted == 0 && self.ended {
            self.end_readable();
            return None;
        }

        let size = self.buffer.total_size();
        let mut do_read = self.needs_readable
            || size == 0
            || size.saturating_sub(wanted) < self.high_water_mark;
        if self.ended || self.reading {
            do_read = false;
        }
        if do_read {
            self.fetch();
            if self.destroyed {
                return None;
            }
            if !self.reading {
                wanted = self.how_much_to_read(n);
            }
        }

        let chunk = if wanted == 0 { None } else { self.take(n, wanted) };
        if chunk.is_none() {
            self.needs_readable = self.buffer.total_size() <= self.high_water_mark;
        }

        if self.buffer.is_empty() {
            if self.ended {
                self.end_readable();
            } else {
                self.needs_readable = true;
            }
        }
        chunk
    }

    /// Switch to flowing mode.
    pub fn resume(&mut self) {
        if self.destroyed || self.flow == FlowMode::Flowing {
            return;
        }
        tracing::trace!(stream = %self.id, "resume");
        self.flow = FlowMode::Flowing;
        self.events.push_back(ReadableEvent::Resume);
    }

    /// Switch to paused mode.
    pub fn pause(&mut self) {
        if self.destroyed || self.flow == FlowMode::Paused {
            return;
        }
        tracing::trace!(stream = %self.id, "pause");
        self.flow = FlowMode::Paused;
        self.events.push_back(ReadableEvent::Pause);
    }

    /// Decode delivered bytes into text from now on.
    ///
    /// Already buffered bytes are converted in place.
    pub fn set_encoding(&mut self, encoding: Encoding) {
        let mut decoder = Decoder::new(encoding);
        let existing: Vec<Chunk<T>> = self.buffer.drain().collect();

        if self.mode == Mode::Object {
            for chunk in existing {
                let decoded = chunk.as_bytes().map(|bytes| Chunk::text(decoder.write(bytes)));
                self.buffer.push_back(decoded.unwrap_or(chunk));
            }
        } else {
            let mut text = String::new();
            for chunk in existing {
                match chunk.payload() {
                    Payload::Bytes(bytes) => text.push_str(&decoder.write(bytes)),
                    Payload::Text(s) => text.push_str(s),
                    Payload::Value(_) => {}
                }
            }
            if !text.is_empty() {
                self.buffer.push_back(Chunk::text(text));
            }
        }
        self.decoder = Some(decoder);
    }

    /// Destroy the stream. Idempotent.
    ///
    /// Discards the buffer and queues `Error` (when given) then `Close`.
    pub fn destroy(&mut self, error: Option<StreamError>) {
        if self.destroyed {
            return;
        }
        tracing::debug!(stream = %self.id, error = ?error, "readable destroyed");
        self.destroyed = true;
        self.reading = false;
        self.buffer.clear();
        self.producer.on_destroy(error.as_ref());
        if let Some(e) = error {
            self.errored = Some(e.clone());
            self.events.push_back(ReadableEvent::Error(e));
        }
        self.events.push_back(ReadableEvent::Close);
    }

    /// Next queued notification.
    ///
    /// In flowing mode buffered chunks are delivered as `Data` and the
    /// producer is asked for more as the buffer drains.
    pub fn next_event(&mut self) -> Option<ReadableEvent<T>> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if self.flow != FlowMode::Flowing || self.destroyed || self.end_emitted {
                return None;
            }
            if self.needs_more() {
                self.fetch();
                if !self.events.is_empty() {
                    continue;
                }
            }
            if let Some(chunk) = self.buffer.pop_front() {
                if self.buffer.is_empty() && self.ended {
                    self.end_readable();
                }
                return Some(ReadableEvent::Data(chunk));
            }
            if self.ended {
                self.end_readable();
                continue;
            }
            return None;
        }
    }

    /// Whether notifications are queued.
    #[inline]
    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    fn fetch(&mut self) {
        self.reading = true;
        let mut pusher = Pusher::new(
            self.buffer.total_size(),
            self.high_water_mark,
            self.mode,
            self.ended,
        );
        self.producer.on_need_data(self.high_water_mark, &mut pusher);
        for op in pusher.ops {
            match op {
                // Failures here already destroyed the stream.
                PushOp::Push(chunk) => {
                    if let Err(e) = self.push(chunk) {
                        tracing::debug!(stream = %self.id, error = %e, "staged push failed");
                    }
                }
                PushOp::Destroy(error) => self.destroy(error),
            }
        }
    }

    fn prepare(&mut self, chunk: Chunk<T>) -> Result<Option<Chunk<T>>> {
        let chunk = chunk.normalize(self.mode, self.default_encoding)?;
        if let (Some(decoder), Some(bytes)) = (self.decoder.as_mut(), chunk.as_bytes()) {
            let text = decoder.write(bytes);
            return Ok((!text.is_empty()).then(|| Chunk::text(text)));
        }
        Ok(Some(chunk))
    }

    fn add_chunk(&mut self, chunk: Chunk<T>, front: bool) {
        if front {
            self.buffer.push_front(chunk);
        } else {
            self.buffer.push_back(chunk);
        }
        self.emit_readable();
    }

    fn on_eof(&mut self) {
        self.ended = true;
        if let Some(decoder) = self.decoder.as_mut() {
            let rest = decoder.end();
            if !rest.is_empty() {
                self.buffer.push_back(Chunk::text(rest));
            }
        }
        tracing::debug!(
            stream = %self.id,
            buffered = self.buffer.total_size(),
            "readable reached EOF"
        );
        self.needs_readable = true;
        self.emit_readable();
    }

    fn emit_readable(&mut self) {
        if self.flow == FlowMode::Flowing || self.destroyed || !self.needs_readable {
            return;
        }
        self.needs_readable = false;
        self.events.push_back(ReadableEvent::Readable);
    }

    fn end_readable(&mut self) {
        if self.end_emitted || !self.buffer.is_empty() {
            return;
        }
        tracing::debug!(stream = %self.id, "readable end");
        self.end_emitted = true;
        self.events.push_back(ReadableEvent::End);
        if self.auto_destroy {
            self.destroy(None);
        }
    }

    fn how_much_to_read(&self, n: Option<usize>) -> usize {
        let size = self.buffer.total_size();
        if n == Some(0) || (size == 0 && self.ended) {
            return 0;
        }
        if self.mode == Mode::Object {
            return 1;
        }
        match n {
            None if self.flow == FlowMode::Flowing && size > 0 => {
                self.buffer.front().map(Chunk::byte_len).unwrap_or(size)
            }
            None => size,
            Some(n) if n <= size => n,
            Some(_) if self.ended => size,
            Some(_) => 0,
        }
    }

    fn take(&mut self, n: Option<usize>, wanted: usize) -> Option<Chunk<T>> {
        if self.mode == Mode::Object {
            return self.buffer.pop_front();
        }
        match n {
            None if self.flow == FlowMode::Flowing => self.buffer.pop_front(),
            None => self.buffer.take_all(),
            Some(_) => self.buffer.take(wanted),
        }
    }
}

impl<T> std::fmt::Debug for Readable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Readable")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("flow", &self.flow)
            .field("buffered", &self.buffer.total_size())
            .field("high_water_mark", &self.high_water_mark)
            .field("ended", &self.ended)
            .field("end_emitted", &self.end_emitted)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Raise the mark to the next power of two, capped at 1 GiB.
fn compute_new_high_water_mark(n: usize) -> usize {
    n.min(MAX_HIGH_WATER_MARK).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn drain<T>(stream: &mut Readable<T>) -> Vec<ReadableEvent<T>> {
        std::iter::from_fn(|| stream.next_event()).collect()
    }

    #[test]
    fn test_push_returns_false_past_watermark() {
        let mut stream = Readable::new(ReadableConfig::objects().high_water_mark(2));
        assert!(stream.push(Some(Chunk::value(1))).unwrap());
        assert!(stream.push(Some(Chunk::value(2))).unwrap());
        assert!(!stream.push(Some(Chunk::value(3))).unwrap());
        assert_eq!(stream.buffered_size(), 3);
    }

    #[test]
    fn test_push_after_eof_is_violation() {
        let mut stream: Readable = Readable::new(ReadableConfig::default());
        assert!(!stream.push(None).unwrap());
        let err = stream.push(Some(Chunk::bytes(&b"late"[..]))).unwrap_err();
        assert_eq!(err.violation(), Some(ProtocolViolation::PushAfterEof));
        assert!(stream.push(None).is_err());
        assert!(!stream.is_destroyed());
    }

    #[test]
    fn test_push_to_destroyed_returns_false() {
        let mut stream: Readable = Readable::new(ReadableConfig::default());
        stream.destroy(None);
        assert!(!stream.push(Some(Chunk::bytes(&b"x"[..]))).unwrap());
        assert_eq!(stream.buffered_size(), 0);
    }

    #[test]
    fn test_empty_chunk_clears_reading() {
        let mut stream: Readable = Readable::new(ReadableConfig::default());
        assert!(stream.read(None).is_none());
        assert!(stream.is_reading());
        assert!(stream.push(Some(Chunk::bytes(&b""[..]))).unwrap());
        assert!(!stream.is_reading());
        assert_eq!(stream.buffered_size(), 0);
    }

    #[test]
    fn test_invalid_chunk_destroys() {
        let mut stream: Readable<u8> = Readable::new(ReadableConfig::default());
        let err = stream.push(Some(Chunk::value(1))).unwrap_err();
        assert!(matches!(err, StreamError::InvalidChunk(_)));
        assert!(stream.is_destroyed());
    }

    #[test]
    fn test_read_sized_and_whole() {
        let mut stream: Readable = Readable::new(ReadableConfig::default());
        stream.push(Some(Chunk::bytes(&b"hello"[..]))).unwrap();
        stream.push(Some(Chunk::bytes(&b" world"[..]))).unwrap();

        let head = stream.read(Some(5)).unwrap();
        assert_eq!(head.as_bytes().unwrap().as_ref(), b"hello");
        assert!(stream.read(Some(100)).is_none());

        let rest = stream.read(None).unwrap();
        assert_eq!(rest.as_bytes().unwrap().as_ref(), b" world");
    }

    #[test]
    fn test_read_remainder_after_end() {
        let mut stream: Readable = Readable::new(ReadableConfig::default());
        stream.push(Some(Chunk::bytes(&b"abc"[..]))).unwrap();
        stream.push(None).unwrap();
        let rest = stream.read(Some(10)).unwrap();
        assert_eq!(rest.as_bytes().unwrap().as_ref(), b"abc");
        assert!(stream.is_end_emitted());

        let events = drain(&mut stream);
        assert!(matches!(events.last(), Some(ReadableEvent::Close)));
        assert!(events.iter().any(|e| matches!(e, ReadableEvent::End)));
    }

    #[test]
    fn test_read_raises_high_water_mark() {
        let mut stream: Readable = Readable::new(ReadableConfig::default().high_water_mark(16));
        assert!(stream.read(Some(100)).is_none());
        assert_eq!(stream.high_water_mark(), 128);
        assert_eq!(compute_new_high_water_mark(usize::MAX), MAX_HIGH_WATER_MARK);
    }

    #[test]
    fn test_flowing_delivers_data_then_end_then_close() {
        let mut stream = Readable::from_iter(
            ReadableConfig::objects().high_water_mark(2),
            (1..=5).map(Chunk::value),
        );
        stream.resume();

        let mut values = Vec::new();
        let mut saw_end = false;
        let mut closes = 0;
        while let Some(event) = stream.next_event() {
            match event {
                ReadableEvent::Data(chunk) => {
                    assert!(!saw_end, "data after end");
                    values.push(chunk.into_value().unwrap());
                }
                ReadableEvent::End => saw_end = true,
                ReadableEvent::Close => closes += 1,
                _ => {}
            }
            assert!(stream.buffered_size() <= 3);
        }
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert!(saw_end);
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_producer_called_only_when_needed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut stream: Readable = Readable::from_fn(
            ReadableConfig::default().high_water_mark(4),
            move |_, pusher: &mut Pusher<()>| {
                counter.fetch_add(1, Ordering::SeqCst);
                pusher.push(Chunk::bytes(&b"abcd"[..])).unwrap();
            },
        );

        let first = stream.read(None).unwrap();
        assert_eq!(first.byte_len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        stream.push(Some(Chunk::bytes(&b"efgh"[..]))).unwrap();
        assert!(!stream.needs_more());
    }

    #[test]
    fn test_external_producer_reports_demand() {
        let mut stream: Readable = Readable::new(ReadableConfig::default());
        stream.resume();
        assert!(stream.needs_more());
        assert!(matches!(stream.next_event(), Some(ReadableEvent::Resume)));
        assert!(stream.next_event().is_none());
        assert!(stream.is_reading());
        assert!(!stream.needs_more());

        stream.push(Some(Chunk::bytes(&b"x"[..]))).unwrap();
        assert!(matches!(stream.next_event(), Some(ReadableEvent::Data(_))));
    }

    #[test]
    fn test_paused_mode_emits_readable_once() {
        let mut stream: Readable = Readable::new(ReadableConfig::default());
        stream.push(Some(Chunk::bytes(&b"a"[..]))).unwrap();
        stream.push(Some(Chunk::bytes(&b"b"[..]))).unwrap();
        let events = drain(&mut stream);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ReadableEvent::Readable));

        assert_eq!(stream.read(None).unwrap().as_bytes().unwrap().as_ref(), b"ab");
        stream.push(None).unwrap();
        assert!(matches!(stream.next_event(), Some(ReadableEvent::Readable)));
        assert!(stream.read(None).is_none());
        assert!(matches!(stream.next_event(), Some(ReadableEvent::End)));
        assert!(matches!(stream.next_event(), Some(ReadableEvent::Close)));
    }

    #[test]
    fn test_unshift_puts_chunk_first() {
        let mut stream: Readable = Readable::new(ReadableConfig::default());
        stream.push(Some(Chunk::bytes(&b"world"[..]))).unwrap();
        stream.unshift(Chunk::bytes(&b"hello "[..])).unwrap();
        assert_eq!(
            stream.read(None).unwrap().as_bytes().unwrap().as_ref(),
            b"hello world"
        );
    }

    #[test]
    fn test_unshift_after_end_event_fails() {
        let mut stream: Readable =
            Readable::new(ReadableConfig::default().auto_destroy(false));
        stream.push(None).unwrap();
        assert!(stream.read(None).is_none());
        assert!(stream.is_end_emitted());
        let err = stream.unshift(Chunk::bytes(&b"x"[..])).unwrap_err();
        assert_eq!(err.violation(), Some(ProtocolViolation::UnshiftAfterEndEvent));
    }

    #[test]
    fn test_set_encoding_keeps_split_characters() {
        let mut stream: Readable = Readable::new(ReadableConfig::default());
        stream.set_encoding(Encoding::Utf8);
        stream.push(Some(Chunk::bytes(&b"caf\xc3"[..]))).unwrap();
        stream.push(Some(Chunk::bytes(&b"\xa9"[..]))).unwrap();
        let text = stream.read(None).unwrap();
        assert_eq!(text.as_text(), Some("café"));
    }

    #[test]
    fn test_set_encoding_converts_buffer() {
        let mut stream: Readable = Readable::new(ReadableConfig::default());
        stream.push(Some(Chunk::bytes(&b"\xca\xfe"[..]))).unwrap();
        stream.set_encoding(Encoding::Hex);
        assert_eq!(stream.encoding(), Some(Encoding::Hex));
        assert_eq!(stream.read(None).unwrap().as_text(), Some("cafe"));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut stream: Readable = Readable::new(ReadableConfig::default());
        stream.push(Some(Chunk::bytes(&b"data"[..]))).unwrap();
        stream.destroy(Some(StreamError::failed("boom")));
        stream.destroy(Some(StreamError::failed("again")));

        let events = drain(&mut stream);
        let errors = events
            .iter()
            .filter(|e| matches!(e, ReadableEvent::Error(_)))
            .count();
        let closes = events
            .iter()
            .filter(|e| matches!(e, ReadableEvent::Close))
            .count();
        assert_eq!(errors, 1);
        assert_eq!(closes, 1);
        assert!(matches!(events.last(), Some(ReadableEvent::Close)));
        assert_eq!(stream.buffered_size(), 0);
        assert_eq!(stream.errored().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_pause_and_resume_events() {
        let mut stream: Readable = Readable::new(ReadableConfig::default());
        stream.resume();
        stream.resume();
        stream.pause();
        let events = drain(&mut stream);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ReadableEvent::Resume));
        assert!(matches!(events[1], ReadableEvent::Pause));
        assert_eq!(stream.flow_mode(), FlowMode::Paused);
    }

    #[test]
    fn test_staged_push_after_end_is_rejected() {
        let rejected = Arc::new(Mutex::new(Vec::new()));
        let log = rejected.clone();
        let producer = move |_: usize, pusher: &mut Pusher<i32>| {
            pusher.push(Chunk::value(1)).unwrap();
            pusher.end().unwrap();
            let late = pusher.push(Chunk::value(2)).unwrap_err();
            let again = pusher.end().unwrap_err();
            log.lock().unwrap().extend([late.violation(), again.violation()]);
        };
        let mut stream = Readable::from_fn(ReadableConfig::objects(), producer);

        assert_eq!(stream.read(None).unwrap().into_value(), Some(1));
        assert_eq!(
            *rejected.lock().unwrap(),
            vec![Some(ProtocolViolation::PushAfterEof); 2]
        );
        assert!(stream.is_ended());
    }

    #[test]
    fn test_staged_destroy_from_producer() {
        let mut stream: Readable = Readable::from_fn(ReadableConfig::default(), |_, pusher| {
            pusher.destroy(Some(StreamError::failed("source failed")));
        });
        stream.resume();
        let events = drain(&mut stream);
        assert!(events.iter().any(|e| matches!(e, ReadableEvent::Error(_))));
        assert!(matches!(events.last(), Some(ReadableEvent::Close)));
    }
}

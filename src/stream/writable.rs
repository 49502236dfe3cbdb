//! Sink state machine.
//!
//! A [`Writable`] queues written chunks and dispatches them one write (or
//! one batch) at a time to its consumer. Two consumer styles are supported:
//!
//! - **Consumer mode**: a [`Consumer`] receives every dispatch and either
//!   completes it synchronously with [`Completion::Ready`] or returns
//!   [`Completion::Pending`], in which case the owner reports the outcome
//!   later through [`Writable::complete`].
//! - **Manual mode** (no consumer): dispatches are handed out through
//!   [`Writable::take_dispatch`] and completed through
//!   [`Writable::complete`]. The async sink task works this way.
//!
//! # Example
//!
//! ```ignore
//! use flowstream::{Chunk, Dispatch, Writable, WritableConfig};
//!
//! let mut sink: Writable = Writable::new(WritableConfig::default().high_water_mark(10));
//! assert!(sink.write(Chunk::bytes(&b"hello"[..]))?);
//! if let Some(Dispatch::Write(chunk)) = sink.take_dispatch() {
//!     // ... perform I/O with chunk ...
//!     sink.complete(Ok(()))?;
//! }
//! ```

use std::collections::VecDeque;

use crate::chunk::{Chunk, Encoding};
use crate::config::{Mode, WritableConfig};
use crate::error::{ProtocolViolation, Result, StreamError};
use crate::stream::StreamId;

/// Callback invoked once a write completed or was discarded.
pub type WriteCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Notifications emitted by a [`Writable`].
#[derive(Debug, Clone)]
pub enum WritableEvent {
    /// Buffered size dropped below the high-water mark after a `write`
    /// returned `false`.
    Drain,
    /// All writes and the final step completed.
    Finish,
    /// The stream was destroyed with an error.
    Error(StreamError),
    /// The stream is closed. Always the last notification.
    Close,
}

/// Outcome of a consumer dispatch.
#[derive(Debug)]
pub enum Completion {
    /// Completed synchronously.
    Ready(Result<()>),
    /// Completes later through [`Writable::complete`].
    Pending,
}

/// Work handed to the owner of a manual-mode writable.
#[derive(Debug, Clone)]
pub enum Dispatch<T> {
    /// Write one chunk.
    Write(Chunk<T>),
    /// Write several chunks as one batch, in order.
    Writev(Vec<Chunk<T>>),
    /// Run the final step; everything before it completed.
    Final,
}

/// Data consumer behind a [`Writable`].
pub trait Consumer<T> {
    /// Write one chunk.
    fn write(&mut self, chunk: Chunk<T>) -> Completion;

    /// Whether [`writev`](Consumer::writev) is implemented.
    fn supports_writev(&self) -> bool {
        false
    }

    /// Write several chunks as one batch.
    fn writev(&mut self, _chunks: Vec<Chunk<T>>) -> Completion {
        Completion::Ready(Err(StreamError::failed("writev is not supported")))
    }

    /// Final step, run once after every write completed.
    fn finish(&mut self) -> Completion {
        Completion::Ready(Ok(()))
    }

    /// The stream was destroyed. Called exactly once.
    fn destroy(&mut self, _error: Option<&StreamError>) {}
}

/// Consumer backed by a synchronous closure.
struct FnConsumer<F>(F);

impl<T, F> Consumer<T> for FnConsumer<F>
where
    F: FnMut(Chunk<T>) -> Result<()>,
{
    fn write(&mut self, chunk: Chunk<T>) -> Completion {
        Completion::Ready((self.0)(chunk))
    }
}

struct PendingWrite<T> {
    chunk: Chunk<T>,
    size: usize,
    callback: Option<WriteCallback>,
}

enum InFlight {
    Writes {
        callbacks: Vec<Option<WriteCallback>>,
        size: usize,
    },
    Final,
}

/// Writable stream state machine.
pub struct Writable<T = ()> {
    id: StreamId,
    mode: Mode,
    high_water_mark: usize,
    default_encoding: Option<Encoding>,
    pending: VecDeque<PendingWrite<T>>,
    buffered_size: usize,
    cork_depth: usize,
    in_flight: Option<InFlight>,
    outbox: Option<Dispatch<T>>,
    writev: bool,
    ending: bool,
    final_started: bool,
    finished: bool,
    need_drain: bool,
    destroyed: bool,
    errored: Option<StreamError>,
    auto_destroy: bool,
    piped_from: Option<StreamId>,
    events: VecDeque<WritableEvent>,
    consumer: Option<Box<dyn Consumer<T> + Send>>,
}

impl<T> Writable<T> {
    /// Create a manual-mode writable.
    pub fn new(config: WritableConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a writable feeding a consumer.
    pub fn with_consumer<C>(config: WritableConfig, consumer: C) -> Self
    where
        C: Consumer<T> + Send + 'static,
    {
        Self::build(config, Some(Box::new(consumer)))
    }

    /// Create a writable feeding a synchronous closure.
    pub fn from_fn<F>(config: WritableConfig, f: F) -> Self
    where
        F: FnMut(Chunk<T>) -> Result<()> + Send + 'static,
    {
        Self::build(config, Some(Box::new(FnConsumer(f))))
    }

    fn build(config: WritableConfig, consumer: Option<Box<dyn Consumer<T> + Send>>) -> Self {
        Self {
            id: StreamId::next(),
            mode: config.mode(),
            high_water_mark: config.effective_high_water_mark(),
            default_encoding: config.encoding,
            pending: VecDeque::new(),
            buffered_size: 0,
            cork_depth: 0,
            in_flight: None,
            outbox: None,
            writev: config.writev,
            ending: false,
            final_started: false,
            finished: false,
            need_drain: false,
            destroyed: false,
            errored: None,
            auto_destroy: config.auto_destroy,
            piped_from: None,
            events: VecDeque::new(),
            consumer,
        }
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

    /// High-water mark.
    #[inline]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Size of queued plus in-flight writes.
    #[inline]
    pub fn buffered_size(&self) -> usize {
        self.buffered_size
    }

    /// Number of queued (not yet dispatched) writes.
    #[inline]
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Current cork depth.
    #[inline]
    pub fn cork_depth(&self) -> usize {
        self.cork_depth
    }

    /// Whether a dispatch is in flight.
    #[inline]
    pub fn is_writing(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether `end` was called.
    #[inline]
    pub fn is_ending(&self) -> bool {
        self.ending
    }

    /// Whether `Finish` was emitted.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
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

    /// Whether a `Drain` is owed to writers.
    #[inline]
    pub fn needs_drain(&self) -> bool {
        self.need_drain
    }

    /// Whether dispatches go through [`take_dispatch`](Self::take_dispatch).
    #[inline]
    pub fn is_manual(&self) -> bool {
        self.consumer.is_none()
    }

    /// Stream currently piping into this one.
    #[inline]
    pub fn piped_from(&self) -> Option<StreamId> {
        self.piped_from
    }

    /// Write a chunk. Returns `false` once the buffered size reached the
    /// high-water mark.
    pub fn write(&mut self, chunk: Chunk<T>) -> Result<bool> {
        self.write_inner(chunk, None)
    }

    /// Write a chunk and get notified when it completed or was discarded.
    pub fn write_with<F>(&mut self, chunk: Chunk<T>, on_done: F) -> Result<bool>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.write_inner(chunk, Some(Box::new(on_done)))
    }

    fn write_inner(&mut self, chunk: Chunk<T>, callback: Option<WriteCallback>) -> Result<bool> {
        let accepted = if self.ending {
            tracing::warn!(stream = %self.id, "write after end");
            Err(StreamError::from(ProtocolViolation::WriteAfterEnd))
        } else if self.destroyed {
            Err(StreamError::Destroyed("write"))
        } else {
            chunk.normalize(self.mode, self.default_encoding)
        };
        let chunk = match accepted {
            Ok(chunk) => chunk,
            Err(e) => {
                if let Some(callback) = callback {
                    callback(Err(e.clone()));
                }
                return Err(e);
            }
        };

        let size = chunk.size(self.mode);
        self.buffered_size += size;

        let ok = self.buffered_size < self.high_water_mark;
        if !ok {
            self.need_drain = true;
        }
        tracing::trace!(stream = %self.id, size, buffered = self.buffered_size, "chunk written");

        self.pending.push_back(PendingWrite {
            chunk,
            size,
            callback,
        });
        self.dispatch_next();
        Ok(ok)
    }

    /// Hold dispatches until the matching [`uncork`](Self::uncork).
    pub fn cork(&mut self) {
        self.cork_depth += 1;
    }

    /// Release one cork level; at zero queued writes are dispatched.
    pub fn uncork(&mut self) {
        if self.cork_depth == 0 {
            return;
        }
        self.cork_depth -= 1;
        if self.cork_depth == 0 {
            self.dispatch_next();
        }
    }

    /// Signal that no more data will be written.
    ///
    /// The optional chunk is written first. Once every write completed the
    /// final step runs and `Finish` is emitted.
    pub fn end(&mut self, chunk: Option<Chunk<T>>) -> Result<()> {
        if let Some(chunk) = chunk {
            self.write(chunk)?;
        }
        self.cork_depth = 0;

        if self.finished {
            tracing::warn!(stream = %self.id, "end after finish");
            return Err(ProtocolViolation::AlreadyFinished.into());
        }
        if self.destroyed {
            return Err(StreamError::Destroyed("end"));
        }
        if self.ending {
            return Ok(());
        }

        tracing::debug!(stream = %self.id, buffered = self.buffered_size, "writable ending");
        self.ending = true;
        self.dispatch_next();
        Ok(())
    }

    /// Take the next dispatch (manual mode).
    pub fn take_dispatch(&mut self) -> Option<Dispatch<T>> {
        self.outbox.take()
    }

    /// Whether a dispatch waits in [`take_dispatch`](Self::take_dispatch).
    #[inline]
    pub fn has_dispatch(&self) -> bool {
        self.outbox.is_some()
    }

    /// Report the outcome of the in-flight dispatch.
    ///
    /// Completions arriving after the stream was destroyed are ignored.
    pub fn complete(&mut self, result: Result<()>) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        if self.in_flight.is_none() {
            tracing::warn!(stream = %self.id, "write completed twice");
            return Err(ProtocolViolation::MultipleCallback.into());
        }
        self.outbox = None;
        self.on_complete(result);
        self.dispatch_next();
        Ok(())
    }

    /// Destroy the stream. Idempotent.
    ///
    /// Queued and in-flight write callbacks complete with the error (or
    /// `Destroyed("write")`); `Error` (when given) then `Close` is queued.
    pub fn destroy(&mut self, error: Option<StreamError>) {
        if self.destroyed {
            return;
        }
        tracing::debug!(stream = %self.id, error = ?error, "writable destroyed");
        self.destroyed = true;

        let reason = error.clone().unwrap_or(StreamError::Destroyed("write"));
        if let Some(InFlight::Writes { callbacks, .. }) = self.in_flight.take() {
            for callback in callbacks.into_iter().flatten() {
                callback(Err(reason.clone()));
            }
        }
        self.outbox = None;
        for write in self.pending.drain(..) {
            if let Some(callback) = write.callback {
                callback(Err(reason.clone()));
            }
        }
        self.buffered_size = 0;

        if let Some(consumer) = self.consumer.as_mut() {
            consumer.destroy(error.as_ref());
        }
        if let Some(e) = error {
            self.errored = Some(e.clone());
            self.events.push_back(WritableEvent::Error(e));
        }
        self.events.push_back(WritableEvent::Close);
    }

    /// Next queued notification.
    pub fn next_event(&mut self) -> Option<WritableEvent> {
        self.events.pop_front()
    }

    /// Whether notifications are queued.
    #[inline]
    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Register the stream piping into this one.
    pub fn attach_pipe(&mut self, source: StreamId) -> Result<()> {
        match self.piped_from {
            Some(current) if current != source => Err(StreamError::AlreadyPiped(current)),
            _ => {
                self.piped_from = Some(source);
                Ok(())
            }
        }
    }

    /// Forget the stream piping into this one.
    pub fn detach_pipe(&mut self, source: StreamId) {
        if self.piped_from == Some(source) {
            self.piped_from = None;
        }
    }

    fn dispatch_next(&mut self) {
        loop {
            if self.destroyed
                || self.cork_depth > 0
                || self.in_flight.is_some()
                || self.outbox.is_some()
            {
                return;
            }
            if self.pending.is_empty() {
                self.finish_maybe();
                return;
            }

            let batched = self.pending.len() > 1
                && match &self.consumer {
                    Some(consumer) => consumer.supports_writev(),
                    None => self.writev,
                };
            let (dispatch, callbacks, size) = if batched {
                let mut chunks = Vec::with_capacity(self.pending.len());
                let mut callbacks = Vec::with_capacity(self.pending.len());
                let mut size = 0;
                for write in self.pending.drain(..) {
                    size += write.size;
                    chunks.push(write.chunk);
                    callbacks.push(write.callback);
                }
                (Dispatch::Writev(chunks), callbacks, size)
            } else {
                let Some(write) = self.pending.pop_front() else {
                    return;
                };
                (Dispatch::Write(write.chunk), vec![write.callback], write.size)
            };

            self.in_flight = Some(InFlight::Writes { callbacks, size });
            let completion = match self.consumer.as_mut() {
                Some(consumer) => match dispatch {
                    Dispatch::Write(chunk) => consumer.write(chunk),
                    Dispatch::Writev(chunks) => consumer.writev(chunks),
                    Dispatch::Final => consumer.finish(),
                },
                None => {
                    self.outbox = Some(dispatch);
                    return;
                }
            };
            match completion {
                Completion::Ready(result) => self.on_complete(result),
                Completion::Pending => return,
            }
        }
    }

    fn finish_maybe(&mut self) {
        if !self.ending
            || self.final_started
            || self.destroyed
            || self.in_flight.is_some()
            || !self.pending.is_empty()
        {
            return;
        }
        self.final_started = true;
        self.in_flight = Some(InFlight::Final);

        let completion = match self.consumer.as_mut() {
            Some(consumer) => consumer.finish(),
            None => {
                self.outbox = Some(Dispatch::Final);
                return;
            }
        };
        if let Completion::Ready(result) = completion {
            self.on_complete(result);
        }
    }

    fn on_complete(&mut self, result: Result<()>) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };

        match (in_flight, result) {
            (InFlight::Writes { callbacks, size }, Ok(())) => {
                self.buffered_size -= size;
                if self.need_drain
                    && self.buffered_size < self.high_water_mark
                    && !self.ending
                {
                    self.need_drain = false;
                    self.events.push_back(WritableEvent::Drain);
                }
                for callback in callbacks.into_iter().flatten() {
                    callback(Ok(()));
                }
            }
            (InFlight::Writes { callbacks, size }, Err(e)) => {
                self.buffered_size -= size;
                for callback in callbacks.into_iter().flatten() {
                    callback(Err(e.clone()));
                }
                self.destroy(Some(e));
            }
            (InFlight::Final, Ok(())) => {
                tracing::debug!(stream = %self.id, "writable finished");
                self.finished = true;
                self.events.push_back(WritableEvent::Finish);
                if self.auto_destroy {
                    self.destroy(None);
                }
            }
            (InFlight::Final, Err(e)) => self.destroy(Some(e)),
        }
    }
}

impl<T> std::fmt::Debug for Writable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writable")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("buffered", &self.buffered_size)
            .field("high_water_mark", &self.high_water_mark)
            .field("cork_depth", &self.cork_depth)
            .field("ending", &self.ending)
            .field("finished", &self.finished)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

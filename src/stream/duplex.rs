//! Duplex composite: one readable and one writable side.
//!
//! The sides keep independent lifecycles except for three links:
//!
//! - destroying either side destroys the other with the same error;
//! - with `allow_half_open == false` the readable `End` ends the writable
//!   side and the writable `Finish` destroys the readable side;
//! - with `auto_destroy` the duplex destroys itself once `End` was emitted
//!   and the writable side finished.
//!
//! Events of both sides are available merged through
//! [`Duplex::next_event`] (one `Error`, one final `Close`) or split per side
//! through the [`Source`](super::Source) and [`Sink`](super::Sink) views.

use std::collections::VecDeque;

use crate::chunk::{Chunk, Encoding};
use crate::config::DuplexConfig;
use crate::error::{Result, StreamError};
use crate::stream::readable::{Producer, Readable, ReadableEvent};
use crate::stream::writable::{Consumer, Dispatch, Writable, WritableEvent};
use crate::stream::StreamId;

/// Merged notifications of a [`Duplex`].
#[derive(Debug, Clone)]
pub enum DuplexEvent<T> {
    /// Readable side delivered a chunk.
    Data(Chunk<T>),
    /// Readable side has data or EOF to read.
    Readable,
    /// Readable side paused.
    Pause,
    /// Readable side resumed.
    Resume,
    /// Readable side ended.
    End,
    /// Writable side drained.
    Drain,
    /// Writable side finished.
    Finish,
    /// The duplex failed. Reported once.
    Error(StreamError),
    /// Both sides closed. Always last.
    Close,
}

/// Duplex stream.
pub struct Duplex<T = ()> {
    id: StreamId,
    pub(crate) readable: Readable<T>,
    pub(crate) writable: Writable<T>,
    allow_half_open: bool,
    auto_destroy: bool,
    destroyed: bool,
    error_reported: bool,
    readable_closed: bool,
    writable_closed: bool,
    merged_error: bool,
    merged_close: bool,
    read_events: VecDeque<ReadableEvent<T>>,
    write_events: VecDeque<WritableEvent>,
}

impl<T> Duplex<T> {
    /// Create a duplex with an externally fed readable side and a
    /// manual-mode writable side.
    pub fn new(config: DuplexConfig) -> Self {
        let readable = Readable::new(config.readable.clone().auto_destroy(false));
        let writable = Writable::new(config.writable.clone().auto_destroy(false));
        Self::assemble(&config, readable, writable)
    }

    /// Create a duplex from a producer and a consumer.
    pub fn with_parts<P, C>(config: DuplexConfig, producer: P, consumer: C) -> Self
    where
        P: Producer<T> + Send + 'static,
        C: Consumer<T> + Send + 'static,
    {
        let readable =
            Readable::with_producer(config.readable.clone().auto_destroy(false), producer);
        let writable =
            Writable::with_consumer(config.writable.clone().auto_destroy(false), consumer);
        Self::assemble(&config, readable, writable)
    }

    fn assemble(config: &DuplexConfig, readable: Readable<T>, writable: Writable<T>) -> Self {
        Self {
            id: StreamId::next(),
            readable,
            writable,
            allow_half_open: config.allow_half_open,
            auto_destroy: config.auto_destroy,
            destroyed: false,
            error_reported: false,
            readable_closed: false,
            writable_closed: false,
            merged_error: false,
            merged_close: false,
            read_events: VecDeque::new(),
            write_events: VecDeque::new(),
        }
    }

    /// Stream identifier.
    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Readable side.
    #[inline]
    pub fn readable(&self) -> &Readable<T> {
        &self.readable
    }

    /// Writable side.
    #[inline]
    pub fn writable(&self) -> &Writable<T> {
        &self.writable
    }

    /// Whether the duplex was destroyed.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed || (self.readable.is_destroyed() && self.writable.is_destroyed())
    }

    /// Whether one side may stay open after the other completed.
    #[inline]
    pub fn allows_half_open(&self) -> bool {
        self.allow_half_open
    }

    /// Push into the readable side.
    pub fn push(&mut self, chunk: Option<Chunk<T>>) -> Result<bool> {
        self.readable.push(chunk)
    }

    /// Unshift into the readable side.
    pub fn unshift(&mut self, chunk: Chunk<T>) -> Result<bool> {
        self.readable.unshift(chunk)
    }

    /// Read from the readable side.
    pub fn read(&mut self, n: Option<usize>) -> Option<Chunk<T>> {
        self.readable.read(n)
    }

    /// Resume the readable side.
    pub fn resume(&mut self) {
        self.readable.resume();
    }

    /// Pause the readable side.
    pub fn pause(&mut self) {
        self.readable.pause();
    }

    /// Decode the readable side.
    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.readable.set_encoding(encoding);
    }

    /// Write into the writable side.
    pub fn write(&mut self, chunk: Chunk<T>) -> Result<bool> {
        self.writable.write(chunk)
    }

    /// Write into the writable side with a completion callback.
    pub fn write_with<F>(&mut self, chunk: Chunk<T>, on_done: F) -> Result<bool>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.writable.write_with(chunk, on_done)
    }

    /// Cork the writable side.
    pub fn cork(&mut self) {
        self.writable.cork();
    }

    /// Uncork the writable side.
    pub fn uncork(&mut self) {
        self.writable.uncork();
    }

    /// End the writable side.
    pub fn end(&mut self, chunk: Option<Chunk<T>>) -> Result<()> {
        self.writable.end(chunk)
    }

    /// Next dispatch of a manual-mode writable side.
    pub fn take_dispatch(&mut self) -> Option<Dispatch<T>> {
        self.writable.take_dispatch()
    }

    /// Complete the in-flight dispatch of the writable side.
    pub fn complete(&mut self, result: Result<()>) -> Result<()> {
        self.writable.complete(result)
    }

    /// Destroy both sides. Idempotent.
    pub fn destroy(&mut self, error: Option<StreamError>) {
        if self.destroyed {
            return;
        }
        tracing::debug!(stream = %self.id, error = ?error, "duplex destroyed");
        self.destroyed = true;
        self.writable.destroy(error.clone());
        self.readable.destroy(error);
    }

    /// Next merged notification.
    pub fn next_event(&mut self) -> Option<DuplexEvent<T>> {
        loop {
            while self.pull_writable() {}
            if self.read_events.is_empty() && self.pull_readable() {
                continue;
            }

            if !matches!(self.write_events.front(), None | Some(WritableEvent::Close)) {
                match self.write_events.pop_front() {
                    Some(WritableEvent::Drain) => return Some(DuplexEvent::Drain),
                    Some(WritableEvent::Finish) => return Some(DuplexEvent::Finish),
                    Some(WritableEvent::Error(e)) => {
                        if let Some(event) = self.report_merged_error(e) {
                            return Some(event);
                        }
                        continue;
                    }
                    _ => continue,
                }
            }

            if !matches!(self.read_events.front(), None | Some(ReadableEvent::Close)) {
                match self.read_events.pop_front() {
                    Some(ReadableEvent::Data(chunk)) => return Some(DuplexEvent::Data(chunk)),
                    Some(ReadableEvent::Readable) => return Some(DuplexEvent::Readable),
                    Some(ReadableEvent::Pause) => return Some(DuplexEvent::Pause),
                    Some(ReadableEvent::Resume) => return Some(DuplexEvent::Resume),
                    Some(ReadableEvent::End) => return Some(DuplexEvent::End),
                    Some(ReadableEvent::Error(e)) => {
                        if let Some(event) = self.report_merged_error(e) {
                            return Some(event);
                        }
                        continue;
                    }
                    _ => continue,
                }
            }

            let write_closed = matches!(self.write_events.front(), Some(WritableEvent::Close));
            let read_closed = matches!(self.read_events.front(), Some(ReadableEvent::Close));
            if !write_closed && !read_closed {
                return None;
            }
            if write_closed {
                self.write_events.pop_front();
            }
            if read_closed {
                self.read_events.pop_front();
            }
            if !self.merged_close {
                self.merged_close = true;
                return Some(DuplexEvent::Close);
            }
        }
    }

    /// Next readable-side notification.
    pub(crate) fn next_read_event(&mut self) -> Option<ReadableEvent<T>> {
        loop {
            if let Some(event) = self.read_events.pop_front() {
                return Some(event);
            }
            while self.pull_writable() {}
            if !self.read_events.is_empty() {
                continue;
            }
            if !self.pull_readable() {
                return None;
            }
        }
    }

    /// Next writable-side notification.
    pub(crate) fn next_write_event(&mut self) -> Option<WritableEvent> {
        loop {
            if let Some(event) = self.write_events.pop_front() {
                return Some(event);
            }
            if self.pull_writable() {
                continue;
            }
            if self.read_events.is_empty() && self.pull_readable() {
                continue;
            }
            return None;
        }
    }

    fn report_merged_error(&mut self, error: StreamError) -> Option<DuplexEvent<T>> {
        if self.merged_error {
            return None;
        }
        self.merged_error = true;
        Some(DuplexEvent::Error(error))
    }

    fn pull_readable(&mut self) -> bool {
        let Some(event) = self.readable.next_event() else {
            return false;
        };
        match event {
            ReadableEvent::End => {
                self.read_events.push_back(ReadableEvent::End);
                if !self.allow_half_open
                    && !self.writable.is_ending()
                    && !self.writable.is_destroyed()
                {
                    if let Err(e) = self.writable.end(None) {
                        tracing::warn!(
                            stream = %self.id,
                            error = %e,
                            "failed to end writable side"
                        );
                    }
                }
                self.check_auto_destroy();
            }
            ReadableEvent::Error(e) => {
                self.report_error(e.clone());
                self.writable.destroy(Some(e));
            }
            ReadableEvent::Close => {
                self.readable_closed = true;
                if !self.writable.is_destroyed() {
                    let error = self.readable.errored().cloned();
                    self.writable.destroy(error);
                }
                self.maybe_close();
            }
            other => self.read_events.push_back(other),
        }
        true
    }

    fn pull_writable(&mut self) -> bool {
        let Some(event) = self.writable.next_event() else {
            return false;
        };
        match event {
            WritableEvent::Finish => {
                self.write_events.push_back(WritableEvent::Finish);
                if !self.allow_half_open {
                    self.readable.destroy(None);
                }
                self.check_auto_destroy();
            }
            WritableEvent::Error(e) => {
                self.report_error(e.clone());
                self.readable.destroy(Some(e));
            }
            WritableEvent::Close => {
                self.writable_closed = true;
                if !self.readable.is_destroyed() {
                    let error = self.writable.errored().cloned();
                    self.readable.destroy(error);
                }
                self.maybe_close();
            }
            WritableEvent::Drain => self.write_events.push_back(WritableEvent::Drain),
        }
        true
    }

    fn report_error(&mut self, error: StreamError) {
        if self.error_reported {
            return;
        }
        self.error_reported = true;
        self.read_events.push_back(ReadableEvent::Error(error.clone()));
        self.write_events.push_back(WritableEvent::Error(error));
    }

    fn maybe_close(&mut self) {
        if self.readable_closed && self.writable_closed {
            self.destroyed = true;
            self.read_events.push_back(ReadableEvent::Close);
            self.write_events.push_back(WritableEvent::Close);
        }
    }

    fn check_auto_destroy(&mut self) {
        if self.auto_destroy && self.readable.is_end_emitted() && self.writable.is_finished() {
            self.destroy(None);
        }
    }
}

impl<T> std::fmt::Debug for Duplex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex")
            .field("id", &self.id)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("allow_half_open", &self.allow_half_open)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

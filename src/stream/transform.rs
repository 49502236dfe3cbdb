//! Transform composite.
//!
//! A [`Transform`] is a [`Duplex`] whose writable side feeds every chunk to
//! a [`TransformStep`]; the step output is pushed into the readable side.
//! Batched input runs one chunk at a time. While the readable buffer is at
//! or above its high-water mark no further input is transformed and
//! completion of the current dispatch is held, which keeps later writes
//! queued on the writable side until the readable side drains.

use std::collections::VecDeque;

use crate::chunk::{Chunk, Encoding};
use crate::config::DuplexConfig;
use crate::error::{Result, StreamError};
use crate::stream::duplex::{Duplex, DuplexEvent};
use crate::stream::readable::{Readable, ReadableEvent};
use crate::stream::writable::{Dispatch, Writable, WritableEvent};
use crate::stream::StreamId;

/// User transformation run for every written chunk.
pub trait TransformStep<T> {
    /// Transform one input chunk into zero or more output chunks.
    fn transform(&mut self, chunk: Chunk<T>, output: &mut Vec<Chunk<T>>) -> Result<()>;

    /// Emit trailing output once the writable side ended.
    fn flush(&mut self, _output: &mut Vec<Chunk<T>>) -> Result<()> {
        Ok(())
    }
}

struct FnStep<F>(F);

impl<T, F> TransformStep<T> for FnStep<F>
where
    F: FnMut(Chunk<T>, &mut Vec<Chunk<T>>) -> Result<()>,
{
    fn transform(&mut self, chunk: Chunk<T>, output: &mut Vec<Chunk<T>>) -> Result<()> {
        (self.0)(chunk, output)
    }
}

/// Identity transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl<T> TransformStep<T> for PassThrough {
    fn transform(&mut self, chunk: Chunk<T>, output: &mut Vec<Chunk<T>>) -> Result<()> {
        output.push(chunk);
        Ok(())
    }
}

/// Transform stream.
pub struct Transform<T = ()> {
    duplex: Duplex<T>,
    step: Box<dyn TransformStep<T> + Send>,
    /// Inputs of the in-flight dispatch not yet transformed.
    input: VecDeque<Chunk<T>>,
    in_flight: bool,
}

impl<T> Transform<T> {
    /// Create a transform running `step`.
    pub fn new<S>(config: DuplexConfig, step: S) -> Self
    where
        S: TransformStep<T> + Send + 'static,
    {
        Self {
            duplex: Duplex::new(config),
            step: Box::new(step),
            input: VecDeque::new(),
            in_flight: false,
        }
    }

    /// Create a transform from a closure.
    pub fn from_fn<F>(config: DuplexConfig, f: F) -> Self
    where
        F: FnMut(Chunk<T>, &mut Vec<Chunk<T>>) -> Result<()> + Send + 'static,
    {
        Self::new(config, FnStep(f))
    }

    /// Create a pass-through transform.
    pub fn pass_through(config: DuplexConfig) -> Self {
        Self::new(config, PassThrough)
    }

    /// Stream identifier.
    #[inline]
    pub fn id(&self) -> StreamId {
        self.duplex.id()
    }

    /// Readable side.
    #[inline]
    pub fn readable(&self) -> &Readable<T> {
        self.duplex.readable()
    }

    /// Writable side.
    #[inline]
    pub fn writable(&self) -> &Writable<T> {
        self.duplex.writable()
    }

    /// Whether the transform was destroyed.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.duplex.is_destroyed()
    }

    /// Write an input chunk.
    pub fn write(&mut self, chunk: Chunk<T>) -> Result<bool> {
        let ok = self.duplex.write(chunk);
        self.pump();
        ok
    }

    /// Write an input chunk with a completion callback.
    pub fn write_with<F>(&mut self, chunk: Chunk<T>, on_done: F) -> Result<bool>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let ok = self.duplex.write_with(chunk, on_done);
        self.pump();
        ok
    }

    /// Cork the writable side.
    pub fn cork(&mut self) {
        self.duplex.cork();
    }

    /// Uncork the writable side.
    pub fn uncork(&mut self) {
        self.duplex.uncork();
        self.pump();
    }

    /// End the input; the flush step runs once every input completed.
    pub fn end(&mut self, chunk: Option<Chunk<T>>) -> Result<()> {
        let result = self.duplex.end(chunk);
        self.pump();
        result
    }

    /// Read transformed output.
    pub fn read(&mut self, n: Option<usize>) -> Option<Chunk<T>> {
        self.pump();
        let chunk = self.duplex.read(n);
        self.pump();
        chunk
    }

    /// Resume the readable side.
    pub fn resume(&mut self) {
        self.duplex.resume();
    }

    /// Pause the readable side.
    pub fn pause(&mut self) {
        self.duplex.pause();
    }

    /// Decode the readable side.
    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.duplex.set_encoding(encoding);
    }

    /// Destroy both sides. Idempotent.
    pub fn destroy(&mut self, error: Option<StreamError>) {
        self.duplex.destroy(error);
    }

    /// Next merged notification.
    pub fn next_event(&mut self) -> Option<DuplexEvent<T>> {
        self.pump();
        self.duplex.next_event()
    }

    pub(crate) fn duplex_mut(&mut self) -> &mut Duplex<T> {
        &mut self.duplex
    }

    pub(crate) fn next_read_event(&mut self) -> Option<ReadableEvent<T>> {
        self.pump();
        self.duplex.next_read_event()
    }

    pub(crate) fn next_write_event(&mut self) -> Option<WritableEvent> {
        self.pump();
        self.duplex.next_write_event()
    }

    fn output_full(&self) -> bool {
        let readable = self.duplex.readable();
        let size = readable.buffered_size();
        size > 0 && size >= readable.high_water_mark()
    }

    /// Run the step over pending input and release held completions.
    fn pump(&mut self) {
        loop {
            if self.duplex.is_destroyed() {
                self.input.clear();
                return;
            }
            if self.in_flight {
                if self.output_full() {
                    return;
                }
                if let Some(chunk) = self.input.pop_front() {
                    self.run(chunk);
                    continue;
                }
                self.in_flight = false;
                self.complete_input();
                continue;
            }

            let Some(dispatch) = self.duplex.take_dispatch() else {
                return;
            };
            match dispatch {
                Dispatch::Write(chunk) => {
                    self.input.push_back(chunk);
                    self.in_flight = true;
                }
                Dispatch::Writev(chunks) => {
                    self.input.extend(chunks);
                    self.in_flight = true;
                }
                Dispatch::Final => self.flush(),
            }
        }
    }

    fn run(&mut self, chunk: Chunk<T>) {
        let mut output = Vec::new();
        if let Err(e) = self.step.transform(chunk, &mut output) {
            tracing::debug!(stream = %self.duplex.id(), error = %e, "transform step failed");
            self.duplex.destroy(Some(e));
            return;
        }
        self.emit(output);
    }

    fn flush(&mut self) {
        let mut output = Vec::new();
        if let Err(e) = self.step.flush(&mut output) {
            tracing::debug!(stream = %self.duplex.id(), error = %e, "transform flush failed");
            self.duplex.destroy(Some(e));
            return;
        }
        if !self.emit(output) {
            return;
        }
        if let Err(e) = self.duplex.push(None) {
            tracing::warn!(
                stream = %self.duplex.id(),
                error = %e,
                "transform output already ended"
            );
        }
        self.complete_input();
    }

    fn emit(&mut self, output: Vec<Chunk<T>>) -> bool {
        for chunk in output {
            if let Err(e) = self.duplex.push(Some(chunk)) {
                if e.violation().is_some() {
                    tracing::warn!(
                        stream = %self.duplex.id(),
                        error = %e,
                        "transform output rejected"
                    );
                    continue;
                }
                self.duplex.destroy(Some(e));
                return false;
            }
        }
        true
    }

    fn complete_input(&mut self) {
        if let Err(e) = self.duplex.complete(Ok(())) {
            tracing::warn!(stream = %self.duplex.id(), error = %e, "transform completion rejected");
        }
    }
}

impl<T> std::fmt::Debug for Transform<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transform")
            .field("duplex", &self.duplex)
            .field("pending_input", &self.input.len())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

//! Object-safe endpoint views used by the pipe controller.

use crate::chunk::Chunk;
use crate::error::{Result, StreamError};
use crate::stream::duplex::Duplex;
use crate::stream::readable::{Readable, ReadableEvent};
use crate::stream::transform::Transform;
use crate::stream::writable::{Writable, WritableEvent};
use crate::stream::StreamId;

/// Readable end of a pipe link.
pub trait Source<T> {
    /// Identifier of the readable side.
    fn source_id(&self) -> StreamId;

    /// Next readable-side notification.
    fn next_read_event(&mut self) -> Option<ReadableEvent<T>>;

    /// Switch to flowing mode.
    fn resume(&mut self);

    /// Switch to paused mode.
    fn pause(&mut self);

    /// Whether the source is flowing.
    fn is_flowing(&self) -> bool;

    /// Destroy the source (and whatever it is part of).
    fn destroy_source(&mut self, error: Option<StreamError>);
}

/// Writable end of a pipe link.
pub trait Sink<T> {
    /// Identifier of the writable side.
    fn sink_id(&self) -> StreamId;

    /// Write a chunk; `false` asks the writer to wait for `Drain`.
    fn write(&mut self, chunk: Chunk<T>) -> Result<bool>;

    /// Signal that no more data follows.
    fn end(&mut self) -> Result<()>;

    /// Next writable-side notification.
    fn next_write_event(&mut self) -> Option<WritableEvent>;

    /// Whether `Finish` was reached.
    fn is_finished(&self) -> bool;

    /// Destroy the sink (and whatever it is part of).
    fn destroy_sink(&mut self, error: Option<StreamError>);

    /// Whether the writable side was destroyed.
    fn is_sink_destroyed(&self) -> bool;

    /// The error the writable side was destroyed with.
    fn sink_errored(&self) -> Option<&StreamError>;

    /// Register the driving source.
    fn attach_pipe(&mut self, source: StreamId) -> Result<()>;

    /// Forget the driving source.
    fn detach_pipe(&mut self, source: StreamId);
}

/// A stream usable in the middle of a pipeline.
pub trait Stage<T>: Source<T> + Sink<T> {
    /// View as a source.
    fn as_source(&mut self) -> &mut dyn Source<T>;

    /// View as a sink.
    fn as_sink(&mut self) -> &mut dyn Sink<T>;
}

impl<T, S> Stage<T> for S
where
    S: Source<T> + Sink<T>,
{
    fn as_source(&mut self) -> &mut dyn Source<T> {
        self
    }

    fn as_sink(&mut self) -> &mut dyn Sink<T> {
        self
    }
}

impl<T> Source<T> for Readable<T> {
    fn source_id(&self) -> StreamId {
        self.id()
    }

    fn next_read_event(&mut self) -> Option<ReadableEvent<T>> {
        self.next_event()
    }

    fn resume(&mut self) {
        Readable::resume(self)
    }

    fn pause(&mut self) {
        Readable::pause(self)
    }

    fn is_flowing(&self) -> bool {
        Readable::is_flowing(self)
    }

    fn destroy_source(&mut self, error: Option<StreamError>) {
        self.destroy(error)
    }
}

impl<T> Sink<T> for Writable<T> {
    fn sink_id(&self) -> StreamId {
        self.id()
    }

    fn write(&mut self, chunk: Chunk<T>) -> Result<bool> {
        Writable::write(self, chunk)
    }

    fn end(&mut self) -> Result<()> {
        Writable::end(self, None)
    }

    fn next_write_event(&mut self) -> Option<WritableEvent> {
        self.next_event()
    }

    fn is_finished(&self) -> bool {
        Writable::is_finished(self)
    }

    fn destroy_sink(&mut self, error: Option<StreamError>) {
        self.destroy(error)
    }

    fn is_sink_destroyed(&self) -> bool {
        Writable::is_destroyed(self)
    }

    fn sink_errored(&self) -> Option<&StreamError> {
        Writable::errored(self)
    }

    fn attach_pipe(&mut self, source: StreamId) -> Result<()> {
        Writable::attach_pipe(self, source)
    }

    fn detach_pipe(&mut self, source: StreamId) {
        Writable::detach_pipe(self, source)
    }
}

impl<T> Source<T> for Duplex<T> {
    fn source_id(&self) -> StreamId {
        self.readable.id()
    }

    fn next_read_event(&mut self) -> Option<ReadableEvent<T>> {
        Duplex::next_read_event(self)
    }

    fn resume(&mut self) {
        Duplex::resume(self)
    }

    fn pause(&mut self) {
        Duplex::pause(self)
    }

    fn is_flowing(&self) -> bool {
        self.readable.is_flowing()
    }

    fn destroy_source(&mut self, error: Option<StreamError>) {
        self.destroy(error)
    }
}

impl<T> Sink<T> for Duplex<T> {
    fn sink_id(&self) -> StreamId {
        self.writable.id()
    }

    fn write(&mut self, chunk: Chunk<T>) -> Result<bool> {
        Duplex::write(self, chunk)
    }

    fn end(&mut self) -> Result<()> {
        Duplex::end(self, None)
    }

    fn next_write_event(&mut self) -> Option<WritableEvent> {
        Duplex::next_write_event(self)
    }

    fn is_finished(&self) -> bool {
        self.writable.is_finished()
    }

    fn destroy_sink(&mut self, error: Option<StreamError>) {
        self.destroy(error)
    }

    fn is_sink_destroyed(&self) -> bool {
        self.writable.is_destroyed()
    }

    fn sink_errored(&self) -> Option<&StreamError> {
        self.writable.errored()
    }

    fn attach_pipe(&mut self, source: StreamId) -> Result<()> {
        self.writable.attach_pipe(source)
    }

    fn detach_pipe(&mut self, source: StreamId) {
        self.writable.detach_pipe(source)
    }
}

impl<T> Source<T> for Transform<T> {
    fn source_id(&self) -> StreamId {
        self.readable().id()
    }

    fn next_read_event(&mut self) -> Option<ReadableEvent<T>> {
        Transform::next_read_event(self)
    }

    fn resume(&mut self) {
        Transform::resume(self)
    }

    fn pause(&mut self) {
        Transform::pause(self)
    }

    fn is_flowing(&self) -> bool {
        self.readable().is_flowing()
    }

    fn destroy_source(&mut self, error: Option<StreamError>) {
        self.destroy(error)
    }
}

impl<T> Sink<T> for Transform<T> {
    fn sink_id(&self) -> StreamId {
        self.writable().id()
    }

    fn write(&mut self, chunk: Chunk<T>) -> Result<bool> {
        Transform::write(self, chunk)
    }

    fn end(&mut self) -> Result<()> {
        Transform::end(self, None)
    }

    fn next_write_event(&mut self) -> Option<WritableEvent> {
        Transform::next_write_event(self)
    }

    fn is_finished(&self) -> bool {
        self.writable().is_finished()
    }

    fn destroy_sink(&mut self, error: Option<StreamError>) {
        self.destroy(error)
    }

    fn is_sink_destroyed(&self) -> bool {
        self.writable().is_destroyed()
    }

    fn sink_errored(&self) -> Option<&StreamError> {
        self.writable().errored()
    }

    fn attach_pipe(&mut self, source: StreamId) -> Result<()> {
        self.duplex_mut().writable.attach_pipe(source)
    }

    fn detach_pipe(&mut self, source: StreamId) {
        self.duplex_mut().writable.detach_pipe(source)
    }
}

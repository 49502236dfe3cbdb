//! Error types for flowstream.
//!
//! Errors fall into three categories (see [`ErrorCategory`]):
//!
//! - **Protocol violations** are programming errors at the call site (push
//!   after EOF, write after end, a completion reported twice). They are
//!   returned synchronously to the offending caller and never swallowed.
//! - **Failures** come from producers, consumers or the underlying I/O and
//!   travel through `destroy(err)` to every linked endpoint.
//! - **Premature close** is reported when a pipe link terminates before the
//!   normal end/finish sequence was observed.
//!
//! [`StreamError`] is `Clone` because a single failure is delivered to
//! several endpoints during pipe teardown.

use std::sync::Arc;

use thiserror::Error;

use crate::stream::StreamId;

/// Calls that break the stream protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// `push` was called after end-of-data was signalled.
    #[error("push() after EOF")]
    PushAfterEof,

    /// `unshift` was called after the end notification was emitted.
    #[error("unshift() after end event")]
    UnshiftAfterEndEvent,

    /// `write` was called after `end`.
    #[error("write after end")]
    WriteAfterEnd,

    /// `end` was called after the stream already finished.
    #[error("end() after finish")]
    AlreadyFinished,

    /// A write completion was reported with no write in flight.
    #[error("callback called multiple times")]
    MultipleCallback,
}

/// Main error type for all stream operations.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// Protocol violation by the caller.
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Operation attempted on (or cancelled by) a destroyed stream.
    #[error("Cannot call {0} after a stream was destroyed")]
    Destroyed(&'static str),

    /// Link terminated before end and finish were both observed.
    #[error("Premature close")]
    PrematureClose,

    /// Chunk payload does not fit the stream mode or encoding.
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    /// Unknown encoding name.
    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),

    /// A sink is already driven by another pipe.
    #[error("Sink is already piped from stream {0}")]
    AlreadyPiped(StreamId),

    /// I/O error from an underlying reader or writer.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Failure reported by a producer, consumer or transform step.
    #[error("{0}")]
    Failed(Arc<str>),

    /// Backpressure did not clear in time.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// The writer task is gone.
    #[error("Channel closed")]
    ChannelClosed,

    /// The pump has neither pending I/O nor demand but is not complete.
    #[error("Pump stalled")]
    Stalled,
}

/// Coarse classification of a [`StreamError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Local programming error at the call site.
    Protocol,
    /// Producer/consumer/I/O failure propagated through destroy.
    Failure,
    /// Stream closed before finishing normally.
    PrematureClose,
}

impl StreamError {
    /// Build a [`StreamError::Failed`] from a message.
    pub fn failed(message: impl Into<String>) -> Self {
        StreamError::Failed(Arc::from(message.into()))
    }

    /// Category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            StreamError::Protocol(_) => ErrorCategory::Protocol,
            StreamError::PrematureClose => ErrorCategory::PrematureClose,
            _ => ErrorCategory::Failure,
        }
    }

    /// The protocol violation, if this is one.
    pub fn violation(&self) -> Option<ProtocolViolation> {
        match self {
            StreamError::Protocol(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether this is a premature close.
    #[inline]
    pub fn is_premature_close(&self) -> bool {
        matches!(self, StreamError::PrematureClose)
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Io(Arc::new(e))
    }
}

/// Result type alias using StreamError.
pub type Result<T> = std::result::Result<T, StreamError>;

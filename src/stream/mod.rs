//! Stream state machines.
//!
//! Every stream is a synchronous state machine driven through `&mut self`
//! calls. Notifications are queued per instance and drained with
//! `next_event()`; user callbacks never run re-entrantly against the
//! instance that invoked them.
//!
//! - `readable` - [`Readable`], the source side
//! - `writable` - [`Writable`], the sink side
//! - `duplex` - [`Duplex`], one of each with linked lifecycles
//! - `transform` - [`Transform`] and [`PassThrough`]
//! - `endpoint` - [`Source`], [`Sink`] and [`Stage`], the object-safe views
//!   the pipe controller drives

mod duplex;
mod endpoint;
mod readable;
mod transform;
mod writable;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use duplex::{Duplex, DuplexEvent};
pub use endpoint::{Sink, Source, Stage};
pub use readable::{FlowMode, IterProducer, Producer, Pusher, Readable, ReadableEvent};
pub use transform::{PassThrough, Transform, TransformStep};
pub use writable::{Completion, Consumer, Dispatch, Writable, WritableEvent, WriteCallback};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

//! # flowstream
//!
//! Flow-controlled streams: readable and writable state machines with
//! high-water-mark backpressure, duplex and transform composites, a pipe
//! controller with ordered teardown, and a tokio layer that drives them
//! over `AsyncRead`/`AsyncWrite`.
//!
//! ## Architecture
//!
//! - **State machines** (`stream`): synchronous, driven through `&mut self`;
//!   notifications are queued per instance and drained with `next_event()`
//! - **Pipes** (`pipe`): move chunks between sources and sinks, pause on
//!   backpressure, forward end-of-data and failures
//! - **Async layer** (`pump`, `writer`, `backpressure`): tokio tasks owning
//!   the state machines, bounded channels and a byte-counting limiter
//!
//! ## Example
//!
//! ```ignore
//! use flowstream::{pump, PumpConfig};
//!
//! #[tokio::main]
//! async fn main() -> flowstream::Result<()> {
//!     let input = tokio::fs::File::open("in.bin").await?;
//!     let output = tokio::fs::File::create("out.bin").await?;
//!     let stats = pump(input, output, PumpConfig::default()).await?;
//!     println!("{} bytes in {} batches", stats.bytes_written, stats.batches);
//!     Ok(())
//! }
//! ```

pub mod chunk;
pub mod config;
pub mod error;
pub mod pipe;
pub mod stream;

mod backpressure;
mod pump;
mod writer;

pub use backpressure::{Backpressure, Reservation, DEFAULT_BACKPRESSURE_TIMEOUT};
pub use chunk::{Chunk, Encoding};
pub use config::{DuplexConfig, Mode, PipeOptions, ReadableConfig, WritableConfig};
pub use error::{ErrorCategory, ProtocolViolation, Result, StreamError};
pub use pipe::{Pipe, Pipeline};
pub use pump::{pump, pump_through, PumpConfig, PumpStats, DEFAULT_READ_BUFFER_SIZE};
pub use stream::{Duplex, PassThrough, Readable, StreamId, Transform, Writable};
pub use writer::{spawn_sink_task, SinkHandle, SinkStats, SinkTaskConfig, DEFAULT_CHANNEL_CAPACITY};

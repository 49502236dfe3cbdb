//! Chunks, text encodings and the size-tracked buffer queue.
//!
//! - `payload` - [`Chunk`] and [`Payload`]
//! - `encoding` - [`Encoding`] and the streaming [`Decoder`]
//! - `buffer_queue` - [`BufferQueue`]

mod buffer_queue;
mod encoding;
mod payload;

pub use buffer_queue::BufferQueue;
pub use encoding::{Decoder, Encoding};
pub use payload::{Chunk, Payload};

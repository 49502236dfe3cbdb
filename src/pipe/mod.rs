//! Pipe controller and pipelines.
//!
//! A [`Pipe`] wires one [`Source`](crate::stream::Source) to one or more
//! [`Sink`](crate::stream::Sink)s. It owns no buffer: it keeps stream ids
//! and borrows the endpoints for the duration of each `drive` call, moving
//! chunks from source notifications into sink writes, pausing the source
//! while any sink asks to drain, forwarding end-of-data and tearing every
//! endpoint down when one of them fails.
//!
//! A [`Pipeline`] chains pipes through transform stages and completes only
//! when every link completed.
//!
//! ```ignore
//! let mut pipeline = Pipeline::new(source, vec![Box::new(upper)], sink)?;
//! while pipeline.drive() {}
//! assert!(pipeline.is_finished());
//! ```

mod link;
mod pipeline;

pub use link::{Pipe, PipeLink, PipeState, DRIVE_BUDGET};
pub use pipeline::{BoxStage, Pipeline, PipelineState};

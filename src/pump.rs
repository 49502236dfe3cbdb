//! Async pump: `AsyncRead` → pipeline → `AsyncWrite`.
//!
//! The pump owns a [`Pipeline`] whose source is a [`Readable`] fed from the
//! reader and whose sink is a manual-mode [`Writable`] flushed to the
//! writer. The reader is only polled while the source asks for data, so a
//! slow writer stalls reading instead of growing buffers.
//!
//! ```ignore
//! let (reader, writer) = (file, socket);
//! let stats = pump(reader, writer, PumpConfig::default()).await?;
//! tracing::info!(bytes = stats.bytes_written, "copied");
//! ```

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chunk::Chunk;
use crate::config::{ReadableConfig, WritableConfig, DEFAULT_HIGH_WATER_MARK};
use crate::error::{Result, StreamError};
use crate::pipe::{BoxStage, Pipeline, PipelineState};
use crate::stream::{Dispatch, Readable, Writable};
use crate::writer::{write_chunks, SinkStats};

/// Default size of a single read from the reader.
pub const DEFAULT_READ_BUFFER_SIZE: usize = DEFAULT_HIGH_WATER_MARK;

/// Configuration of a pump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Source fed from the reader.
    pub readable: ReadableConfig,
    /// Sink flushed to the writer.
    pub writable: WritableConfig,
    /// Upper bound of a single read.
    pub read_buffer_size: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            readable: ReadableConfig::default(),
            writable: WritableConfig::default().writev(true),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Totals reported by a finished pump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub chunks_written: u64,
    /// Number of `write_vectored` batches.
    pub batches: u64,
}

/// Copy `reader` into `writer` with flow control, then shut the writer down.
pub async fn pump<R, W>(reader: R, writer: W, config: PumpConfig) -> Result<PumpStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pump_through(reader, writer, Vec::new(), config).await
}

/// Copy `reader` into `writer` through transform stages.
pub async fn pump_through<R, W>(
    mut reader: R,
    mut writer: W,
    stages: Vec<BoxStage<()>>,
    config: PumpConfig,
) -> Result<PumpStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let read_size = config.read_buffer_size.max(1);
    let source = Readable::new(config.readable);
    let sink = Writable::new(config.writable);
    let mut pipeline = Pipeline::new(source, stages, sink)?;

    let mut bytes_read = 0u64;
    let mut written = SinkStats::default();
    let mut buf = BytesMut::with_capacity(read_size);

    loop {
        while pipeline.drive() {}

        match pipeline.state() {
            PipelineState::Finished => break,
            PipelineState::Failed(e) => return Err(e.clone()),
            PipelineState::Running => {}
        }

        if let Some(dispatch) = pipeline.sink_mut().take_dispatch() {
            let result = match dispatch {
                Dispatch::Write(chunk) => {
                    write_chunks(&mut writer, vec![chunk], &mut written).await
                }
                Dispatch::Writev(chunks) => write_chunks(&mut writer, chunks, &mut written).await,
                Dispatch::Final => writer.shutdown().await.map_err(StreamError::from),
            };
            if let Err(e) = &result {
                tracing::debug!(error = %e, "pump write failed");
            }
            pipeline.sink_mut().complete(result)?;
            continue;
        }

        let source = pipeline.source();
        if source.is_reading() && !source.is_ended() && !source.is_destroyed() {
            buf.reserve(read_size);
            let result = (&mut reader).take(read_size as u64).read_buf(&mut buf).await;
            let source = pipeline.source_mut();
            match result {
                Ok(0) => {
                    tracing::debug!(
                        stream = %source.id(),
                        bytes = bytes_read,
                        "pump reader reached EOF"
                    );
                    source.push(None)?;
                }
                Ok(n) => {
                    bytes_read += n as u64;
                    tracing::trace!(stream = %source.id(), size = n, "pump read");
                    source.push(Some(Chunk::bytes(buf.split().freeze())))?;
                }
                Err(e) => source.destroy(Some(e.into())),
            }
            continue;
        }

        tracing::warn!("pump stalled: no dispatch and the source is not reading");
        pipeline.fail(StreamError::Stalled);
        return Err(StreamError::Stalled);
    }

    Ok(PumpStats {
        bytes_read,
        bytes_written: written.bytes_written,
        chunks_written: written.chunks_written,
        batches: written.batches,
    })
}

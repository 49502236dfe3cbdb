//! Dedicated sink task writing a byte stream to an `AsyncWrite`.
//!
//! The task owns a manual-mode [`Writable`] and receives commands through a
//! bounded mpsc channel. Ready commands are collected into a batch and
//! applied while the stream is corked, so everything written in one batch
//! leaves as a single `writev`.
//!
//! # Architecture
//!
//! ```text
//! Producer 1 ─┐
//! Producer 2 ─┼─► mpsc::Sender<SinkCommand> ─► Sink task (Writable) ─► AsyncWrite
//! Producer N ─┘
//! ```
//!
//! Handles reserve the size of every chunk on a shared [`Backpressure`]
//! before sending it; the task releases it from the write callback.

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backpressure::{Backpressure, DEFAULT_BACKPRESSURE_TIMEOUT};
use crate::chunk::Chunk;
use crate::config::WritableConfig;
use crate::error::{Result, StreamError};
use crate::stream::{Dispatch, Writable};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum commands to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

#[derive(Debug)]
enum SinkCommand {
    Write(Bytes),
    Cork,
    Uncork,
    End,
    Destroy(Option<StreamError>),
}

/// Configuration for the sink task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkTaskConfig {
    /// Writable owned by the task; its high-water mark is the backpressure limit.
    pub writable: WritableConfig,
    /// Channel capacity for the command queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for SinkTaskConfig {
    fn default() -> Self {
        Self {
            writable: WritableConfig::default().writev(true),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Totals reported by a finished sink task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub bytes_written: u64,
    pub chunks_written: u64,
    /// Number of `write_vectored` batches.
    pub batches: u64,
}

/// Handle for sending data to the sink task.
///
/// This is cheaply cloneable and can be shared across producers. Dropping
/// every handle ends the stream.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<SinkCommand>,
    backpressure: Backpressure,
}

impl SinkHandle {
    /// Send a chunk to the sink task.
    ///
    /// Waits while backpressure is active, timing out after the configured
    /// duration.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let reservation = self.backpressure.reserve(data.len()).await?;
        self.tx
            .send(SinkCommand::Write(data))
            .await
            .map_err(|_| StreamError::ChannelClosed)?;
        reservation.disarm();
        Ok(())
    }

    /// Try to send a chunk without waiting for backpressure.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let reservation = self.backpressure.try_reserve(data.len())?;
        self.tx
            .try_send(SinkCommand::Write(data))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => StreamError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => StreamError::ChannelClosed,
            })?;
        reservation.disarm();
        Ok(())
    }

    /// Hold writes until the matching [`uncork`](Self::uncork).
    pub async fn cork(&self) -> Result<()> {
        self.command(SinkCommand::Cork).await
    }

    pub async fn uncork(&self) -> Result<()> {
        self.command(SinkCommand::Uncork).await
    }

    /// End the stream: flush everything, then shut the writer down.
    pub async fn end(&self) -> Result<()> {
        self.command(SinkCommand::End).await
    }

    /// Destroy the stream, discarding queued writes.
    pub async fn destroy(&self, error: Option<StreamError>) -> Result<()> {
        self.command(SinkCommand::Destroy(error)).await
    }

    /// Bytes sent and not yet written.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.backpressure.buffered()
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backpressure.is_active()
    }

    async fn command(&self, command: SinkCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| StreamError::ChannelClosed)
    }
}

/// Spawn the sink task and return a handle for sending data.
///
/// The join handle resolves once the stream finished (after `end`, or after
/// every handle was dropped) or was destroyed.
pub fn spawn_sink_task<W>(
    writer: W,
    config: SinkTaskConfig,
) -> (SinkHandle, JoinHandle<Result<SinkStats>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let backpressure = Backpressure::with_timeout(
        config.writable.effective_high_water_mark(),
        config.backpressure_timeout,
    );
    let stream = Writable::new(config.writable);

    let handle = SinkHandle {
        tx,
        backpressure: backpressure.clone(),
    };
    let task = tokio::spawn(sink_loop(rx, writer, stream, backpressure));
    (handle, task)
}

/// Main sink loop - applies command batches and writes the dispatches.
async fn sink_loop<W>(
    mut rx: mpsc::Receiver<SinkCommand>,
    mut writer: W,
    mut stream: Writable,
    backpressure: Backpressure,
) -> Result<SinkStats>
where
    W: AsyncWrite + Unpin,
{
    let mut stats = SinkStats::default();
    tracing::debug!(stream = %stream.id(), "sink task started");

    loop {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        match rx.recv().await {
            Some(command) => batch.push(command),
            None => {
                tracing::debug!(stream = %stream.id(), "sink channel closed, ending");
                batch.push(SinkCommand::End);
            }
        }

        // Collect additional ready commands (non-blocking)
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(command) => batch.push(command),
                Err(_) => break,
            }
        }

        stream.cork();
        for command in batch {
            apply(&mut stream, &backpressure, command);
        }
        stream.uncork();

        flush_dispatches(&mut writer, &mut stream, &mut stats).await?;
        while let Some(event) = stream.next_event() {
            tracing::trace!(stream = %stream.id(), event = ?event, "sink event");
        }

        if stream.is_destroyed() || stream.is_finished() {
            break;
        }
    }

    if let Some(e) = stream.errored() {
        return Err(e.clone());
    }
    tracing::debug!(
        stream = %stream.id(),
        bytes = stats.bytes_written,
        batches = stats.batches,
        "sink task finished"
    );
    Ok(stats)
}

fn apply(stream: &mut Writable, backpressure: &Backpressure, command: SinkCommand) {
    match command {
        SinkCommand::Write(data) => {
            let len = data.len();
            let bp = backpressure.clone();
            if let Err(e) = stream.write_with(Chunk::bytes(data), move |_| bp.release(len)) {
                tracing::warn!(stream = %stream.id(), error = %e, "sink write refused");
            }
        }
        SinkCommand::Cork => stream.cork(),
        SinkCommand::Uncork => stream.uncork(),
        SinkCommand::End => {
            if let Err(e) = stream.end(None) {
                tracing::warn!(stream = %stream.id(), error = %e, "sink end refused");
            }
        }
        SinkCommand::Destroy(error) => stream.destroy(error),
    }
}

/// Write every dispatch the stream hands out, completing each one.
async fn flush_dispatches<W>(
    writer: &mut W,
    stream: &mut Writable,
    stats: &mut SinkStats,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(dispatch) = stream.take_dispatch() {
        let result = match dispatch {
            Dispatch::Write(chunk) => write_chunks(writer, vec![chunk], stats).await,
            Dispatch::Writev(chunks) => write_chunks(writer, chunks, stats).await,
            Dispatch::Final => writer.shutdown().await.map_err(StreamError::from),
        };
        if let Err(e) = &result {
            tracing::debug!(stream = %stream.id(), error = %e, "sink write failed");
        }
        stream.complete(result)?;
    }
    Ok(())
}

pub(crate) async fn write_chunks<W>(
    writer: &mut W,
    chunks: Vec<Chunk>,
    stats: &mut SinkStats,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let batch: Vec<Bytes> = chunks.into_iter().filter_map(Chunk::into_bytes).collect();
    let written = write_batch(writer, &batch).await?;
    stats.bytes_written += written as u64;
    stats.chunks_written += batch.len() as u64;
    stats.batches += 1;
    Ok(())
}

/// Write a batch of buffers using scatter/gather I/O (write_vectored).
///
/// Partial writes are resumed until everything was written, then the
/// writer is flushed. Returns the number of bytes written.
pub(crate) async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    if total_size == 0 {
        return Ok(0);
    }

    let slices = build_remaining_slices(batch, 0);

    // Fast path: the whole batch in one call
    let written = writer.write_vectored(&slices).await?;
    if written == total_size {
        writer.flush().await?;
        return Ok(total_size);
    }
    if written == 0 {
        return Err(write_zero());
    }

    let mut total_written = written;
    while total_written < total_size {
        let remaining = build_remaining_slices(batch, total_written);
        if remaining.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining).await?;
        if written == 0 {
            return Err(write_zero());
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(total_size)
}

fn write_zero() -> StreamError {
    std::io::Error::new(std::io::ErrorKind::WriteZero, "write_vectored returned 0").into()
}

/// Build IoSlice array for the data after the first `skip_bytes`.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for buf in batch {
        let end = offset + buf.len();
        if !buf.is_empty() && skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&buf[start..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt};

    /// Accepts at most `limit` bytes per call.
    struct Trickle {
        data: Vec<u8>,
        limit: usize,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let n = buf.len().min(self.limit);
            self.data.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_sink_task_config_default() {
        let config = SinkTaskConfig::default();
        assert!(config.writable.writev);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![Bytes::from_static(b"abc"), Bytes::new(), Bytes::from_static(b"hello")];
        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_build_remaining_slices_partial() {
        let batch = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"hello")];

        let slices = build_remaining_slices(&batch, 2);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 1);
        assert_eq!(slices[1].len(), 5);

        let slices = build_remaining_slices(&batch, 4);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"ello");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| Bytes::from_static(b"abc")).collect();

        let written = write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(written, 15);
        assert_eq!(buf.into_inner(), b"abcabcabcabcabc");
    }

    #[tokio::test]
    async fn test_write_batch_resumes_partial_writes() {
        let mut out = Trickle {
            data: Vec::new(),
            limit: 2,
        };
        let batch = vec![Bytes::from_static(b"hello"), Bytes::from_static(b" world")];

        write_batch(&mut out, &batch).await.unwrap();
        assert_eq!(out.data, b"hello world");
    }

    #[tokio::test]
    async fn test_sink_task_writes_and_finishes() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_sink_task(client, SinkTaskConfig::default());

        for i in 0..10u8 {
            handle.write(vec![b'a' + i]).await.unwrap();
        }
        handle.end().await.unwrap();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.bytes_written, 10);
        assert_eq!(stats.chunks_written, 10);
        assert!(stats.batches <= 10);
        assert_eq!(handle.buffered(), 0);

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"abcdefghij");
    }

    #[tokio::test]
    async fn test_corked_writes_leave_as_one_batch() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_sink_task(client, SinkTaskConfig::default());

        handle.cork().await.unwrap();
        handle.write(Bytes::from_static(b"X")).await.unwrap();
        tokio::task::yield_now().await;
        handle.write(Bytes::from_static(b"Y")).await.unwrap();
        handle.uncork().await.unwrap();
        handle.end().await.unwrap();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.batches, 1);

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"XY");
    }

    #[tokio::test]
    async fn test_sink_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_sink_task(client, SinkTaskConfig::default());

        drop(handle);

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats, SinkStats::default());
    }

    #[tokio::test]
    async fn test_destroy_releases_backpressure() {
        let (client, _server) = duplex(1);
        let config = SinkTaskConfig {
            writable: WritableConfig::default().writev(true).high_water_mark(4),
            ..SinkTaskConfig::default()
        };
        let (handle, task) = spawn_sink_task(client, config);

        handle.cork().await.unwrap();
        handle.write(Bytes::from_static(b"abcd")).await.unwrap();
        assert!(handle.try_write(Bytes::from_static(b"e")).is_err());

        handle.destroy(Some(StreamError::failed("shutting down"))).await.unwrap();
        let result = task.await.unwrap();
        assert_eq!(result.unwrap_err().to_string(), "shutting down");
        assert_eq!(handle.buffered(), 0);
        assert!(matches!(
            handle.write(Bytes::from_static(b"late")).await,
            Err(StreamError::ChannelClosed)
        ));
    }
}

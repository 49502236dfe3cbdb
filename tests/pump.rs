//! Async pump and sink task over in-memory pipes.

use std::time::Duration;

use bytes::Bytes;
use flowstream::config::{DuplexConfig, ReadableConfig, WritableConfig};
use flowstream::pipe::BoxStage;
use flowstream::stream::TransformStep;
use flowstream::{
    pump, pump_through, spawn_sink_task, Chunk, PumpConfig, SinkTaskConfig, StreamError, Transform,
};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

/// Passes bytes through and appends a line count at the end.
struct LineCounter {
    lines: usize,
}

impl TransformStep<()> for LineCounter {
    fn transform(&mut self, chunk: Chunk, output: &mut Vec<Chunk>) -> flowstream::Result<()> {
        if let Some(bytes) = chunk.as_bytes() {
            self.lines += bytes.iter().filter(|b| **b == b'\n').count();
        }
        output.push(chunk);
        Ok(())
    }

    fn flush(&mut self, output: &mut Vec<Chunk>) -> flowstream::Result<()> {
        output.push(Chunk::bytes(format!("-- {} lines\n", self.lines)));
        Ok(())
    }
}

fn line_counter() -> BoxStage<()> {
    Box::new(Transform::new(DuplexConfig::default(), LineCounter { lines: 0 }))
}

#[tokio::test]
async fn test_pump_between_pipes() {
    let (mut input_tx, input_rx) = duplex(64);
    let (output_tx, mut output_rx) = duplex(64);

    let producer = tokio::spawn(async move {
        for i in 0..200 {
            input_tx.write_all(format!("line {i}\n").as_bytes()).await.unwrap();
        }
        input_tx.shutdown().await.unwrap();
    });
    let consumer = tokio::spawn(async move {
        let mut received = Vec::new();
        output_rx.read_to_end(&mut received).await.unwrap();
        received
    });

    let config = PumpConfig {
        readable: ReadableConfig::default().high_water_mark(128),
        writable: WritableConfig::default().writev(true).high_water_mark(96),
        read_buffer_size: 50,
    };
    let stats = pump(input_rx, output_tx, config).await.unwrap();
    producer.await.unwrap();
    let received = consumer.await.unwrap();

    let expected: String = (0..200).map(|i| format!("line {i}\n")).collect();
    assert_eq!(received, expected.as_bytes());
    assert_eq!(stats.bytes_read, expected.len() as u64);
    assert_eq!(stats.bytes_written, expected.len() as u64);
}

#[tokio::test]
async fn test_pump_through_flushes_trailer() {
    let mut output = Vec::new();
    let stats = pump_through(
        &b"a\nb\nc\n"[..],
        &mut output,
        vec![line_counter()],
        PumpConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(output, b"a\nb\nc\n-- 3 lines\n");
    assert_eq!(stats.bytes_read, 6);
    assert_eq!(stats.bytes_written, output.len() as u64);
}

#[tokio::test]
async fn test_sink_task_feeds_pump() {
    let (sink_side, pump_side) = duplex(32);
    let (handle, task) = spawn_sink_task(sink_side, SinkTaskConfig::default());

    let writers: Vec<_> = (0..4)
        .map(|n| {
            let handle = handle.clone();
            tokio::spawn(async move {
                for _ in 0..25 {
                    handle.write(Bytes::from(vec![b'0' + n; 4])).await.unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }
    handle.end().await.unwrap();
    drop(handle);

    let mut output = Vec::new();
    let stats = pump(pump_side, &mut output, PumpConfig::default()).await.unwrap();
    let sink_stats = task.await.unwrap().unwrap();

    assert_eq!(sink_stats.bytes_written, 400);
    assert_eq!(stats.bytes_written, 400);
    for n in 0..4u8 {
        assert_eq!(output.iter().filter(|b| **b == b'0' + n).count(), 100);
    }
}

#[tokio::test]
async fn test_sink_handle_times_out_under_backpressure() {
    // Nobody reads the other end, so the pipe fills up and stays full.
    let (sink_side, _stalled) = duplex(8);
    let config = SinkTaskConfig {
        writable: WritableConfig::default().writev(true).high_water_mark(16),
        backpressure_timeout: Duration::from_millis(20),
        ..SinkTaskConfig::default()
    };
    let (handle, _task) = spawn_sink_task(sink_side, config);

    let mut result = Ok(());
    for _ in 0..16 {
        result = handle.write(Bytes::from_static(b"12345678")).await;
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(StreamError::BackpressureTimeout)));
    assert!(handle.is_backpressure_active());
}

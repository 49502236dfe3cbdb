//! Integration tests for flowstream.
//!
//! These tests drive sources, sinks and pipes together through the public API.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use flowstream::config::{DuplexConfig, ReadableConfig, WritableConfig};
use flowstream::pipe::{Pipe, PipeState, Pipeline};
use flowstream::stream::{
    Completion, Consumer, Dispatch, Duplex, DuplexEvent, Readable, ReadableEvent, Sink, Transform,
    Writable, WritableEvent,
};
use flowstream::{Chunk, PipeOptions, ProtocolViolation, StreamError};

/// What a recording consumer observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Write(String),
    Batch(Vec<String>),
    Finish,
}

#[derive(Clone, Default)]
struct Recorder {
    log: Arc<Mutex<Vec<Seen>>>,
    writev: bool,
}

impl Recorder {
    fn batching() -> Self {
        Self {
            writev: true,
            ..Self::default()
        }
    }

    fn seen(&self) -> Vec<Seen> {
        self.log.lock().unwrap().clone()
    }
}

fn text(chunk: &Chunk<String>) -> String {
    match (chunk.as_value(), chunk.as_text(), chunk.as_bytes()) {
        (Some(v), _, _) => v.clone(),
        (_, Some(s), _) => s.to_string(),
        (_, _, Some(b)) => String::from_utf8_lossy(b).into_owned(),
        _ => String::new(),
    }
}

impl Consumer<String> for Recorder {
    fn write(&mut self, chunk: Chunk<String>) -> Completion {
        self.log.lock().unwrap().push(Seen::Write(text(&chunk)));
        Completion::Ready(Ok(()))
    }

    fn supports_writev(&self) -> bool {
        self.writev
    }

    fn writev(&mut self, chunks: Vec<Chunk<String>>) -> Completion {
        let batch = chunks.iter().map(text).collect();
        self.log.lock().unwrap().push(Seen::Batch(batch));
        Completion::Ready(Ok(()))
    }

    fn finish(&mut self) -> Completion {
        self.log.lock().unwrap().push(Seen::Finish);
        Completion::Ready(Ok(()))
    }
}

fn drive<T: Clone>(pipe: &mut Pipe, source: &mut Readable<T>, sink: &mut Writable<T>) {
    for _ in 0..1000 {
        let sinks: &mut [&mut dyn Sink<T>] = &mut [&mut *sink];
        if !pipe.drive(&mut *source, sinks) {
            return;
        }
    }
    panic!("pipe never settled");
}

/// Scenario A: the third push into an object stream with mark 2 asks to stop.
#[test]
fn test_push_crossing_object_mark() {
    let mut source: Readable<i32> = Readable::new(ReadableConfig::objects().high_water_mark(2));
    assert!(source.push(Some(Chunk::value(1))).unwrap());
    assert!(source.push(Some(Chunk::value(2))).unwrap());
    assert!(!source.push(Some(Chunk::value(3))).unwrap());
    assert_eq!(source.buffered_size(), 3);
}

/// Scenario B: a refused write is followed by exactly one drain.
#[test]
fn test_drain_after_refused_write() {
    let mut sink: Writable = Writable::new(WritableConfig::default().high_water_mark(10));
    assert!(sink.write(Chunk::bytes(&b"123456"[..])).unwrap());
    assert!(!sink.write(Chunk::bytes(&b"abcdef"[..])).unwrap());

    assert!(matches!(sink.take_dispatch(), Some(Dispatch::Write(_))));
    sink.complete(Ok(())).unwrap();
    assert!(matches!(sink.take_dispatch(), Some(Dispatch::Write(_))));
    sink.complete(Ok(())).unwrap();

    let drains = std::iter::from_fn(|| sink.next_event())
        .filter(|e| matches!(e, WritableEvent::Drain))
        .count();
    assert_eq!(drains, 1);
    assert_eq!(sink.buffered_size(), 0);
}

/// Piping [A, B, C] then end yields the writes in order and one finish.
#[test]
fn test_pipe_preserves_order_and_finishes_once() {
    let mut source = Readable::from_iter(
        ReadableConfig::objects(),
        ["A", "B", "C"].map(|s| Chunk::value(s.to_string())),
    );
    let recorder = Recorder::default();
    let mut sink = Writable::with_consumer(WritableConfig::objects(), recorder.clone());

    let mut pipe = Pipe::connect(&source, &mut sink, PipeOptions::default()).unwrap();
    drive(&mut pipe, &mut source, &mut sink);

    assert_eq!(
        recorder.seen(),
        vec![
            Seen::Write("A".into()),
            Seen::Write("B".into()),
            Seen::Write("C".into()),
            Seen::Finish,
        ]
    );
    assert!(pipe.is_complete());
    assert!(source.is_end_emitted());
    assert!(source.next_event().is_none());
}

/// Corked writes leave as one batch, or in order without batching support.
#[test]
fn test_cork_batches_in_order() {
    let recorder = Recorder::batching();
    let mut sink = Writable::with_consumer(WritableConfig::objects(), recorder.clone());
    sink.cork();
    sink.write(Chunk::value("X".to_string())).unwrap();
    sink.write(Chunk::value("Y".to_string())).unwrap();
    assert!(recorder.seen().is_empty());
    sink.uncork();
    assert_eq!(recorder.seen(), vec![Seen::Batch(vec!["X".into(), "Y".into()])]);

    let recorder = Recorder::default();
    let mut sink = Writable::with_consumer(WritableConfig::objects(), recorder.clone());
    sink.cork();
    sink.write(Chunk::value("X".to_string())).unwrap();
    sink.write(Chunk::value("Y".to_string())).unwrap();
    sink.uncork();
    assert_eq!(recorder.seen(), vec![Seen::Write("X".into()), Seen::Write("Y".into())]);
}

/// Destroying twice yields one error and one close.
#[test]
fn test_destroy_is_idempotent() {
    let mut source: Readable<i32> = Readable::new(ReadableConfig::objects());
    source.destroy(Some(StreamError::failed("first")));
    source.destroy(Some(StreamError::failed("second")));

    let events: Vec<_> = std::iter::from_fn(|| source.next_event()).collect();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], ReadableEvent::Error(e) if e.to_string() == "first"));
    assert!(matches!(events[1], ReadableEvent::Close));

    let mut sink: Writable<i32> = Writable::new(WritableConfig::objects());
    sink.destroy(None);
    sink.destroy(Some(StreamError::failed("late")));
    let events: Vec<_> = std::iter::from_fn(|| sink.next_event()).collect();
    assert!(matches!(events.as_slice(), [WritableEvent::Close]));
}

/// Scenario C: a sink destroyed mid-stream takes the source down once.
#[test]
fn test_sink_failure_tears_down_source() {
    let mut source: Readable<i32> = Readable::new(ReadableConfig::objects());
    let mut sink: Writable<i32> = Writable::new(WritableConfig::objects());
    let mut pipe = Pipe::connect(&source, &mut sink, PipeOptions::default()).unwrap();

    source.push(Some(Chunk::value(1))).unwrap();
    drive(&mut pipe, &mut source, &mut sink);
    assert!(sink.is_writing());

    sink.destroy(Some(StreamError::failed("sink broke")));
    drive(&mut pipe, &mut source, &mut sink);

    assert_eq!(pipe.state(), PipeState::Errored);
    assert!(source.is_destroyed());

    let events: Vec<_> = std::iter::from_fn(|| source.next_event()).collect();
    let errors: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ReadableEvent::Error(e) => Some(e.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec!["sink broke".to_string()]);
    let closes = events
        .iter()
        .filter(|e| matches!(e, ReadableEvent::Close))
        .count();
    assert_eq!(closes, 1);
    assert!(matches!(events.last(), Some(ReadableEvent::Close)));
}

/// A sink closed without finishing is a premature close.
#[test]
fn test_sink_close_before_finish_is_premature() {
    let mut source: Readable<i32> = Readable::new(ReadableConfig::objects());
    let mut sink: Writable<i32> = Writable::new(WritableConfig::objects());
    let mut pipe = Pipe::connect(&source, &mut sink, PipeOptions::default()).unwrap();
    drive(&mut pipe, &mut source, &mut sink);

    sink.destroy(None);
    drive(&mut pipe, &mut source, &mut sink);

    assert!(pipe.error().unwrap().is_premature_close());
    assert!(source.errored().unwrap().is_premature_close());
}

/// Scenario D: a doubling transform reads back doubled values, bounded.
#[test]
fn test_doubling_transform() {
    let config = DuplexConfig::objects().readable(ReadableConfig::objects().high_water_mark(2));
    let mut double: Transform<i64> = Transform::from_fn(config, |chunk, out| {
        out.extend(chunk.into_value().map(|v| Chunk::value(v * 2)));
        Ok(())
    });

    for v in [1, 2, 3] {
        double.write(Chunk::value(v)).unwrap();
        assert!(double.readable().buffered_size() <= 2);
    }
    double.end(None).unwrap();

    let mut values = Vec::new();
    while let Some(chunk) = double.read(None) {
        values.push(chunk.into_value().unwrap());
        assert!(double.readable().buffered_size() <= 2);
    }
    assert_eq!(values, vec![2, 4, 6]);

    let ended = std::iter::from_fn(|| double.next_event()).any(|e| matches!(e, DuplexEvent::End));
    assert!(ended);
}

/// Protocol violations are returned to the caller.
#[test]
fn test_protocol_violations() {
    let mut source: Readable<i32> = Readable::new(ReadableConfig::objects());
    source.push(None).unwrap();
    let err = source.push(Some(Chunk::value(1))).unwrap_err();
    assert_eq!(err.violation(), Some(ProtocolViolation::PushAfterEof));

    let mut sink: Writable<i32> = Writable::new(WritableConfig::objects());
    sink.end(None).unwrap();
    let err = sink.write(Chunk::value(1)).unwrap_err();
    assert_eq!(err.violation(), Some(ProtocolViolation::WriteAfterEnd));

    let err = sink.complete(Ok(())).unwrap_err();
    assert_eq!(err.violation(), Some(ProtocolViolation::MultipleCallback));
}

/// A closed duplex without half-open ends its writable side with the readable side.
#[test]
fn test_duplex_without_half_open() {
    let mut duplex: Duplex<i32> = Duplex::new(DuplexConfig::objects().allow_half_open(false));
    duplex.push(None).unwrap();
    assert!(duplex.read(None).is_none());

    let events: Vec<_> = std::iter::from_fn(|| duplex.next_event()).collect();
    assert!(events.iter().any(|e| matches!(e, DuplexEvent::End)));
    assert!(duplex.writable().is_ending());
}

/// Binary pipeline through a pass-through stage.
#[test]
fn test_binary_pipeline_with_pass_through() {
    let source = Readable::from_iter(
        ReadableConfig::default(),
        ["hello ", "flow", "stream"].map(|s| Chunk::bytes(Bytes::from_static(s.as_bytes()))),
    );
    let collected = Arc::new(Mutex::new(Vec::new()));
    let log = collected.clone();
    let sink = Writable::from_fn(WritableConfig::default(), move |chunk: Chunk| {
        let bytes = chunk.as_bytes().map(|b| b.as_ref()).unwrap_or_default();
        log.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    });

    let stage: flowstream::pipe::BoxStage<()> =
        Box::new(Transform::pass_through(DuplexConfig::default()));
    let mut pipeline = Pipeline::new(source, vec![stage], sink).unwrap();
    for _ in 0..1000 {
        if !pipeline.drive() {
            break;
        }
    }

    assert!(pipeline.is_finished());
    assert_eq!(collected.lock().unwrap().as_slice(), b"hello flowstream");
}

/// A consumer that fails synchronously tears the pipe down with its own error.
#[test]
fn test_consumer_failure_propagates_through_pipe() {
    let mut source = Readable::from_iter(ReadableConfig::objects(), (1..=3).map(Chunk::value));
    let mut sink = Writable::from_fn(WritableConfig::objects(), |_: Chunk<i32>| {
        Err(StreamError::failed("disk full"))
    });
    let mut pipe = Pipe::connect(&source, &mut sink, PipeOptions::default()).unwrap();
    drive(&mut pipe, &mut source, &mut sink);

    assert_eq!(pipe.state(), PipeState::Errored);
    assert_eq!(pipe.error().unwrap().to_string(), "disk full");
    assert_eq!(source.errored().unwrap().to_string(), "disk full");
    assert!(!source.errored().unwrap().is_premature_close());
}

/// A sink failure observed before a pending end wins; the end is never forwarded.
#[test]
fn test_error_takes_precedence_over_pending_end() {
    let mut source: Readable<i32> = Readable::new(ReadableConfig::objects());
    let mut sink: Writable<i32> = Writable::new(WritableConfig::objects());
    let mut pipe = Pipe::connect(&source, &mut sink, PipeOptions::default()).unwrap();

    source.push(Some(Chunk::value(1))).unwrap();
    drive(&mut pipe, &mut source, &mut sink);
    assert!(matches!(sink.take_dispatch(), Some(Dispatch::Write(_))));

    source.push(None).unwrap();
    sink.destroy(Some(StreamError::failed("sink gone")));
    drive(&mut pipe, &mut source, &mut sink);

    assert_eq!(pipe.state(), PipeState::Errored);
    assert_eq!(pipe.error().unwrap().to_string(), "sink gone");
    assert_eq!(source.errored().unwrap().to_string(), "sink gone");
    assert!(!sink.is_ending());
    assert!(!pipe.drive(&mut source, &mut [&mut sink as &mut dyn Sink<i32>]));
}

/// An ended link whose sink fails before finishing becomes errored.
#[test]
fn test_sink_failure_after_end_is_an_error() {
    let mut source = Readable::from_iter(ReadableConfig::objects(), [Chunk::value(1)]);
    let mut sink: Writable<i32> = Writable::new(WritableConfig::objects());
    let mut pipe = Pipe::connect(&source, &mut sink, PipeOptions::default()).unwrap();
    drive(&mut pipe, &mut source, &mut sink);
    assert_eq!(pipe.state(), PipeState::Ended);
    assert!(sink.is_ending());

    sink.destroy(Some(StreamError::failed("flush failed")));
    drive(&mut pipe, &mut source, &mut sink);

    assert_eq!(pipe.state(), PipeState::Errored);
    assert_eq!(pipe.error().unwrap().to_string(), "flush failed");
    assert!(!pipe.is_complete());
}

/// Corked input leaving as one batch still stops at the output mark.
#[test]
fn test_transform_bounded_under_corked_batch() {
    let config = DuplexConfig::objects()
        .readable(ReadableConfig::objects().high_water_mark(2))
        .writable(WritableConfig::objects().writev(true));
    let mut double: Transform<i64> = Transform::from_fn(config, |chunk, out| {
        out.extend(chunk.into_value().map(|v| Chunk::value(v * 2)));
        Ok(())
    });

    double.cork();
    double.cork();
    for v in 1..=6 {
        double.write(Chunk::value(v)).unwrap();
    }
    double.uncork();
    assert_eq!(double.readable().buffered_size(), 0);
    double.uncork();
    assert_eq!(double.readable().buffered_size(), 2);
    double.end(None).unwrap();

    let mut values = Vec::new();
    while let Some(chunk) = double.read(None) {
        assert!(double.readable().buffered_size() <= 2);
        values.push(chunk.into_value().unwrap());
    }
    assert_eq!(values, vec![2, 4, 6, 8, 10, 12]);
    assert!(double.readable().is_ended());
}

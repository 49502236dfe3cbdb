//! Pipe links.

use crate::chunk::Chunk;
use crate::config::PipeOptions;
use crate::error::{Result, StreamError};
use crate::stream::{ReadableEvent, Sink, Source, StreamId, WritableEvent};

/// Maximum number of source events handled by one [`Pipe::drive`] call.
pub const DRIVE_BUDGET: usize = 256;

/// Lifecycle of a pipe link (and, summarized, of a whole pipe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    /// Connected, not driven yet.
    Idle,
    /// Moving data.
    Running,
    /// The source ended; the sink is finishing.
    Ended,
    /// Torn down after a failure.
    Errored,
    /// Removed with `unpipe` or by the sink finishing on its own.
    Unpiped,
}

/// One source→sink connection.
#[derive(Debug, Clone)]
pub struct PipeLink {
    source_id: StreamId,
    sink_id: StreamId,
    ends_sink_on_source_end: bool,
    state: PipeState,
    awaiting_drain: bool,
    finished: bool,
}

impl PipeLink {
    fn new(source_id: StreamId, sink_id: StreamId, options: PipeOptions) -> Self {
        Self {
            source_id,
            sink_id,
            ends_sink_on_source_end: options.ends_sink_on_source_end,
            state: PipeState::Idle,
            awaiting_drain: false,
            finished: false,
        }
    }

    #[inline]
    pub fn source_id(&self) -> StreamId {
        self.source_id
    }

    #[inline]
    pub fn sink_id(&self) -> StreamId {
        self.sink_id
    }

    #[inline]
    pub fn ends_sink_on_source_end(&self) -> bool {
        self.ends_sink_on_source_end
    }

    #[inline]
    pub fn state(&self) -> PipeState {
        self.state
    }

    /// Whether the sink refused the last write and has not drained yet.
    #[inline]
    pub fn is_awaiting_drain(&self) -> bool {
        self.awaiting_drain
    }

    /// Whether the sink reported `Finish`.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn is_done(&self) -> bool {
        self.state == PipeState::Ended && (self.finished || !self.ends_sink_on_source_end)
    }

    fn is_observing(&self) -> bool {
        match self.state {
            PipeState::Running => true,
            PipeState::Ended => self.ends_sink_on_source_end && !self.finished,
            _ => false,
        }
    }
}

/// Pipe controller: one source, one or more sinks.
#[derive(Debug)]
pub struct Pipe {
    source_id: StreamId,
    links: Vec<PipeLink>,
    started: bool,
    source_ended: bool,
    paused: bool,
    error: Option<StreamError>,
}

impl Pipe {
    /// Connect `source` to `sink`.
    ///
    /// Fails with [`StreamError::AlreadyPiped`] when another source already
    /// drives the sink. Nothing moves until the first [`drive`](Self::drive).
    pub fn connect<T, S, K>(source: &S, sink: &mut K, options: PipeOptions) -> Result<Self>
    where
        S: Source<T> + ?Sized,
        K: Sink<T> + ?Sized,
    {
        let source_id = source.source_id();
        sink.attach_pipe(source_id)?;
        tracing::debug!(source = %source_id, sink = %sink.sink_id(), "pipe connected");
        Ok(Self {
            source_id,
            links: vec![PipeLink::new(source_id, sink.sink_id(), options)],
            started: false,
            source_ended: false,
            paused: false,
            error: None,
        })
    }

    /// Add another sink to the same source (fan-out).
    pub fn add_sink<T, K>(&mut self, sink: &mut K, options: PipeOptions) -> Result<()>
    where
        K: Sink<T> + ?Sized,
    {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        sink.attach_pipe(self.source_id)?;
        let mut link = PipeLink::new(self.source_id, sink.sink_id(), options);
        if self.started {
            link.state = PipeState::Running;
        }
        if self.source_ended {
            link.state = PipeState::Ended;
            if link.ends_sink_on_source_end {
                sink.end()?;
            }
        }
        tracing::debug!(source = %self.source_id, sink = %link.sink_id, "pipe sink added");
        self.links.push(link);
        Ok(())
    }

    #[inline]
    pub fn source_id(&self) -> StreamId {
        self.source_id
    }

    #[inline]
    pub fn links(&self) -> &[PipeLink] {
        &self.links
    }

    /// Failure that tore the pipe down.
    #[inline]
    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    /// Summarized state of the pipe.
    pub fn state(&self) -> PipeState {
        if self.error.is_some() {
            PipeState::Errored
        } else if self.all_unpiped() {
            PipeState::Unpiped
        } else if !self.started {
            PipeState::Idle
        } else if self.source_ended {
            PipeState::Ended
        } else {
            PipeState::Running
        }
    }

    /// Whether the source ended and every remaining sink finished.
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
            && self.source_ended
            && !self.all_unpiped()
            && self
                .links
                .iter()
                .all(|l| l.state == PipeState::Unpiped || l.is_done())
    }

    /// Move data and notifications between the endpoints.
    ///
    /// `sinks` must hold every sink linked to this pipe; sinks are matched
    /// by id. Sink notifications are handled before source notifications.
    /// Returns whether anything happened; at most [`DRIVE_BUDGET`] chunks
    /// move per call.
    pub fn drive<T: Clone>(
        &mut self,
        source: &mut dyn Source<T>,
        sinks: &mut [&mut dyn Sink<T>],
    ) -> bool {
        if self.error.is_some() || self.all_unpiped() {
            return false;
        }

        let mut progress = false;
        if !self.started {
            self.started = true;
            for link in self.links.iter_mut().filter(|l| l.state == PipeState::Idle) {
                link.state = PipeState::Running;
            }
            tracing::debug!(source = %self.source_id, links = self.links.len(), "pipe started");
            source.resume();
            progress = true;
        }

        let mut budget = DRIVE_BUDGET;
        loop {
            let mut moved = match self.poll_sinks(sinks) {
                Ok(moved) => moved,
                Err(e) => {
                    self.teardown(source, sinks, e);
                    return true;
                }
            };

            if self.all_unpiped() {
                self.paused = true;
                source.pause();
                return true;
            }

            match self.poll_source(source, sinks, &mut budget) {
                Ok(p) => moved |= p,
                Err(e) => {
                    self.teardown(source, sinks, e);
                    return true;
                }
            }

            if self.paused && !self.source_ended && !self.awaiting_drain() {
                tracing::trace!(source = %self.source_id, "pipe resumed after drain");
                self.paused = false;
                source.resume();
                moved = true;
            }

            progress |= moved;
            if !moved || budget == 0 {
                return progress;
            }
        }
    }

    /// Remove the link to `sink` without destroying anything.
    ///
    /// Once no link remains the source is paused. Returns whether a link
    /// was removed.
    pub fn unpipe<T, S, K>(&mut self, source: &mut S, sink: &mut K) -> bool
    where
        S: Source<T> + ?Sized,
        K: Sink<T> + ?Sized,
    {
        let sink_id = sink.sink_id();
        let Some(link) = self
            .links
            .iter_mut()
            .find(|l| l.sink_id == sink_id && l.state != PipeState::Unpiped)
        else {
            return false;
        };
        link.state = PipeState::Unpiped;
        link.awaiting_drain = false;
        sink.detach_pipe(self.source_id);
        tracing::debug!(source = %self.source_id, sink = %sink_id, "pipe unpiped");

        if self.all_unpiped() {
            self.paused = true;
            source.pause();
        }
        true
    }

    /// Destroy every endpoint with `error`. Idempotent.
    ///
    /// Sinks that already finished are left alone.
    pub fn teardown<T>(
        &mut self,
        source: &mut dyn Source<T>,
        sinks: &mut [&mut dyn Sink<T>],
        error: StreamError,
    ) {
        if self.error.is_some() {
            return;
        }
        tracing::debug!(source = %self.source_id, error = %error, "pipe teardown");
        source.destroy_source(Some(error.clone()));
        for link in self.links.iter_mut() {
            if link.state == PipeState::Unpiped || link.finished {
                continue;
            }
            link.state = PipeState::Errored;
            if let Some(sink) = find_sink(sinks, link.sink_id) {
                sink.destroy_sink(Some(error.clone()));
            }
        }
        self.error = Some(error);
    }

    /// Record a failure handled elsewhere (every endpoint already destroyed).
    pub fn mark_errored(&mut self, error: StreamError) {
        if self.error.is_some() {
            return;
        }
        for link in self.links.iter_mut() {
            if link.state != PipeState::Unpiped && !link.finished {
                link.state = PipeState::Errored;
            }
        }
        self.error = Some(error);
    }

    fn all_unpiped(&self) -> bool {
        self.links.iter().all(|l| l.state == PipeState::Unpiped)
    }

    fn awaiting_drain(&self) -> bool {
        self.links
            .iter()
            .any(|l| l.state == PipeState::Running && l.awaiting_drain)
    }

    fn poll_sinks<T>(&mut self, sinks: &mut [&mut dyn Sink<T>]) -> Result<bool> {
        let mut progress = false;
        for link in self.links.iter_mut().filter(|l| l.is_observing()) {
            let Some(sink) = find_sink(sinks, link.sink_id) else {
                continue;
            };
            while let Some(event) = sink.next_write_event() {
                progress = true;
                match event {
                    WritableEvent::Drain => link.awaiting_drain = false,
                    WritableEvent::Finish => {
                        link.finished = true;
                        link.awaiting_drain = false;
                        if link.state == PipeState::Running {
                            tracing::debug!(
                                source = %link.source_id,
                                sink = %link.sink_id,
                                "sink finished before source end"
                            );
                            link.state = PipeState::Unpiped;
                            sink.detach_pipe(link.source_id);
                        }
                        break;
                    }
                    WritableEvent::Error(e) => return Err(e),
                    WritableEvent::Close => {
                        if !link.finished {
                            return Err(StreamError::PrematureClose);
                        }
                    }
                }
            }
        }
        Ok(progress)
    }

    fn poll_source<T: Clone>(
        &mut self,
        source: &mut dyn Source<T>,
        sinks: &mut [&mut dyn Sink<T>],
        budget: &mut usize,
    ) -> Result<bool> {
        let mut progress = false;
        while *budget > 0 {
            let Some(event) = source.next_read_event() else {
                break;
            };
            progress = true;
            match event {
                ReadableEvent::Data(chunk) => {
                    *budget -= 1;
                    self.deliver(chunk, sinks)?;
                    if self.awaiting_drain() {
                        if !self.paused {
                            tracing::trace!(source = %self.source_id, "pipe paused for drain");
                            self.paused = true;
                            source.pause();
                        }
                        break;
                    }
                }
                ReadableEvent::End => self.end_sinks(sinks)?,
                ReadableEvent::Error(e) => return Err(e),
                ReadableEvent::Close => {
                    if !self.source_ended {
                        return Err(StreamError::PrematureClose);
                    }
                }
                ReadableEvent::Readable | ReadableEvent::Pause | ReadableEvent::Resume => {}
            }
        }
        Ok(progress)
    }

    fn deliver<T: Clone>(&mut self, chunk: Chunk<T>, sinks: &mut [&mut dyn Sink<T>]) -> Result<()> {
        let targets: Vec<usize> = self
            .links
            .iter()
            .enumerate()
            .filter(|(_, l)| l.state == PipeState::Running)
            .map(|(i, _)| i)
            .collect();
        let Some((&last, rest)) = targets.split_last() else {
            tracing::warn!(source = %self.source_id, "chunk dropped, no running link");
            return Ok(());
        };
        for &index in rest {
            self.write_to(index, chunk.clone(), sinks)?;
        }
        self.write_to(last, chunk, sinks)
    }

    fn write_to<T>(
        &mut self,
        index: usize,
        chunk: Chunk<T>,
        sinks: &mut [&mut dyn Sink<T>],
    ) -> Result<()> {
        let link = &mut self.links[index];
        let Some(sink) = find_sink(sinks, link.sink_id) else {
            tracing::warn!(
                source = %link.source_id,
                sink = %link.sink_id,
                "linked sink missing from drive call"
            );
            return Ok(());
        };
        tracing::trace!(
            source = %link.source_id,
            sink = %link.sink_id,
            size = chunk.byte_len(),
            "pipe write"
        );
        let accepted = match sink.write(chunk) {
            Ok(accepted) => accepted,
            Err(e) => return Err(sink_failure(&*sink).unwrap_or(e)),
        };
        // A consumer that failed synchronously already destroyed the sink.
        if let Some(e) = sink_failure(&*sink) {
            return Err(e);
        }
        if !accepted {
            link.awaiting_drain = true;
        }
        Ok(())
    }

    fn end_sinks<T>(&mut self, sinks: &mut [&mut dyn Sink<T>]) -> Result<()> {
        tracing::debug!(source = %self.source_id, "pipe source ended");
        self.source_ended = true;
        self.paused = false;
        for link in self.links.iter_mut().filter(|l| l.state == PipeState::Running) {
            link.state = PipeState::Ended;
            link.awaiting_drain = false;
            if !link.ends_sink_on_source_end {
                continue;
            }
            if let Some(sink) = find_sink(sinks, link.sink_id) {
                sink.end()?;
            }
        }
        Ok(())
    }
}

/// The error a sink was destroyed with, or a premature close when it was
/// destroyed without one before finishing.
fn sink_failure<T, K: Sink<T> + ?Sized>(sink: &K) -> Option<StreamError> {
    if let Some(e) = sink.sink_errored() {
        return Some(e.clone());
    }
    (sink.is_sink_destroyed() && !sink.is_finished()).then_some(StreamError::PrematureClose)
}

fn find_sink<'a, 'b, T>(
    sinks: &'a mut [&'b mut dyn Sink<T>],
    id: StreamId,
) -> Option<&'a mut (dyn Sink<T> + 'b)> {
    sinks
        .iter_mut()
        .find(|s| s.sink_id() == id)
        .map(|s| &mut **s)
}

//! Pipelines: source → stages → sink.

use crate::config::PipeOptions;
use crate::error::{Result, StreamError};
use crate::pipe::link::Pipe;
use crate::stream::{Sink, Source, Stage};

/// Boxed middle stage of a pipeline.
pub type BoxStage<T> = Box<dyn Stage<T> + Send>;

/// Overall pipeline state.
#[derive(Debug, Clone)]
pub enum PipelineState {
    /// Some link still moves data.
    Running,
    /// Every link completed.
    Finished,
    /// A link failed; every endpoint was destroyed with the error.
    Failed(StreamError),
}

/// A chain of pipe links with conjunctive completion.
pub struct Pipeline<T, S, K> {
    source: S,
    stages: Vec<BoxStage<T>>,
    sink: K,
    pipes: Vec<Pipe>,
    state: PipelineState,
}

impl<T, S, K> Pipeline<T, S, K>
where
    T: Clone,
    S: Source<T>,
    K: Sink<T>,
{
    /// Connect `source` through every stage into `sink`.
    pub fn new(mut source: S, mut stages: Vec<BoxStage<T>>, mut sink: K) -> Result<Self> {
        let mut pipes = Vec::with_capacity(stages.len() + 1);
        for index in 0..=stages.len() {
            let (from, to) = endpoints(&mut source, &mut stages, &mut sink, index);
            pipes.push(Pipe::connect(&*from, to, PipeOptions::default())?);
        }
        tracing::debug!(links = pipes.len(), "pipeline connected");
        Ok(Self {
            source,
            stages,
            sink,
            pipes,
            state: PipelineState::Running,
        })
    }

    /// Drive every link once, source side first.
    ///
    /// Returns whether anything moved. Callers loop until it returns `false`
    /// and then wait for outside input (a producer push or a sink completion).
    pub fn drive(&mut self) -> bool {
        if !matches!(self.state, PipelineState::Running) {
            return false;
        }

        let mut progress = false;
        for index in 0..self.pipes.len() {
            let (from, to) = endpoints(&mut self.source, &mut self.stages, &mut self.sink, index);
            let pipe = &mut self.pipes[index];
            progress |= pipe.drive(from, &mut [to]);
            if let Some(error) = pipe.error().cloned() {
                self.fail(error);
                return true;
            }
        }

        if self.pipes.iter().all(Pipe::is_complete) {
            tracing::debug!(links = self.pipes.len(), "pipeline finished");
            self.state = PipelineState::Finished;
            return true;
        }
        progress
    }

    /// Destroy every endpoint with `error` and mark every link errored.
    /// Idempotent.
    pub fn fail(&mut self, error: StreamError) {
        if !matches!(self.state, PipelineState::Running) {
            return;
        }
        tracing::debug!(error = %error, "pipeline failed");
        self.source.destroy_source(Some(error.clone()));
        for stage in self.stages.iter_mut() {
            stage.destroy_source(Some(error.clone()));
        }
        self.sink.destroy_sink(Some(error.clone()));
        for pipe in self.pipes.iter_mut() {
            pipe.mark_errored(error.clone());
        }
        self.state = PipelineState::Failed(error);
    }

    #[inline]
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, PipelineState::Finished)
    }

    /// Failure, once the pipeline failed.
    pub fn error(&self) -> Option<&StreamError> {
        match &self.state {
            PipelineState::Failed(e) => Some(e),
            _ => None,
        }
    }

    #[inline]
    pub fn pipes(&self) -> &[Pipe] {
        &self.pipes
    }

    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    #[inline]
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    #[inline]
    pub fn sink(&self) -> &K {
        &self.sink
    }

    #[inline]
    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    /// Take the endpoints back.
    pub fn into_parts(self) -> (S, Vec<BoxStage<T>>, K) {
        (self.source, self.stages, self.sink)
    }
}

impl<T, S, K> std::fmt::Debug for Pipeline<T, S, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .field("pipes", &self.pipes)
            .field("state", &self.state)
            .finish()
    }
}

/// Borrow the two endpoints of link `index`.
fn endpoints<'a, T, S, K>(
    source: &'a mut S,
    stages: &'a mut [BoxStage<T>],
    sink: &'a mut K,
    index: usize,
) -> (&'a mut dyn Source<T>, &'a mut dyn Sink<T>)
where
    S: Source<T>,
    K: Sink<T>,
{
    let count = stages.len();
    if count == 0 {
        return (source, sink);
    }
    if index == 0 {
        return (source, stages[0].as_sink());
    }
    if index == count {
        return (stages[count - 1].as_source(), sink);
    }
    let (left, right) = stages.split_at_mut(index);
    (left[index - 1].as_source(), right[0].as_sink())
}

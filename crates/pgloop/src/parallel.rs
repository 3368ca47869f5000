//! Parallel fan-out across pooled connections.
//!
//! A [`ParallelContext`] holds a fixed number of pipelines ("streams"),
//! each of which runs on its own connection. Streams share one arena. Once
//! every stream that had work has finished, a single completion callback
//! fires with every stream's outcome.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use pgloop_pool::Pool;
use tokio::sync::oneshot;

use crate::arena::{self, Arena};
use crate::error::Error;
use crate::instrumentation::span_names;
use crate::pipeline::{ArenaScope, Outcome, Pipeline};

/// Callback invoked once when every active stream has finished.
pub type ParallelCallback = Box<dyn FnOnce(&ParallelOutcome) + Send>;

/// Per-stream results of a parallel run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelOutcome {
    /// One entry per stream; `None` for streams that had nothing queued.
    pub streams: Vec<Option<Outcome>>,
}

impl ParallelOutcome {
    fn aborted(count: usize, active: &[usize]) -> Self {
        let mut streams = vec![None; count];
        for &i in active {
            if let Some(slot) = streams.get_mut(i) {
                *slot = Some(Outcome::Aborted);
            }
        }
        Self { streams }
    }

    /// Whether every active stream completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.streams
            .iter()
            .flatten()
            .all(Outcome::is_success)
    }

    /// The first stream that did not complete, with its outcome.
    #[must_use]
    pub fn first_failure(&self) -> Option<(usize, &Outcome)> {
        self.streams
            .iter()
            .enumerate()
            .find_map(|(i, o)| o.as_ref().filter(|o| !o.is_success()).map(|o| (i, o)))
    }

    /// Number of streams that ran.
    #[must_use]
    pub fn active(&self) -> usize {
        self.streams.iter().flatten().count()
    }
}

/// Link from a stream's pipeline back to its context's barrier.
pub(crate) struct StreamLink {
    fan_in: Arc<FanIn>,
    index: usize,
}

impl StreamLink {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn arrive(self, outcome: Outcome) {
        self.fan_in.arrive(self.index, outcome);
    }
}

struct FanIn {
    state: Mutex<FanInState>,
}

struct FanInState {
    started: usize,
    completed: usize,
    outcomes: Vec<Option<Outcome>>,
    callback: Option<ParallelCallback>,
    arena: Option<ArenaScope>,
    done: Option<oneshot::Sender<ParallelOutcome>>,
}

impl FanIn {
    fn arrive(&self, index: usize, outcome: Outcome) {
        let finished = {
            let mut state = self.state.lock();
            if let Some(slot) = state.outcomes.get_mut(index) {
                *slot = Some(outcome);
            }
            state.completed += 1;
            tracing::debug!(
                stream = index,
                completed = state.completed,
                started = state.started,
                "parallel stream finished"
            );
            (state.completed == state.started).then(|| state.take())
        };
        if let Some(finished) = finished {
            finished.fire();
        }
    }
}

impl FanInState {
    fn take(&mut self) -> Finished {
        Finished {
            outcome: ParallelOutcome {
                streams: std::mem::take(&mut self.outcomes),
            },
            callback: self.callback.take(),
            arena: self.arena.take(),
            done: self.done.take(),
        }
    }
}

/// Everything released when the last stream arrives, handled outside the
/// barrier's lock.
struct Finished {
    outcome: ParallelOutcome,
    callback: Option<ParallelCallback>,
    arena: Option<ArenaScope>,
    done: Option<oneshot::Sender<ParallelOutcome>>,
}

impl Finished {
    fn fire(self) {
        if let Some(callback) = self.callback {
            callback(&self.outcome);
        }
        drop(self.arena);
        if let Some(done) = self.done {
            let _ = done.send(self.outcome);
        }
    }
}

/// A fixed set of pipelines executed concurrently.
///
/// # Example
///
/// ```rust,ignore
/// use pgloop::ParallelContext;
///
/// let mut ctx = ParallelContext::new(&pool, 2)?;
/// ctx.stream(0)?.queue("SELECT count(*) FROM users")?;
/// ctx.stream(1)?.queue("SELECT count(*) FROM posts")?;
/// ctx.on_complete(|outcome| assert!(outcome.is_success()));
///
/// let outcome = ctx.exec()?.outcome().await;
/// ```
pub struct ParallelContext {
    pool: Pool,
    arena: ArenaScope,
    streams: Vec<Option<Pipeline>>,
    on_complete: Option<ParallelCallback>,
}

impl ParallelContext {
    /// Create a context with `count` streams sharing an arena borrowed from
    /// the global arena pool.
    pub fn new(pool: &Pool, count: usize) -> Result<Self, Error> {
        Self::build(pool, count, ArenaScope::Owned(arena::borrow()))
    }

    /// Create a context whose streams store their text in `arena`.
    pub fn with_arena(pool: &Pool, count: usize, arena: Arena) -> Result<Self, Error> {
        Self::build(pool, count, ArenaScope::Shared(arena))
    }

    fn build(pool: &Pool, count: usize, arena: ArenaScope) -> Result<Self, Error> {
        if count == 0 {
            return Err(Error::NoStreams);
        }
        let mut streams = Vec::with_capacity(count);
        streams.resize_with(count, || None);
        Ok(Self {
            pool: pool.clone(),
            arena,
            streams,
            on_complete: None,
        })
    }

    /// The pipeline for stream `index`, created on first use.
    pub fn stream(&mut self, index: usize) -> Result<&mut Pipeline, Error> {
        let count = self.streams.len();
        let slot = self
            .streams
            .get_mut(index)
            .ok_or(Error::StreamIndex { index, count })?;
        Ok(slot.get_or_insert_with(|| {
            Pipeline::with_arena(&self.pool, self.arena.arena().clone())
        }))
    }

    /// Register the completion callback, replacing any previous one.
    pub fn on_complete<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce(&ParallelOutcome) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Number of streams.
    #[must_use]
    pub fn count(&self) -> usize {
        self.streams.len()
    }

    /// Number of streams with queued statements.
    #[must_use]
    pub fn active(&self) -> usize {
        self.streams
            .iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .count()
    }

    /// Execute every stream with queued statements.
    ///
    /// Streams with nothing queued are skipped. If no stream has work the
    /// completion callback fires immediately. Outside a Tokio runtime every
    /// active stream fails with [`Error::NoRuntime`], the callback still
    /// fires once and the error is returned.
    pub fn exec(self) -> Result<ParallelHandle, Error> {
        let Self {
            pool: _,
            arena,
            streams,
            on_complete,
        } = self;
        let count = streams.len();

        let active: Vec<(usize, Pipeline)> = streams
            .into_iter()
            .enumerate()
            .filter_map(|(i, p)| p.filter(|p| !p.is_empty()).map(|p| (i, p)))
            .collect();
        let indices: Vec<usize> = active.iter().map(|(i, _)| *i).collect();

        let (done, rx) = oneshot::channel();
        let handle = ParallelHandle {
            rx,
            count,
            active: indices,
        };

        let fan_in = Arc::new(FanIn {
            state: Mutex::new(FanInState {
                started: active.len(),
                completed: 0,
                outcomes: vec![None; count],
                callback: on_complete,
                arena: Some(arena),
                done: Some(done),
            }),
        });

        if active.is_empty() {
            tracing::debug!(streams = count, "parallel context has no work");
            let finished = fan_in.state.lock().take();
            finished.fire();
            return Ok(handle);
        }

        let span = tracing::debug_span!(span_names::PARALLEL, streams = count, active = active.len());
        let _entered = span.enter();

        let mut result = Ok(handle);
        for (index, mut pipeline) in active {
            pipeline.stream = Some(StreamLink {
                fan_in: Arc::clone(&fan_in),
                index,
            });
            if let Err(e) = pipeline.execute() {
                result = Err(e);
            }
        }
        result
    }
}

impl fmt::Debug for ParallelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelContext")
            .field("streams", &self.streams)
            .field("arena_bytes", &self.arena.arena().used_bytes())
            .finish_non_exhaustive()
    }
}

/// Awaitable result of [`ParallelContext::exec`].
#[derive(Debug)]
pub struct ParallelHandle {
    rx: oneshot::Receiver<ParallelOutcome>,
    count: usize,
    active: Vec<usize>,
}

impl ParallelHandle {
    /// Wait for every active stream to finish.
    ///
    /// Active streams are reported as [`Outcome::Aborted`] if the barrier was
    /// dropped before they all arrived.
    pub async fn outcome(self) -> ParallelOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => ParallelOutcome::aborted(self.count, &self.active),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pgloop_testing::MockDriver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(size: usize) -> Pool {
        Pool::builder()
            .driver(MockDriver::new())
            .size(size)
            .build()
            .unwrap()
    }

    #[test]
    fn test_zero_streams_rejected() {
        assert!(matches!(
            ParallelContext::new(&pool(1), 0),
            Err(Error::NoStreams)
        ));
    }

    #[test]
    fn test_stream_index_out_of_range() {
        let mut ctx = ParallelContext::new(&pool(1), 2).unwrap();
        assert!(ctx.stream(1).is_ok());
        assert!(matches!(
            ctx.stream(2),
            Err(Error::StreamIndex { index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_no_work_completes_immediately() {
        let mut ctx = ParallelContext::new(&pool(1), 3).unwrap();
        ctx.stream(0).unwrap();
        assert_eq!(ctx.active(), 0);

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        ctx.on_complete(move |outcome| {
            assert_eq!(outcome.active(), 0);
            assert!(outcome.is_success());
            f.fetch_add(1, Ordering::SeqCst);
        });
        ctx.exec().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_runtime_fires_once() {
        let mut ctx = ParallelContext::new(&pool(2), 2).unwrap();
        ctx.stream(0).unwrap().queue("SELECT 1").unwrap();
        ctx.stream(1).unwrap().queue("SELECT 2").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        ctx.on_complete(move |outcome| {
            assert_eq!(outcome.active(), 2);
            assert_eq!(
                outcome.first_failure(),
                Some((0, &Outcome::Failed(Error::NoRuntime)))
            );
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(ctx.exec().unwrap_err(), Error::NoRuntime);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_outcome_helpers() {
        let outcome = ParallelOutcome {
            streams: vec![
                Some(Outcome::Completed),
                None,
                Some(Outcome::Aborted),
            ],
        };
        assert!(!outcome.is_success());
        assert_eq!(outcome.active(), 2);
        assert_eq!(outcome.first_failure(), Some((2, &Outcome::Aborted)));

        let aborted = ParallelOutcome::aborted(3, &[0, 2]);
        assert_eq!(
            aborted.streams,
            vec![Some(Outcome::Aborted), None, Some(Outcome::Aborted)]
        );
    }
}

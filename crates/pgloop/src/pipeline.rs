//! Query pipelines.
//!
//! A [`Pipeline`] is an ordered batch of statements executed one after the
//! other on a single connection. Statements are copied into the pipeline's
//! arena when queued. Execution runs as a Tokio task that sends one
//! statement, waits for socket readiness, drains its results and moves on.
//!
//! The first failing statement ends the run; later statements are never
//! sent. Whatever happens, the completion callback fires exactly once,
//! before the connection goes back to the pool and the arena is released.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use pgloop_driver::{FlushStatus, QueryResult};
use pgloop_pool::{Pool, PooledConnection};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::arena::{self, Arena, ArenaStr, PooledArena};
use crate::error::Error;
use crate::instrumentation::{DB_SYSTEM, SanitizationConfig, extract_operation, span_names};
use crate::parallel::StreamLink;
use crate::readiness::Readiness;
use crate::transaction::{Begin, ROLLBACK};

/// How long a best-effort `ROLLBACK` may take before the connection is
/// discarded instead.
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked with each result of a statement.
pub type ResultCallback = Box<dyn FnMut(&QueryResult) + Send>;

/// Callback invoked once when a pipeline finishes.
pub type CompletionCallback = Box<dyn FnOnce(&Outcome) + Send>;

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every statement succeeded.
    Completed,
    /// A statement or the connection failed; later statements were skipped.
    Failed(Error),
    /// The runtime shut down before the queue was exhausted.
    Aborted,
}

impl Outcome {
    /// Whether every statement succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// The failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatementKind {
    User,
    Begin,
    Commit,
}

struct Statement {
    sql: ArenaStr,
    params: Vec<Option<ArenaStr>>,
    on_result: Option<ResultCallback>,
    kind: StatementKind,
}

enum Source {
    Bound(PooledConnection),
    Pool(Pool),
}

/// Where a pipeline's text lives.
pub(crate) enum ArenaScope {
    /// Borrowed for this pipeline alone and recycled at teardown.
    Owned(PooledArena),
    /// Supplied by the caller or shared with sibling streams.
    Shared(Arena),
}

impl ArenaScope {
    pub(crate) fn arena(&self) -> &Arena {
        match self {
            Self::Owned(arena) => arena,
            Self::Shared(arena) => arena,
        }
    }
}

/// What to do with the connection at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Return,
    Discard,
}

enum Step {
    Done,
    Failed { error: Error, release: Release },
    Aborted { in_flight: bool },
}

/// An ordered batch of statements run on one connection.
///
/// # Example
///
/// ```rust,ignore
/// use pgloop::Pipeline;
///
/// let mut pipeline = Pipeline::new(&pool);
/// pipeline
///     .queue_params("INSERT INTO posts (title) VALUES ($1)", &[Some("hello")], |_| {})?
///     .queue_with("SELECT count(*) FROM posts", |result| {
///         println!("{} posts", result.get(0, 0).unwrap_or("0"));
///     })?;
/// pipeline.on_complete(|outcome| tracing::info!(?outcome, "done"));
///
/// let outcome = pipeline.execute()?.outcome().await;
/// ```
pub struct Pipeline {
    source: Option<Source>,
    arena: ArenaScope,
    queue: VecDeque<Statement>,
    on_complete: Option<CompletionCallback>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    pub(crate) transaction: Option<Begin>,
    pub(crate) stream: Option<StreamLink>,
    sanitizer: SanitizationConfig,
}

impl Pipeline {
    /// Create a pipeline that acquires a connection from `pool` when
    /// executed. Its arena is borrowed from the global arena pool.
    #[must_use]
    pub fn new(pool: &Pool) -> Self {
        Self::build(
            Source::Pool(pool.clone()),
            ArenaScope::Owned(arena::borrow()),
            pool,
        )
    }

    /// Create a pool-backed pipeline storing its text in `arena`.
    ///
    /// The caller keeps ownership of the arena; the pipeline only drops its
    /// handle at teardown.
    #[must_use]
    pub fn with_arena(pool: &Pool, arena: Arena) -> Self {
        Self::build(Source::Pool(pool.clone()), ArenaScope::Shared(arena), pool)
    }

    /// Create a pipeline bound to a connection already checked out.
    #[must_use]
    pub fn bound(conn: PooledConnection) -> Self {
        let pool = conn.pool();
        Self::build(
            Source::Bound(conn),
            ArenaScope::Owned(arena::borrow()),
            &pool,
        )
    }

    fn build(source: Source, arena: ArenaScope, pool: &Pool) -> Self {
        Self {
            source: Some(source),
            arena,
            queue: VecDeque::new(),
            on_complete: None,
            shutdown: pool.shutdown_token(),
            poll_interval: pool.config().poll_interval,
            transaction: None,
            stream: None,
            sanitizer: SanitizationConfig::default(),
        }
    }

    /// Abort on `token` instead of the pool's shutdown token.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Use `config` when logging statement text.
    #[must_use]
    pub fn with_sanitization(mut self, config: SanitizationConfig) -> Self {
        self.sanitizer = config;
        self
    }

    /// Queue a statement whose results are ignored.
    pub fn queue(&mut self, sql: &str) -> Result<&mut Self, Error> {
        self.push(sql, &[], None, StatementKind::User)?;
        Ok(self)
    }

    /// Queue a statement, calling `on_result` with each of its results.
    pub fn queue_with<F>(&mut self, sql: &str, on_result: F) -> Result<&mut Self, Error>
    where
        F: FnMut(&QueryResult) + Send + 'static,
    {
        self.push(sql, &[], Some(Box::new(on_result)), StatementKind::User)?;
        Ok(self)
    }

    /// Queue a statement with positional parameters (`$1`, `$2`, ...).
    ///
    /// `None` parameters are sent as NULL.
    pub fn queue_params<F>(
        &mut self,
        sql: &str,
        params: &[Option<&str>],
        on_result: F,
    ) -> Result<&mut Self, Error>
    where
        F: FnMut(&QueryResult) + Send + 'static,
    {
        self.push(sql, params, Some(Box::new(on_result)), StatementKind::User)?;
        Ok(self)
    }

    /// Register the completion callback, replacing any previous one.
    pub fn on_complete<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Number of queued statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn push(
        &mut self,
        sql: &str,
        params: &[Option<&str>],
        on_result: Option<ResultCallback>,
        kind: StatementKind,
    ) -> Result<(), Error> {
        if sql.trim().is_empty() {
            return Err(Error::InvalidStatement("empty statement".into()));
        }
        if sql.contains('\0') {
            return Err(Error::InvalidStatement(
                "statement contains a NUL byte".into(),
            ));
        }
        if let Some(n) = params.iter().position(|p| p.is_some_and(|p| p.contains('\0'))) {
            return Err(Error::InvalidStatement(format!(
                "parameter ${} contains a NUL byte",
                n + 1
            )));
        }

        let arena = self.arena.arena();
        let statement = Statement {
            sql: arena.alloc_str(sql),
            params: params.iter().map(|p| p.map(|p| arena.alloc_str(p))).collect(),
            on_result,
            kind,
        };
        match kind {
            StatementKind::Begin => self.queue.push_front(statement),
            StatementKind::User | StatementKind::Commit => self.queue.push_back(statement),
        }
        Ok(())
    }

    /// Run the queued statements.
    ///
    /// Consumes the pipeline, so a pipeline can only be executed once. An
    /// empty pipeline completes immediately without taking a connection.
    /// Outside a Tokio runtime the completion callback reports
    /// [`Error::NoRuntime`] and the same error is returned.
    pub fn execute(mut self) -> Result<PipelineHandle, Error> {
        let (done, rx) = oneshot::channel();
        let handle = PipelineHandle { rx };

        if self.queue.is_empty() {
            tracing::debug!("empty pipeline completes immediately");
            self.finish(None, Outcome::Completed, done);
            return Ok(handle);
        }

        if let Some(begin) = self.transaction {
            let sql = begin.sql();
            self.push(sql, &[], None, StatementKind::Begin)?;
            self.push(crate::transaction::COMMIT, &[], None, StatementKind::Commit)?;
        }

        let Ok(runtime) = Handle::try_current() else {
            self.finish(None, Outcome::Failed(Error::NoRuntime), done);
            return Err(Error::NoRuntime);
        };

        let span = tracing::debug_span!(
            span_names::PIPELINE,
            db.system = DB_SYSTEM,
            statements = self.queue.len(),
            transactional = self.transaction.is_some(),
            stream = self.stream.as_ref().map(StreamLink::index),
        );
        runtime.spawn(self.run(done).instrument(span));
        Ok(handle)
    }

    async fn run(mut self, done: oneshot::Sender<Outcome>) {
        let shutdown = self.shutdown.clone();

        let acquired = match self.source.take() {
            Some(Source::Bound(conn)) => Ok(conn),
            Some(Source::Pool(pool)) => {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        return self.finish(None, Outcome::Aborted, done);
                    }
                    conn = pool.acquire() => conn.map_err(Error::from),
                }
            }
            None => Err(Error::NotConnected),
        };
        let mut conn = match acquired {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "pipeline could not get a connection");
                return self.finish(None, Outcome::Failed(e), done);
            }
        };

        let mut readiness = Readiness::register(conn.socket(), self.poll_interval);
        tracing::debug!(
            slot = conn.slot(),
            polling = readiness.is_polling(),
            "pipeline running"
        );
        let arena = self.arena.arena().clone();
        let mut release = Release::Return;
        let mut in_transaction = false;
        let mut index = 0;

        let outcome = loop {
            let Some(statement) = self.queue.pop_front() else {
                break Outcome::Completed;
            };
            match statement.kind {
                StatementKind::Begin => in_transaction = true,
                StatementKind::Commit => in_transaction = false,
                StatementKind::User => {}
            }

            let step = run_statement(
                &mut conn,
                &mut readiness,
                &arena,
                &shutdown,
                &self.sanitizer,
                statement,
                index,
            )
            .await;

            match step {
                Step::Done => index += 1,
                Step::Failed { error, release: r } => {
                    release = r;
                    break Outcome::Failed(error);
                }
                Step::Aborted { in_flight } => {
                    if in_flight {
                        tracing::debug!(statement = index, "cancelling in-flight statement");
                        if let Err(e) = conn.cancel() {
                            tracing::debug!(error = %e, "cancel request failed");
                        }
                        release = Release::Discard;
                    }
                    break Outcome::Aborted;
                }
            }
        };

        if in_transaction && release == Release::Return {
            let rolled_back = match outcome {
                Outcome::Failed(_) => {
                    tokio::time::timeout(ROLLBACK_TIMEOUT, rollback(&mut conn, &mut readiness))
                        .await
                        .unwrap_or(false)
                }
                // An abandoned transaction is rolled back by the server when
                // the connection closes.
                Outcome::Aborted | Outcome::Completed => false,
            };
            if !rolled_back {
                release = Release::Discard;
            }
        }

        drop(readiness);
        drop(arena);

        match &outcome {
            Outcome::Completed => tracing::debug!(statements = index, "pipeline completed"),
            Outcome::Failed(e) => tracing::debug!(error = %e, "pipeline failed"),
            Outcome::Aborted => tracing::debug!(statements = index, "pipeline aborted"),
        }

        self.finish(Some((conn, release)), outcome, done);
    }

    /// Tear down: completion callback, then the connection, then the arena,
    /// then the parallel barrier and the handle.
    fn finish(
        mut self,
        conn: Option<(PooledConnection, Release)>,
        outcome: Outcome,
        done: oneshot::Sender<Outcome>,
    ) {
        if let Some(callback) = self.on_complete.take() {
            callback(&outcome);
        }

        match conn {
            Some((conn, Release::Return)) => drop(conn),
            Some((conn, Release::Discard)) => conn.discard(),
            None => {}
        }

        let Pipeline {
            source,
            arena,
            queue,
            stream,
            ..
        } = self;
        drop(source);
        drop(queue);
        drop(arena);

        if let Some(stream) = stream {
            stream.arrive(outcome.clone());
        }
        let _ = done.send(outcome);
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("statements", &self.queue.len())
            .field("bound", &matches!(self.source, Some(Source::Bound(_))))
            .field("transaction", &self.transaction)
            .field("arena_bytes", &self.arena.arena().used_bytes())
            .finish()
    }
}

/// Send one statement and drain its results.
async fn run_statement(
    conn: &mut PooledConnection,
    readiness: &mut Readiness,
    arena: &Arena,
    shutdown: &CancellationToken,
    sanitizer: &SanitizationConfig,
    mut statement: Statement,
    index: usize,
) -> Step {
    if shutdown.is_cancelled() {
        return Step::Aborted { in_flight: false };
    }

    let sent = arena.with_statement(&statement.sql, &statement.params, |sql, params| {
        tracing::debug!(
            statement = index,
            db.operation = extract_operation(sql),
            db.statement = %sanitizer.sanitize(sql),
            params = params.len(),
            "sending statement"
        );
        conn.send_query(sql, params)
    });
    match sent {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Step::Failed {
                error: Error::Send {
                    index,
                    message: e.to_string(),
                },
                release: Release::Discard,
            };
        }
        Err(e) => {
            return Step::Failed {
                error: e,
                release: Release::Return,
            };
        }
    }

    loop {
        match conn.flush() {
            Ok(FlushStatus::Done) => break,
            Ok(FlushStatus::Pending) => {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => return Step::Aborted { in_flight: true },
                    ready = readiness.writable() => {
                        if let Err(error) = ready {
                            return Step::Failed { error, release: Release::Discard };
                        }
                    }
                }
            }
            Err(e) => {
                return Step::Failed {
                    error: Error::Send {
                        index,
                        message: e.to_string(),
                    },
                    release: Release::Discard,
                };
            }
        }
    }

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return Step::Aborted { in_flight: true },
            ready = readiness.readable() => {
                if let Err(error) = ready {
                    return Step::Failed { error, release: Release::Discard };
                }
            }
        }
        tracing::trace!(statement = index, "socket readable");

        if let Err(e) = conn.consume_input() {
            return Step::Failed {
                error: Error::Consume {
                    index,
                    message: e.to_string(),
                },
                release: Release::Discard,
            };
        }
        if !conn.is_busy() {
            break;
        }
    }

    let mut failure = None;
    while let Some(result) = conn.next_result() {
        if let Some(on_result) = statement.on_result.as_mut() {
            on_result(&result);
        }
        if failure.is_none() && !result.is_success() {
            let detail = result.error_detail();
            failure = Some(Error::Statement {
                index,
                message: detail.map_or_else(
                    || format!("unexpected result status {:?}", result.status()),
                    |d| d.message.clone(),
                ),
                sqlstate: detail.and_then(|d| d.sqlstate.clone()),
            });
        }
    }

    match failure {
        Some(error) => {
            tracing::debug!(statement = index, error = %error, "statement failed");
            Step::Failed {
                error,
                release: Release::Return,
            }
        }
        None => Step::Done,
    }
}

/// Roll back a failed transaction. Returns false if the connection could
/// not confirm it.
async fn rollback(conn: &mut PooledConnection, readiness: &mut Readiness) -> bool {
    tracing::debug!("rolling back failed transaction");
    if conn.send_query(ROLLBACK, &[]).is_err() {
        return false;
    }
    loop {
        match conn.flush() {
            Ok(FlushStatus::Done) => break,
            Ok(FlushStatus::Pending) => {
                if readiness.writable().await.is_err() {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    loop {
        if readiness.readable().await.is_err() || conn.consume_input().is_err() {
            return false;
        }
        if !conn.is_busy() {
            break;
        }
    }

    let mut ok = false;
    while let Some(result) = conn.next_result() {
        ok = result.is_success();
    }
    ok
}

/// Awaitable result of [`Pipeline::execute`].
#[derive(Debug)]
pub struct PipelineHandle {
    rx: oneshot::Receiver<Outcome>,
}

impl PipelineHandle {
    /// Wait for the pipeline to finish.
    ///
    /// Reports [`Outcome::Aborted`] if the task was dropped before it could
    /// report back, for example because the runtime shut down.
    pub async fn outcome(self) -> Outcome {
        self.rx.await.unwrap_or(Outcome::Aborted)
    }
}

//! Scriptable in-memory driver.
//!
//! [`MockDriver`] hands out [`MockConnection`]s that share one state block,
//! so a test can script responses, break connections and inspect what was
//! sent after the fact.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use pgloop_driver::{ConnStatus, Connection, Driver, DriverError, QueryResult};

/// What a connection answers when a statement matches a rule.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Rows with the given column names.
    Rows {
        /// Column names.
        columns: Vec<String>,
        /// Text rows; `None` is NULL.
        rows: Vec<Vec<Option<String>>>,
    },
    /// A command completion tag such as `INSERT 0 1`.
    Command(String),
    /// A statement error.
    Error {
        /// SQLSTATE code.
        sqlstate: String,
        /// Error message.
        message: String,
    },
    /// `send_query` itself fails.
    SendFailure(String),
    /// `consume_input` fails once the statement is in flight.
    ConsumeFailure(String),
}

impl MockResponse {
    /// Rows built from string slices.
    #[must_use]
    pub fn rows(columns: &[&str], rows: &[&[&str]]) -> Self {
        Self::Rows {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| Some((*v).to_string())).collect())
                .collect(),
        }
    }

    /// A command completion.
    #[must_use]
    pub fn command(tag: &str) -> Self {
        Self::Command(tag.to_string())
    }

    /// A statement error.
    #[must_use]
    pub fn error(sqlstate: &str, message: &str) -> Self {
        Self::Error {
            sqlstate: sqlstate.to_string(),
            message: message.to_string(),
        }
    }
}

/// One statement observed by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentQuery {
    /// Id of the connection the statement was sent on.
    pub conn: usize,
    /// Statement text.
    pub sql: String,
    /// Parameters; `None` is NULL.
    pub params: Vec<Option<String>>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: usize,
    live: usize,
    connect_attempts: usize,
    fail_connects: usize,
    refuse_connects: bool,
    fail_resets: bool,
    broken: HashSet<usize>,
    rules: Vec<(String, MockResponse)>,
    busy_polls: usize,
    paused: bool,
    sent: Vec<SentQuery>,
    cancels: usize,
    resets: usize,
    conninfos: Vec<String>,
}

impl MockState {
    fn response_for(&self, sql: &str) -> MockResponse {
        self.rules
            .iter()
            .rev()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map_or_else(|| default_response(sql), |(_, r)| r.clone())
    }
}

fn default_response(sql: &str) -> MockResponse {
    let verb = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    let tag = match verb.as_str() {
        "INSERT" => "INSERT 0 1".to_string(),
        "UPDATE" | "DELETE" => format!("{verb} 1"),
        "SELECT" => {
            return MockResponse::Rows {
                columns: vec!["?column?".to_string()],
                rows: vec![vec![Some("1".to_string())]],
            };
        }
        _ => verb,
    };
    MockResponse::Command(tag)
}

/// In-memory driver whose connections follow scripted rules.
///
/// Statements without a matching rule succeed: `SELECT` returns one row,
/// everything else a command tag built from the first keyword.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    /// Create a driver with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer statements containing `pattern` with `response`.
    ///
    /// Later rules take precedence over earlier ones.
    pub fn respond(&self, pattern: &str, response: MockResponse) -> &Self {
        self.state
            .lock()
            .rules
            .push((pattern.to_string(), response));
        self
    }

    /// Number of extra `consume_input` calls each statement needs before its
    /// result is ready.
    pub fn set_busy_polls(&self, polls: usize) -> &Self {
        self.state.lock().busy_polls = polls;
        self
    }

    /// Stop all statements from making progress.
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    /// Let paused statements make progress again.
    pub fn resume(&self) {
        self.state.lock().paused = false;
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().fail_connects = count;
    }

    /// Refuse every connection attempt while `refuse` is set.
    pub fn refuse_connects(&self, refuse: bool) {
        self.state.lock().refuse_connects = refuse;
    }

    /// Make `reset` fail while `fail` is set.
    pub fn fail_resets(&self, fail: bool) {
        self.state.lock().fail_resets = fail;
    }

    /// Mark one connection broken.
    pub fn break_connection(&self, id: usize) {
        self.state.lock().broken.insert(id);
    }

    /// Mark every connection handed out so far broken.
    pub fn break_all(&self) {
        let mut state = self.state.lock();
        let ids: Vec<usize> = (0..state.next_id).collect();
        state.broken.extend(ids);
    }

    /// Every statement sent so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<SentQuery> {
        self.state.lock().sent.clone()
    }

    /// Statement texts sent so far, in order.
    #[must_use]
    pub fn sent_sql(&self) -> Vec<String> {
        self.state.lock().sent.iter().map(|q| q.sql.clone()).collect()
    }

    /// Statement texts sent on one connection, in order.
    #[must_use]
    pub fn sent_on(&self, conn: usize) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|q| q.conn == conn)
            .map(|q| q.sql.clone())
            .collect()
    }

    /// Number of cancel requests received.
    #[must_use]
    pub fn cancels(&self) -> usize {
        self.state.lock().cancels
    }

    /// Number of reset attempts.
    #[must_use]
    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    /// Number of connection attempts, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Number of connections currently open.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.state.lock().live
    }

    /// Conninfo strings passed to `connect`.
    #[must_use]
    pub fn conninfos(&self) -> Vec<String> {
        self.state.lock().conninfos.clone()
    }
}

impl Driver for MockDriver {
    fn connect(&self, conninfo: &str) -> Result<Box<dyn Connection>, DriverError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        state.conninfos.push(conninfo.to_string());

        if state.refuse_connects {
            return Err(DriverError::Connect("connection refused".into()));
        }
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(DriverError::Connect("connection refused".into()));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.live += 1;
        tracing::trace!(conn = id, "mock connection opened");

        Ok(Box::new(MockConnection {
            id,
            state: Arc::clone(&self.state),
            nonblocking: false,
            pending: None,
            ready: VecDeque::new(),
        }))
    }
}

#[derive(Debug)]
struct Pending {
    response: MockResponse,
    polls_left: usize,
}

/// A connection handed out by [`MockDriver`].
#[derive(Debug)]
pub struct MockConnection {
    id: usize,
    state: Arc<Mutex<MockState>>,
    nonblocking: bool,
    pending: Option<Pending>,
    ready: VecDeque<QueryResult>,
}

impl MockConnection {
    /// Id assigned at connect time, starting at zero.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether the connection is in non-blocking mode.
    #[must_use]
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    fn is_broken(&self) -> bool {
        self.state.lock().broken.contains(&self.id)
    }
}

impl Connection for MockConnection {
    fn status(&self) -> ConnStatus {
        if self.is_broken() {
            ConnStatus::Bad
        } else {
            ConnStatus::Ok
        }
    }

    fn error_message(&self) -> String {
        if self.is_broken() {
            "server closed the connection unexpectedly".to_string()
        } else {
            String::new()
        }
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), DriverError> {
        self.nonblocking = nonblocking;
        Ok(())
    }

    fn send_query(&mut self, sql: &str, params: &[Option<&str>]) -> Result<(), DriverError> {
        if self.pending.is_some() || !self.ready.is_empty() {
            return Err(DriverError::Send(
                "another command is already in progress".into(),
            ));
        }

        let mut state = self.state.lock();
        if state.broken.contains(&self.id) {
            return Err(DriverError::Send("no connection to the server".into()));
        }
        state.sent.push(SentQuery {
            conn: self.id,
            sql: sql.to_string(),
            params: params.iter().map(|p| p.map(str::to_string)).collect(),
        });

        let response = state.response_for(sql);
        if let MockResponse::SendFailure(message) = response {
            return Err(DriverError::Send(message));
        }
        self.pending = Some(Pending {
            response,
            polls_left: state.busy_polls,
        });
        Ok(())
    }

    fn consume_input(&mut self) -> Result<(), DriverError> {
        let state = self.state.lock();
        if state.broken.contains(&self.id) {
            return Err(DriverError::Io("server closed the connection".into()));
        }
        if state.paused {
            return Ok(());
        }
        drop(state);

        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        if pending.polls_left > 0 {
            pending.polls_left -= 1;
            return Ok(());
        }

        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let result = match pending.response {
            MockResponse::Rows { columns, rows } => QueryResult::tuples(&columns, rows),
            MockResponse::Command(tag) => QueryResult::command(tag),
            MockResponse::Error { sqlstate, message } => {
                QueryResult::error(Some(&sqlstate), message)
            }
            MockResponse::SendFailure(message) | MockResponse::ConsumeFailure(message) => {
                return Err(DriverError::Io(message));
            }
        };
        self.ready.push_back(result);
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    fn next_result(&mut self) -> Option<QueryResult> {
        self.ready.pop_front()
    }

    fn cancel(&mut self) -> Result<(), DriverError> {
        self.state.lock().cancels += 1;
        if self.pending.take().is_some() {
            self.ready.push_back(QueryResult::error(
                Some("57014"),
                "canceling statement due to user request",
            ));
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.resets += 1;
        if state.fail_resets {
            return Err(DriverError::Connect("reset failed".into()));
        }
        state.broken.remove(&self.id);
        self.pending = None;
        self.ready.clear();
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        tracing::trace!(conn = self.id, "mock connection closed");
    }
}

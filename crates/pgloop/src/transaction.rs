//! Transaction support.
//!
//! A transactional pipeline runs its queue between `BEGIN` and `COMMIT`.
//! If any statement fails, `COMMIT` is never sent and a best-effort
//! `ROLLBACK` is issued before the connection goes back to the pool.

use crate::error::Error;
use crate::pipeline::{Pipeline, PipelineHandle};

pub(crate) const COMMIT: &str = "COMMIT";
pub(crate) const ROLLBACK: &str = "ROLLBACK";

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted. PostgreSQL treats it as read committed.
    ReadUncommitted,
    /// Read committed (PostgreSQL default).
    #[default]
    ReadCommitted,
    /// Repeatable read.
    RepeatableRead,
    /// Serializable (highest isolation).
    Serializable,
}

impl IsolationLevel {
    /// The isolation level as written in SQL.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    /// The `BEGIN` statement opening a transaction at this level.
    #[must_use]
    pub fn begin_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "BEGIN ISOLATION LEVEL READ UNCOMMITTED",
            Self::ReadCommitted => "BEGIN ISOLATION LEVEL READ COMMITTED",
            Self::RepeatableRead => "BEGIN ISOLATION LEVEL REPEATABLE READ",
            Self::Serializable => "BEGIN ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// How a transactional pipeline opens its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Begin {
    /// Plain `BEGIN`, using the session's default isolation.
    Plain,
    /// `BEGIN ISOLATION LEVEL ...`.
    Isolation(IsolationLevel),
}

impl Begin {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Self::Plain => "BEGIN",
            Self::Isolation(level) => level.begin_sql(),
        }
    }
}

impl Pipeline {
    /// Run this pipeline inside a transaction when it executes.
    ///
    /// `None` opens the transaction with a plain `BEGIN`. Useful for
    /// parallel streams, which are executed by their context.
    pub fn transactional(&mut self, isolation: Option<IsolationLevel>) -> &mut Self {
        self.transaction = Some(isolation.map_or(Begin::Plain, Begin::Isolation));
        self
    }

    /// Execute the queue between `BEGIN` and `COMMIT`.
    ///
    /// An empty queue completes immediately without opening a transaction.
    pub fn execute_transactional(mut self) -> Result<PipelineHandle, Error> {
        self.transactional(None);
        self.execute()
    }

    /// Execute the queue in a transaction at the given isolation level.
    pub fn execute_transactional_with(
        mut self,
        isolation: IsolationLevel,
    ) -> Result<PipelineHandle, Error> {
        self.transactional(Some(isolation));
        self.execute()
    }
}

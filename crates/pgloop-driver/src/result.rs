//! Result sets returned by the driver.
//!
//! Values arrive in the server's text format. Callers extract fields by
//! row and column index or by column name and parse them themselves.

/// Execution status of a single result, mirroring libpq's `ExecStatusType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The query string was empty.
    EmptyQuery,
    /// A command that returns no rows completed.
    CommandOk,
    /// A query that returns rows completed.
    TuplesOk,
    /// A `COPY ... TO STDOUT` transfer started.
    CopyOut,
    /// A `COPY ... FROM STDIN` transfer started.
    CopyIn,
    /// The server's response was not understood.
    BadResponse,
    /// A notice or warning was returned.
    NonfatalError,
    /// The statement failed.
    FatalError,
    /// One row of a result delivered in single-row mode.
    SingleTuple,
}

impl ExecStatus {
    /// Whether this status counts as a successful statement.
    ///
    /// Only `CommandOk` and `TuplesOk` are treated as success; everything
    /// else aborts a pipeline.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::CommandOk | Self::TuplesOk)
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column index.
    pub index: usize,
}

/// Error details attached to a failed result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultError {
    /// Five-character SQLSTATE code, when the server supplied one.
    pub sqlstate: Option<String>,
    /// Primary human-readable message.
    pub message: String,
}

/// A raw result set for one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    status: ExecStatus,
    columns: Vec<Column>,
    rows: Vec<Vec<Option<String>>>,
    command_tag: String,
    error: Option<ResultError>,
}

impl QueryResult {
    /// Build a result for a command that returns no rows, e.g. `INSERT 0 1`.
    #[must_use]
    pub fn command(tag: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::CommandOk,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: tag.into(),
            error: None,
        }
    }

    /// Build a row-returning result.
    ///
    /// Rows shorter than the column list read as NULL for missing fields.
    #[must_use]
    pub fn tuples<S: AsRef<str>>(columns: &[S], rows: Vec<Vec<Option<String>>>) -> Self {
        let columns = columns
            .iter()
            .enumerate()
            .map(|(index, name)| Column {
                name: name.as_ref().to_string(),
                index,
            })
            .collect();
        let command_tag = format!("SELECT {}", rows.len());
        Self {
            status: ExecStatus::TuplesOk,
            columns,
            rows,
            command_tag,
            error: None,
        }
    }

    /// Build a failed result.
    #[must_use]
    pub fn error(sqlstate: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::FatalError,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: String::new(),
            error: Some(ResultError {
                sqlstate: sqlstate.map(str::to_string),
                message: message.into(),
            }),
        }
    }

    /// Build a result with an arbitrary status and no rows.
    #[must_use]
    pub fn with_status(status: ExecStatus) -> Self {
        Self {
            status,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: String::new(),
            error: None,
        }
    }

    /// Assemble a result from the pieces a driver reads off the wire.
    ///
    /// Used by drivers whose results do not fit the narrower constructors,
    /// e.g. a failed result with a non-fatal status or a row-returning
    /// result whose command tag is not `SELECT n`.
    #[must_use]
    pub fn from_parts(
        status: ExecStatus,
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
        command_tag: impl Into<String>,
        error: Option<ResultError>,
    ) -> Self {
        let columns = columns
            .into_iter()
            .enumerate()
            .map(|(index, name)| Column { name, index })
            .collect();
        Self {
            status,
            columns,
            rows,
            command_tag: command_tag.into(),
            error,
        }
    }

    /// Execution status.
    #[must_use]
    pub fn status(&self) -> ExecStatus {
        self.status
    }

    /// Whether the statement succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Error details, present for failed results.
    #[must_use]
    pub fn error_detail(&self) -> Option<&ResultError> {
        self.error.as_ref()
    }

    /// Error message, or an empty string for successful results.
    #[must_use]
    pub fn error_message(&self) -> &str {
        self.error.as_ref().map_or("", |e| e.message.as_str())
    }

    /// Command tag reported by the server.
    #[must_use]
    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    /// Number of rows affected, parsed from the trailing number of the
    /// command tag (`UPDATE 3`, `INSERT 0 1`, `SELECT 12`).
    #[must_use]
    pub fn rows_affected(&self) -> Option<u64> {
        self.command_tag
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
    }

    /// Number of rows.
    #[must_use]
    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns.
    #[must_use]
    pub fn nfields(&self) -> usize {
        self.columns.len()
    }

    /// Column metadata.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Index of the column with the given name (case-insensitive).
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Text value at `row`, `column`. `None` for NULL or out-of-range.
    #[must_use]
    pub fn get(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .and_then(|v| v.as_deref())
    }

    /// Text value at `row` for the named column.
    #[must_use]
    pub fn get_by_name(&self, row: usize, name: &str) -> Option<&str> {
        self.column_index(name).and_then(|c| self.get(row, c))
    }

    /// Whether the value at `row`, `column` is NULL.
    ///
    /// Out-of-range positions read as NULL.
    #[must_use]
    pub fn is_null(&self, row: usize, column: usize) -> bool {
        self.get(row, column).is_none()
    }

    /// Iterate over rows as slices of nullable text values.
    pub fn rows(&self) -> impl Iterator<Item = &[Option<String>]> {
        self.rows.iter().map(Vec::as_slice)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn users() -> QueryResult {
        QueryResult::tuples(
            &["id", "name"],
            vec![
                vec![Some("1".into()), Some("ada".into())],
                vec![Some("2".into()), None],
            ],
        )
    }

    #[test]
    fn test_lookup_by_index_and_name() {
        let result = users();
        assert_eq!(result.ntuples(), 2);
        assert_eq!(result.nfields(), 2);
        assert_eq!(result.get(0, 1), Some("ada"));
        assert_eq!(result.get_by_name(1, "ID"), Some("2"));
        assert!(result.is_null(1, 1));
        assert!(result.is_null(5, 0));
        assert_eq!(result.get_by_name(0, "missing"), None);
    }

    #[test]
    fn test_rows_affected_from_tag() {
        assert_eq!(QueryResult::command("INSERT 0 1").rows_affected(), Some(1));
        assert_eq!(QueryResult::command("UPDATE 7").rows_affected(), Some(7));
        assert_eq!(QueryResult::command("BEGIN").rows_affected(), None);
        assert_eq!(users().rows_affected(), Some(2));
    }

    #[test]
    fn test_error_result() {
        let result = QueryResult::error(Some("23505"), "duplicate key");
        assert!(!result.is_success());
        assert_eq!(result.status(), ExecStatus::FatalError);
        assert_eq!(result.error_message(), "duplicate key");
        assert_eq!(
            result.error_detail().unwrap().sqlstate.as_deref(),
            Some("23505")
        );
    }

    #[test]
    fn test_from_parts_keeps_driver_values() {
        let result = QueryResult::from_parts(
            ExecStatus::TuplesOk,
            vec!["id".into()],
            vec![vec![Some("7".into())]],
            "INSERT 0 1",
            None,
        );
        assert_eq!(result.command_tag(), "INSERT 0 1");
        assert_eq!(result.get_by_name(0, "id"), Some("7"));
        assert_eq!(result.columns()[0].index, 0);

        let notice = QueryResult::from_parts(
            ExecStatus::BadResponse,
            Vec::new(),
            Vec::new(),
            "",
            Some(ResultError {
                sqlstate: None,
                message: "unexpected message type".into(),
            }),
        );
        assert!(!notice.is_success());
        assert_eq!(notice.error_message(), "unexpected message type");
    }

    #[test]
    fn test_success_statuses() {
        assert!(ExecStatus::CommandOk.is_success());
        assert!(ExecStatus::TuplesOk.is_success());
        assert!(!ExecStatus::EmptyQuery.is_success());
        assert!(!ExecStatus::NonfatalError.is_success());
        assert!(!ExecStatus::CopyIn.is_success());
    }
}

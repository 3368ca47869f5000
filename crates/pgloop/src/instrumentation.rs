//! Tracing helpers for statement logging.
//!
//! Statement text is never logged verbatim. [`SanitizationConfig::sanitize`]
//! replaces literal values with a placeholder while keeping `$n` parameter
//! markers, and truncates long statements.
//!
//! ## Fields
//!
//! Statement events carry the following fields:
//! - `db.system`: "postgresql"
//! - `db.operation`: leading keyword (SELECT, INSERT, BEGIN, ...)
//! - `db.statement`: sanitized statement text
//! - `statement`: position of the statement in its pipeline

/// Database system identifier.
pub const DB_SYSTEM: &str = "postgresql";

/// Span names used by the engine.
pub mod span_names {
    /// Span covering one pipeline run.
    pub const PIPELINE: &str = "pgloop.pipeline";
    /// Span covering one parallel context run.
    pub const PARALLEL: &str = "pgloop.parallel";
}

/// Configuration for SQL statement sanitization.
#[derive(Debug, Clone)]
pub struct SanitizationConfig {
    /// Whether to sanitize SQL statements.
    pub enabled: bool,
    /// Maximum length of statement to record.
    pub max_length: usize,
    /// Placeholder to use for sanitized values.
    pub placeholder: String,
}

impl Default for SanitizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_length: 2048,
            placeholder: "?".to_string(),
        }
    }
}

impl SanitizationConfig {
    /// Create a configuration that doesn't sanitize statements.
    #[must_use]
    pub fn no_sanitization() -> Self {
        Self {
            enabled: false,
            max_length: usize::MAX,
            placeholder: String::new(),
        }
    }

    /// Sanitize a SQL statement according to the configuration.
    #[must_use]
    pub fn sanitize(&self, sql: &str) -> String {
        if !self.enabled {
            return truncate_string(sql, self.max_length);
        }

        let sanitized = sanitize_sql(sql, &self.placeholder);
        truncate_string(&sanitized, self.max_length)
    }
}

/// Replace string and numeric literals with `placeholder`.
///
/// Double-quoted identifiers and `$n` parameters are kept.
fn sanitize_sql(sql: &str, placeholder: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                        }
                        Some('\'') | None => break,
                        Some(_) => {}
                    }
                }
                result.push_str(placeholder);
            }
            '"' => {
                result.push(c);
                for ident in chars.by_ref() {
                    result.push(ident);
                    if ident == '"' {
                        break;
                    }
                }
            }
            '$' => {
                result.push(c);
                while let Some(d) = chars.next_if(char::is_ascii_digit) {
                    result.push(d);
                }
            }
            c if c.is_ascii_digit()
                && !result.ends_with(|ch: char| ch.is_alphanumeric() || ch == '_') =>
            {
                while chars.next_if(|ch| ch.is_ascii_digit() || *ch == '.').is_some() {}
                result.push_str(placeholder);
            }
            c => result.push(c),
        }
    }

    result
}

/// Truncate a string to at most `max_len` bytes on a character boundary.
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Extract the operation type from a SQL statement.
#[must_use]
pub fn extract_operation(sql: &str) -> &'static str {
    let sql_upper = sql.trim_start().to_uppercase();
    let keyword = sql_upper
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default();

    match keyword {
        "SELECT" => "SELECT",
        "INSERT" => "INSERT",
        "UPDATE" => "UPDATE",
        "DELETE" => "DELETE",
        "WITH" => "WITH",
        "BEGIN" | "START" => "BEGIN",
        "COMMIT" | "END" => "COMMIT",
        "ROLLBACK" | "ABORT" => "ROLLBACK",
        "SAVEPOINT" => "SAVEPOINT",
        "CREATE" => "CREATE",
        "ALTER" => "ALTER",
        "DROP" => "DROP",
        "COPY" => "COPY",
        _ => "OTHER",
    }
}

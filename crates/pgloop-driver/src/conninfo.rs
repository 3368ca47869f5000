//! Connection parameters.

use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::DriverError;

/// `key = value` pairs, where the value is either bare or single-quoted with
/// backslash escapes.
static PAIR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\s*=\s*('(?:[^'\\]|\\.)*'|[^\s']+)")
        .unwrap_or_else(|_| unreachable!())
});

/// Environment variable names read by [`ConnInfo::from_env`].
pub mod env {
    /// Server host.
    pub const HOST: &str = "DB_HOST";
    /// Server port.
    pub const PORT: &str = "DB_PORT";
    /// Database name.
    pub const NAME: &str = "DB_NAME";
    /// User name.
    pub const USER: &str = "DB_USER";
    /// Password.
    pub const PASSWORD: &str = "DB_PASSWORD";
}

/// Parameters for connecting to a PostgreSQL server.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnInfo {
    /// Server hostname or IP address.
    pub host: String,

    /// Server port (default: 5432).
    pub port: u16,

    /// Database name.
    pub dbname: String,

    /// User name.
    pub user: String,

    /// Password.
    pub password: String,

    /// Application name reported to the server.
    pub application_name: Option<String>,

    /// Connection timeout.
    pub connect_timeout: Option<Duration>,
}

impl Default for ConnInfo {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            application_name: None,
            connect_timeout: None,
        }
    }
}

impl fmt::Debug for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("application_name", &self.application_name)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ConnInfo {
    /// Create parameters with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a libpq-style conninfo string.
    ///
    /// ```text
    /// host=localhost port=5432 dbname=app user=app password='s3cr et'
    /// ```
    ///
    /// Unknown keys are ignored.
    pub fn parse(conninfo: &str) -> Result<Self, DriverError> {
        let mut info = Self::default();
        let mut consumed = 0;

        for caps in PAIR_RE.captures_iter(conninfo) {
            let (Some(whole), Some(key), Some(raw)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            if !conninfo[consumed..whole.start()].trim().is_empty() {
                return Err(DriverError::Config(format!(
                    "unexpected text: {}",
                    conninfo[consumed..whole.start()].trim()
                )));
            }
            consumed = whole.end();

            let value = unquote(raw.as_str());
            match key.as_str() {
                "host" | "hostaddr" => info.host = value,
                "port" => {
                    info.port = value
                        .parse()
                        .map_err(|_| DriverError::Config(format!("invalid port: {value}")))?;
                }
                "dbname" => info.dbname = value,
                "user" => info.user = value,
                "password" => info.password = value,
                "application_name" => info.application_name = Some(value),
                "connect_timeout" => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| DriverError::Config(format!("invalid timeout: {value}")))?;
                    info.connect_timeout = Some(Duration::from_secs(secs));
                }
                other => {
                    tracing::debug!(key = other, "ignoring unknown conninfo option");
                }
            }
        }

        let rest = conninfo[consumed..].trim();
        if !rest.is_empty() {
            return Err(DriverError::Config(format!("unexpected text: {rest}")));
        }

        Ok(info)
    }

    /// Read parameters from `DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_USER` and
    /// `DB_PASSWORD`. Missing variables keep their defaults.
    pub fn from_env() -> Result<Self, DriverError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ConnInfo::from_env`] but reads through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DriverError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut info = Self::default();
        if let Some(host) = lookup(env::HOST) {
            info.host = host;
        }
        if let Some(port) = lookup(env::PORT) {
            info.port = port
                .trim()
                .parse()
                .map_err(|_| DriverError::Config(format!("invalid {}: {port}", env::PORT)))?;
        }
        if let Some(dbname) = lookup(env::NAME) {
            info.dbname = dbname;
        }
        if let Some(user) = lookup(env::USER) {
            info.user = user;
        }
        if let Some(password) = lookup(env::PASSWORD) {
            info.password = password;
        }
        Ok(info)
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the database name.
    #[must_use]
    pub fn dbname(mut self, dbname: impl Into<String>) -> Self {
        self.dbname = dbname.into();
        self
    }

    /// Set the user name.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Render as a libpq conninfo string, quoting values where needed.
    #[must_use]
    pub fn to_conninfo(&self) -> String {
        let mut out = format!(
            "host={} port={} dbname={} user={} password={}",
            quote(&self.host),
            self.port,
            quote(&self.dbname),
            quote(&self.user),
            quote(&self.password),
        );
        if let Some(name) = &self.application_name {
            out.push_str(" application_name=");
            out.push_str(&quote(name));
        }
        if let Some(timeout) = self.connect_timeout {
            out.push_str(&format!(" connect_timeout={}", timeout.as_secs().max(1)));
        }
        out
    }
}

fn quote(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\' || c == '=');
    if !needs_quotes {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

fn unquote(raw: &str) -> String {
    let Some(inner) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) else {
        return raw.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_conninfo_parsing() {
        let info =
            ConnInfo::parse("host=db.internal port=6432 dbname=app user=svc password=hunter2")
                .unwrap();

        assert_eq!(info.host, "db.internal");
        assert_eq!(info.port, 6432);
        assert_eq!(info.dbname, "app");
        assert_eq!(info.user, "svc");
        assert_eq!(info.password, "hunter2");
    }

    #[test]
    fn test_conninfo_quoted_values() {
        let info = ConnInfo::parse(r"user = 'o\'brien' password='a b\\c'").unwrap();

        assert_eq!(info.user, "o'brien");
        assert_eq!(info.password, r"a b\c");
        assert_eq!(info.host, "localhost");
    }

    #[test]
    fn test_conninfo_invalid_port() {
        let err = ConnInfo::parse("port=abc").unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }

    #[test]
    fn test_conninfo_rejects_garbage() {
        assert!(ConnInfo::parse("host=x ???").is_err());
    }

    #[test]
    fn test_conninfo_render_and_reparse() {
        let info = ConnInfo::new()
            .host("10.0.0.5")
            .dbname("orders")
            .user("writer")
            .password("it's a secret")
            .application_name("billing worker");

        let rendered = info.to_conninfo();
        assert!(rendered.contains(r"password='it\'s a secret'"));
        assert_eq!(ConnInfo::parse(&rendered).unwrap(), info);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("DB_HOST", "pg"),
            ("DB_PORT", "5433"),
            ("DB_NAME", "shop"),
            ("DB_USER", "u"),
        ]
        .into_iter()
        .collect();

        let info = ConnInfo::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(info.host, "pg");
        assert_eq!(info.port, 5433);
        assert_eq!(info.dbname, "shop");
        assert_eq!(info.user, "u");
        assert_eq!(info.password, "");
    }

    #[test]
    fn test_debug_redacts_password() {
        let info = ConnInfo::new().password("topsecret");
        let debug = format!("{info:?}");
        assert!(!debug.contains("topsecret"));
        assert!(debug.contains("REDACTED"));
    }
}

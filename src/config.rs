//! Process-wide connection configuration
//!
//! Loaded once at startup (usually from the environment) and validated before
//! the connection manager is built. Every later failure is a connection or
//! query error, never a configuration one.

use crate::connection::SslMode;
use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Port used when `port` is absent or not a number
pub const DEFAULT_PORT: u16 = 5432;

/// Delay before each reconnect attempt
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(1000);

/// Upper bound on the liveness probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Upper bound on TCP connect + TLS + startup + authentication
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// `application_name` reported to the server
pub const DEFAULT_APPLICATION_NAME: &str = "rds-iam-conn";

/// Environment variable names
pub mod keys {
    /// Database host
    pub const DB_ENDPOINT: &str = "dbEndpoint";
    /// AWS region of the database
    pub const REGION: &str = "region";
    /// Database user
    pub const USER_NAME: &str = "userName";
    /// Schema of the query target
    pub const SCHEMA: &str = "schema";
    /// Table of the query target
    pub const TABLE: &str = "table";
    /// Database name
    pub const DATABASE: &str = "database";
    /// Port
    pub const PORT: &str = "port";
    /// Static password
    pub const PASSWORD: &str = "password";
    /// `true` selects IAM token authentication
    pub const USE_TOKEN: &str = "useToken";
    /// Backoff before reconnecting, in milliseconds
    pub const BACKOFF_MILLIS: &str = "backoffMillis";
    /// Liveness probe timeout, in milliseconds
    pub const PROBE_TIMEOUT_MILLIS: &str = "probeTimeoutMillis";
    /// Connect timeout, in milliseconds
    pub const CONNECT_TIMEOUT_MILLIS: &str = "connectTimeoutMillis";
    /// `require`, `verify-ca` or `verify-full`
    pub const SSL_MODE: &str = "sslMode";
    /// PEM bundle of trusted CAs
    pub const SSL_ROOT_CERT: &str = "sslRootCert";
    /// Use SCRAM-SHA-256-PLUS when offered
    pub const CHANNEL_BINDING: &str = "channelBinding";
    /// `application_name`
    pub const APPLICATION_NAME: &str = "applicationName";
}

/// How the connection password is obtained
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Fixed secret from configuration
    Password(String),
    /// Fresh RDS IAM token per connection attempt
    IamToken,
}

impl AuthMode {
    /// Whether a credential provider is consulted
    pub fn uses_token(&self) -> bool {
        matches!(self, AuthMode::IamToken)
    }
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMode::IamToken => f.write_str("IamToken"),
        }
    }
}

/// Connection configuration
///
/// Construct with [`ConnectionConfig::from_env`], [`ConnectionConfig::from_lookup`]
/// or [`ConnectionConfig::builder`]; all three validate.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Database host (RDS instance or proxy endpoint)
    pub host: String,
    /// Port
    pub port: u16,
    /// AWS region, required for token authentication
    pub region: String,
    /// Database user
    pub username: String,
    /// Database name
    pub database: String,
    /// Schema of the query target
    pub schema: String,
    /// Table of the query target
    pub table: String,
    /// Password source
    pub auth: AuthMode,
    /// Delay before each reconnect attempt
    pub backoff: Duration,
    /// Liveness probe bound
    pub probe_timeout: Duration,
    /// Connect bound
    pub connect_timeout: Duration,
    /// TLS mode; never `Disable`
    pub sslmode: SslMode,
    /// PEM bundle of trusted CAs (e.g. the RDS CA bundle)
    pub ssl_root_cert: Option<PathBuf>,
    /// Prefer SCRAM-SHA-256-PLUS
    pub channel_binding: bool,
    /// `application_name`
    pub application_name: String,
}

impl ConnectionConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.log_summary();
        Ok(config)
    }

    /// Load from an arbitrary key lookup (same keys as [`Self::from_env`])
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).unwrap_or_default();

        let auth = if parse_bool(lookup(keys::USE_TOKEN).as_deref()) {
            AuthMode::IamToken
        } else {
            let password = lookup(keys::PASSWORD).ok_or_else(|| {
                Error::Config(format!(
                    "{} is required unless {} is true",
                    keys::PASSWORD,
                    keys::USE_TOKEN
                ))
            })?;
            AuthMode::Password(password)
        };

        let sslmode = match lookup(keys::SSL_MODE).filter(|v| !v.is_empty()) {
            Some(mode) => mode.parse()?,
            None => SslMode::Require,
        };

        let config = Self {
            host: text(keys::DB_ENDPOINT),
            port: resolve_port(lookup(keys::PORT).as_deref())?,
            region: text(keys::REGION),
            username: text(keys::USER_NAME),
            database: text(keys::DATABASE),
            schema: text(keys::SCHEMA),
            table: text(keys::TABLE),
            auth,
            backoff: parse_millis(keys::BACKOFF_MILLIS, lookup(keys::BACKOFF_MILLIS), DEFAULT_BACKOFF)?,
            probe_timeout: parse_millis(
                keys::PROBE_TIMEOUT_MILLIS,
                lookup(keys::PROBE_TIMEOUT_MILLIS),
                DEFAULT_PROBE_TIMEOUT,
            )?,
            connect_timeout: parse_millis(
                keys::CONNECT_TIMEOUT_MILLIS,
                lookup(keys::CONNECT_TIMEOUT_MILLIS),
                DEFAULT_CONNECT_TIMEOUT,
            )?,
            sslmode,
            ssl_root_cert: lookup(keys::SSL_ROOT_CERT)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            channel_binding: parse_bool(lookup(keys::CHANNEL_BINDING).as_deref()),
            application_name: lookup(keys::APPLICATION_NAME)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_APPLICATION_NAME.to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Builder for programmatic construction
    pub fn builder(
        host: impl Into<String>,
        username: impl Into<String>,
        database: impl Into<String>,
    ) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            config: Self {
                host: host.into(),
                port: DEFAULT_PORT,
                region: String::new(),
                username: username.into(),
                database: database.into(),
                schema: String::new(),
                table: String::new(),
                auth: AuthMode::Password(String::new()),
                backoff: DEFAULT_BACKOFF,
                probe_timeout: DEFAULT_PROBE_TIMEOUT,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                sslmode: SslMode::Require,
                ssl_root_cert: None,
                channel_binding: false,
                application_name: DEFAULT_APPLICATION_NAME.to_string(),
            },
        }
    }

    /// Check every invariant
    ///
    /// # Errors
    ///
    /// `Error::Config` naming the first offending value.
    pub fn validate(&self) -> Result<()> {
        require_non_empty(keys::DB_ENDPOINT, &self.host)?;
        require_non_empty(keys::USER_NAME, &self.username)?;
        require_non_empty(keys::DATABASE, &self.database)?;

        if self.port == 0 {
            return Err(Error::Config(format!("{} must be positive", keys::PORT)));
        }

        if self.auth.uses_token() && self.region.is_empty() {
            return Err(Error::Config(format!(
                "{} is required when {} is true",
                keys::REGION,
                keys::USE_TOKEN
            )));
        }

        require_identifier(keys::SCHEMA, &self.schema)?;
        require_identifier(keys::TABLE, &self.table)?;

        if self.sslmode == SslMode::Disable {
            return Err(Error::Config(format!(
                "{}=disable is not allowed: connections require TLS",
                keys::SSL_MODE
            )));
        }

        if self.probe_timeout.is_zero() {
            return Err(Error::Config(format!(
                "{} must be positive",
                keys::PROBE_TIMEOUT_MILLIS
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config(format!(
                "{} must be positive",
                keys::CONNECT_TIMEOUT_MILLIS
            )));
        }

        Ok(())
    }

    /// Log the resolved configuration (never the password)
    pub fn log_summary(&self) {
        tracing::info!(
            host = %self.host,
            port = self.port,
            region = %self.region,
            user = %self.username,
            database = %self.database,
            schema = %self.schema,
            table = %self.table,
            use_token = self.auth.uses_token(),
            sslmode = %self.sslmode,
            backoff_ms = self.backoff.as_millis() as u64,
            "loaded connection configuration"
        );
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the query target
    pub fn target(mut self, schema: impl Into<String>, table: impl Into<String>) -> Self {
        self.config.schema = schema.into();
        self.config.table = table.into();
        self
    }

    /// Authenticate with a static password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.auth = AuthMode::Password(password.into());
        self
    }

    /// Authenticate with RDS IAM tokens issued for `region`
    pub fn iam_token(mut self, region: impl Into<String>) -> Self {
        self.config.auth = AuthMode::IamToken;
        self.config.region = region.into();
        self
    }

    /// Set the reconnect backoff
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Set the liveness probe bound
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    /// Set the connect bound
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the TLS mode
    pub fn sslmode(mut self, mode: SslMode) -> Self {
        self.config.sslmode = mode;
        self
    }

    /// Trust the CAs in this PEM file
    pub fn ssl_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ssl_root_cert = Some(path.into());
        self
    }

    /// Prefer SCRAM-SHA-256-PLUS
    pub fn channel_binding(mut self, enabled: bool) -> Self {
        self.config.channel_binding = enabled;
        self
    }

    /// Set `application_name`
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = name.into();
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<ConnectionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Resolve the port, falling back to [`DEFAULT_PORT`] when absent or non-numeric
///
/// A numeric value outside `1..=65535` is a configuration error rather than a
/// silent fallback.
pub fn resolve_port(raw: Option<&str>) -> Result<u16> {
    let Some(raw) = raw else {
        tracing::warn!("{} is not set, using {}", keys::PORT, DEFAULT_PORT);
        return Ok(DEFAULT_PORT);
    };

    match raw.parse::<i64>() {
        Ok(port) => u16::try_from(port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| Error::Config(format!("{}={} is out of range", keys::PORT, port))),
        Err(_) => {
            tracing::warn!(
                "{}={:?} is not an integer, using {}",
                keys::PORT,
                raw,
                DEFAULT_PORT
            );
            Ok(DEFAULT_PORT)
        }
    }
}

/// `true` (any case) is true; anything else, including absence, is false
fn parse_bool(raw: Option<&str>) -> bool {
    raw.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn parse_millis(key: &str, raw: Option<String>, default: Duration) -> Result<Duration> {
    match raw.filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => v
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| Error::Config(format!("{}={:?} is not a number of milliseconds", key, v))),
    }
}

fn require_non_empty(key: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Config(format!("{} is required", key)));
    }
    Ok(())
}

/// Unquoted SQL identifier: `[A-Za-z_][A-Za-z0-9_$]*`
fn require_identifier(key: &str, value: &str) -> Result<()> {
    require_non_empty(key, value)?;
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if !(valid_start && valid_rest) {
        return Err(Error::Config(format!(
            "{}={:?} is not a valid SQL identifier",
            key, value
        )));
    }
    Ok(())
}

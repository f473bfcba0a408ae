//! Connection lifecycle manager
//!
//! [`ConnectionManager`] owns exactly one connection slot. Every call to
//! [`ConnectionManager::ensure_connection`] either returns a handle that
//! passed a liveness probe (or was just opened), or fails:
//!
//! ```text
//!   Empty ──▶ Refreshing ──▶ Live
//!               ▲   │          │
//!               │   ▼          │ probe failed
//!             Empty ◀──────────┘ (via Refreshing)
//! ```
//!
//! A refresh sleeps the backoff once, resolves the password (a fresh token
//! when IAM authentication is configured), and makes exactly one open attempt.

mod connector;
mod state;

pub use connector::PgConnector;
pub use state::SlotState;

use crate::auth::{CredentialProvider, RdsTokenProvider};
use crate::config::{AuthMode, ConnectionConfig};
use crate::connection::SslMode;
use crate::metrics::{counters, histograms, labels};
use crate::query::RowStream;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// An open database session
#[async_trait]
pub trait Session: Send {
    /// Whether the session answers a trivial query within `timeout`
    ///
    /// Must not fail; any problem is reported as `false`.
    async fn is_valid(&mut self, timeout: Duration) -> bool;

    /// Run `sql` and stream its rows
    async fn query<'a>(&'a mut self, sql: &str) -> Result<RowStream<'a>>;
}

/// Opens sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Session type produced
    type Session: Session;

    /// Make one attempt to open a session; no retry
    async fn open(&self, params: ConnectParams) -> Result<Self::Session>;
}

/// Everything needed for one open attempt
#[derive(Clone)]
pub struct ConnectParams {
    /// Host
    pub host: String,
    /// Port
    pub port: u16,
    /// Database name
    pub database: String,
    /// User
    pub user: String,
    /// Static password or freshly issued token
    pub password: String,
    /// TLS mode (never `Disable`)
    pub sslmode: SslMode,
    /// Upper bound on the whole attempt
    pub connect_timeout: Duration,
    /// `application_name`
    pub application_name: String,
    /// Prefer SCRAM-SHA-256-PLUS
    pub channel_binding: bool,
}

impl ConnectParams {
    /// Parameters for `config` authenticated with `password`
    pub fn from_config(config: &ConnectionConfig, password: String) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
            user: config.username.clone(),
            password,
            sslmode: config.sslmode,
            connect_timeout: config.connect_timeout,
            application_name: config.application_name.clone(),
            channel_binding: config.channel_binding,
        }
    }

    /// Connection URL without credentials
    pub fn url(&self) -> String {
        format!(
            "postgresql://{}:{}/{}?sslmode={}",
            self.host, self.port, self.database, self.sslmode
        )
    }
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("url", &self.url())
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

struct Slot<S> {
    state: SlotState,
    handle: Option<S>,
}

/// Guard over the live session; the slot stays locked while it is held
pub type SessionGuard<'a, S> = MappedMutexGuard<'a, S>;

/// Single-slot connection manager
pub struct ConnectionManager<C: Connector> {
    config: ConnectionConfig,
    connector: C,
    credentials: Arc<dyn CredentialProvider>,
    slot: Mutex<Slot<C::Session>>,
}

impl ConnectionManager<PgConnector> {
    /// Manager using the wire client and RDS tokens signed with
    /// environment credentials
    pub fn from_config(config: ConnectionConfig) -> Result<Self> {
        let connector = PgConnector::new(&config)?;
        Self::new(config, connector, Arc::new(RdsTokenProvider::from_env()))
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager with an empty slot
    ///
    /// # Errors
    ///
    /// `Error::Config` if `config` does not validate.
    pub fn new(
        config: ConnectionConfig,
        connector: C,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connector,
            credentials,
            slot: Mutex::new(Slot {
                state: SlotState::Empty,
                handle: None,
            }),
        })
    }

    /// Configuration this manager was built with
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current slot state (waits for any in-flight caller)
    pub async fn state(&self) -> SlotState {
        self.slot.lock().await.state
    }

    /// Return a live session, opening a new one if needed
    ///
    /// Equivalent to [`Self::ensure_connection_until`] with a token that is
    /// never cancelled.
    pub async fn ensure_connection(&self) -> Result<SessionGuard<'_, C::Session>> {
        self.ensure_connection_until(&CancellationToken::new()).await
    }

    /// Return a live session, opening a new one if needed
    ///
    /// # Errors
    ///
    /// * `Error::CredentialService` if a token could not be issued
    /// * `Error::ConnectionRefresh` if the open attempt failed or `cancel`
    ///   fired during the backoff or the attempt
    ///
    /// Either way the slot is left `Empty` and the next call starts over.
    pub async fn ensure_connection_until(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SessionGuard<'_, C::Session>> {
        let mut slot = self.slot.lock().await;

        // A caller dropped mid-refresh leaves this behind
        if slot.state == SlotState::Refreshing {
            tracing::debug!("previous refresh was abandoned");
            slot.state = SlotState::Empty;
        }

        if let Some(handle) = slot.handle.as_mut() {
            if handle.is_valid(self.config.probe_timeout).await {
                tracing::debug!("reusing live connection");
                counters::connection_reused();
                return live_session(slot);
            }
            tracing::warn!("liveness probe failed, replacing connection");
            counters::probe_failed();
            slot.handle = None;
        }

        slot.state.transition(SlotState::Refreshing)?;

        let span = tracing::info_span!(
            "refresh",
            host = %self.config.host,
            database = %self.config.database
        );
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.refresh().instrument(span) => result,
        };

        match attempt {
            Ok(handle) => {
                slot.handle = Some(handle);
                slot.state.transition(SlotState::Live)?;
                live_session(slot)
            }
            Err(cause) => {
                slot.state.transition(SlotState::Empty)?;
                let err = match cause {
                    e @ Error::CredentialService(_) => e,
                    e => Error::refresh(e),
                };
                counters::refresh_failed(err.cause().category());
                tracing::error!(error = %err, "connection refresh failed");
                Err(err)
            }
        }
    }

    /// Backoff, credential, one open attempt
    async fn refresh(&self) -> Result<C::Session> {
        tracing::info!(backoff = ?self.config.backoff, "opening new connection");
        tokio::time::sleep(self.config.backoff).await;

        let (password, credential) = match &self.config.auth {
            AuthMode::IamToken => {
                let token = self
                    .credentials
                    .generate_token(
                        &self.config.username,
                        &self.config.host,
                        &self.config.region,
                        self.config.port,
                    )
                    .await?;
                (token.into_string(), labels::CREDENTIAL_TOKEN)
            }
            AuthMode::Password(password) => (password.clone(), labels::CREDENTIAL_STATIC),
        };

        let params = ConnectParams::from_config(&self.config, password);
        tracing::debug!(url = %params.url(), credential, "connecting");

        let started = Instant::now();
        let session = self.connector.open(params).await?;
        histograms::connect_duration(started.elapsed().as_millis() as u64);
        counters::connection_opened(credential);
        tracing::info!(credential, "connection established");

        Ok(session)
    }
}

fn live_session<S>(slot: MutexGuard<'_, Slot<S>>) -> Result<SessionGuard<'_, S>> {
    MutexGuard::try_map(slot, |slot| slot.handle.as_mut()).map_err(|slot| Error::InvalidState {
        expected: "live handle".into(),
        actual: slot.state.to_string(),
    })
}

impl<C: Connector> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

//! Core connection type

use super::state::ConnectionState;
use super::tls::SslMode;
use super::transport::Transport;
use crate::auth::{ChannelBinding, ScramClient};
use crate::metrics::{counters, histograms, labels};
use crate::protocol::constants::sasl;
use crate::protocol::{
    decode_message, encode_message, is_incomplete, AuthenticationMessage, BackendMessage,
    FrontendMessage,
};
use crate::query::{Row, RowStream};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Per-session startup parameters
///
/// Unlike [`crate::ConnectionConfig`] this describes one wire session: the
/// password is whatever was resolved for this attempt (a static secret or a
/// freshly issued token).
#[derive(Clone)]
pub struct SessionConfig {
    /// Database name
    pub database: String,
    /// Username
    pub user: String,
    /// Password (cleartext or SCRAM)
    pub password: Option<String>,
    /// Additional startup parameters
    pub params: HashMap<String, String>,
    /// Application name for Postgres logs
    pub application_name: Option<String>,
    /// SSL/TLS mode
    pub sslmode: SslMode,
    /// Use SCRAM-SHA-256-PLUS when the server offers it over TLS
    pub channel_binding: bool,
}

impl SessionConfig {
    /// Configuration with no password and `sslmode=require`
    pub fn new(database: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            user: user.into(),
            password: None,
            params: HashMap::new(),
            application_name: None,
            sslmode: SslMode::default(),
            channel_binding: false,
        }
    }

    /// Create a builder
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = SessionConfig::builder("mydb", "app")
    ///     .password(token.into_string())
    ///     .application_name("reporting")
    ///     .sslmode(SslMode::VerifyFull)
    ///     .build();
    /// ```
    pub fn builder(database: impl Into<String>, user: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: Self::new(database, user),
        }
    }

    /// Set password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Add startup parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    fn startup_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("user".to_string(), self.user.clone()),
            ("database".to_string(), self.database.clone()),
            ("client_encoding".to_string(), "UTF8".to_string()),
        ];
        if let Some(app_name) = &self.application_name {
            params.push(("application_name".to_string(), app_name.clone()));
        }
        for (k, v) in &self.params {
            params.push((k.clone(), v.clone()));
        }
        params
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("params", &self.params)
            .field("application_name", &self.application_name)
            .field("sslmode", &self.sslmode)
            .field("channel_binding", &self.channel_binding)
            .finish()
    }
}

/// Builder for [`SessionConfig`]
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Set the password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Add a startup parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.params.insert(key.into(), value.into());
        self
    }

    /// Set application name for Postgres logs
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = Some(name.into());
        self
    }

    /// Set SSL/TLS mode
    pub fn sslmode(mut self, mode: SslMode) -> Self {
        self.config.sslmode = mode;
        self
    }

    /// Prefer SCRAM-SHA-256-PLUS
    pub fn channel_binding(mut self, enabled: bool) -> Self {
        self.config.channel_binding = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

/// Postgres connection
pub struct Connection {
    transport: Option<Transport>,
    state: ConnectionState,
    read_buf: BytesMut,
    process_id: Option<i32>,
    secret_key: Option<i32>,
    rows_read: u64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("process_id", &self.process_id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create connection from transport
    pub fn new(transport: Transport) -> Self {
        Self {
            transport: Some(transport),
            state: ConnectionState::Initial,
            read_buf: BytesMut::with_capacity(8192),
            process_id: None,
            secret_key: None,
            rows_read: 0,
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Server process ID, once startup has completed
    pub fn backend_pid(&self) -> Option<i32> {
        self.process_id
    }

    fn transport(&mut self) -> Result<&mut Transport> {
        self.transport.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Any failure mid-exchange leaves the byte stream in an unknown position
    fn mark_broken(&mut self) {
        if self.state.can_transition_to(ConnectionState::Broken) {
            self.state = ConnectionState::Broken;
        }
    }

    /// Negotiate TLS upgrade with the server via the SSLRequest protocol.
    ///
    /// Sends the 8-byte SSLRequest message and reads the server's single-byte
    /// response. `S` upgrades the transport; `N` is an error since every
    /// `sslmode` this crate accepts requires TLS.
    async fn negotiate_tls(
        &mut self,
        tls_config: &super::TlsConfig,
        hostname: &str,
        sslmode: SslMode,
    ) -> Result<()> {
        self.state.transition(ConnectionState::NegotiatingTls)?;

        self.send_message(&FrontendMessage::SslRequest).await?;

        while self.read_buf.is_empty() {
            let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
            let n = transport.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }

        let response = self.read_buf[0];
        self.read_buf.advance(1);

        match response {
            b'S' => {
                // Bytes after 'S' would have been injected before the handshake
                if !self.read_buf.is_empty() {
                    return Err(Error::Protocol(
                        "unexpected data received before TLS handshake".into(),
                    ));
                }
                tracing::debug!("server accepted TLS, upgrading connection");
                let transport = self.transport.take().ok_or(Error::ConnectionClosed)?;
                self.transport = Some(transport.upgrade_to_tls(tls_config, hostname).await?);
                tracing::debug!("TLS connection established");
                Ok(())
            }
            b'N' => Err(Error::Protocol(format!(
                "server does not support TLS (sslmode={})",
                sslmode
            ))),
            other => Err(Error::Protocol(format!(
                "unexpected SSLRequest response byte: 0x{:02X}",
                other
            ))),
        }
    }

    /// Perform TLS negotiation, startup and authentication
    pub async fn startup(
        &mut self,
        config: &SessionConfig,
        tls_config: Option<&super::TlsConfig>,
        hostname: Option<&str>,
    ) -> Result<()> {
        async {
            if config.sslmode != SslMode::Disable {
                let tls = tls_config.ok_or_else(|| {
                    Error::Config(format!(
                        "sslmode={} requires TlsConfig but none was provided",
                        config.sslmode
                    ))
                })?;
                let host = hostname
                    .ok_or_else(|| Error::Config("TLS negotiation requires a hostname".into()))?;
                self.negotiate_tls(tls, host, config.sslmode).await?;
            }

            self.state.transition(ConnectionState::AwaitingAuth)?;

            let startup = FrontendMessage::Startup {
                version: crate::protocol::constants::PROTOCOL_VERSION,
                params: config.startup_params(),
            };
            self.send_message(&startup).await?;

            self.state.transition(ConnectionState::Authenticating)?;
            self.authenticate(config).await?;

            self.state.transition(ConnectionState::Idle)?;
            tracing::info!(pid = ?self.process_id, "startup complete");
            Ok(())
        }
        .instrument(tracing::info_span!(
            "startup",
            user = %config.user,
            database = %config.database
        ))
        .await
    }

    /// Handle authentication until ReadyForQuery
    async fn authenticate(&mut self, config: &SessionConfig) -> Result<()> {
        let mut auth_mechanism = "none";

        loop {
            let msg = self.receive_message().await?;

            match msg {
                BackendMessage::Authentication(auth) => match auth {
                    AuthenticationMessage::Ok => {
                        tracing::debug!(mechanism = auth_mechanism, "authentication successful");
                        // ParameterStatus and BackendKeyData follow; keep reading
                    }
                    AuthenticationMessage::CleartextPassword => {
                        auth_mechanism = labels::MECHANISM_CLEARTEXT;
                        counters::auth_attempted(auth_mechanism);

                        let password = config
                            .password
                            .as_ref()
                            .ok_or_else(|| Error::Authentication("password required".into()))?;
                        self.send_message(&FrontendMessage::Password(password.clone()))
                            .await?;
                    }
                    AuthenticationMessage::Md5Password { .. } => {
                        return Err(Error::Authentication(
                            "MD5 authentication not supported. Use SCRAM-SHA-256 or IAM authentication".into(),
                        ));
                    }
                    AuthenticationMessage::Sasl { mechanisms } => {
                        auth_mechanism = self.handle_sasl(&mechanisms, config).await?;
                    }
                    AuthenticationMessage::SaslContinue { .. } => {
                        return Err(Error::Protocol(
                            "unexpected SaslContinue outside of SASL flow".into(),
                        ));
                    }
                    AuthenticationMessage::SaslFinal { .. } => {
                        return Err(Error::Protocol(
                            "unexpected SaslFinal outside of SASL flow".into(),
                        ));
                    }
                },
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.process_id = Some(process_id);
                    self.secret_key = Some(secret_key);
                }
                BackendMessage::ParameterStatus { name, value } => {
                    tracing::debug!("parameter status: {} = {}", name, value);
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!("notice during startup: {}", notice);
                }
                BackendMessage::ReadyForQuery { .. } => {
                    break;
                }
                BackendMessage::ErrorResponse(err) => {
                    let reason = if err.is_auth_failure() {
                        "rejected"
                    } else {
                        "server_error"
                    };
                    counters::auth_failed(auth_mechanism, reason);
                    return Err(Error::Authentication(err.to_string()));
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during auth: {}",
                        other.name()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Run a SCRAM exchange; returns the mechanism label used
    async fn handle_sasl(
        &mut self,
        mechanisms: &[String],
        config: &SessionConfig,
    ) -> Result<&'static str> {
        let password = config.password.as_ref().ok_or_else(|| {
            Error::Authentication("password required for SCRAM authentication".into())
        })?;

        let offers = |name: &str| mechanisms.iter().any(|m| m == name);
        let binding_data = match self.transport.as_ref() {
            Some(transport) if config.channel_binding && offers(sasl::SCRAM_SHA_256_PLUS) => {
                transport.channel_binding_data()
            }
            _ => None,
        };

        let (mut scram, label) = match binding_data {
            Some(data) => (
                ScramClient::with_channel_binding(
                    config.user.clone(),
                    password.clone(),
                    ChannelBinding::TlsServerEndPoint(data),
                ),
                labels::MECHANISM_SCRAM_PLUS,
            ),
            None if offers(sasl::SCRAM_SHA_256) => (
                ScramClient::new(config.user.clone(), password.clone()),
                labels::MECHANISM_SCRAM,
            ),
            None => {
                return Err(Error::Authentication(format!(
                    "server does not support SCRAM-SHA-256. Available: {}",
                    mechanisms.join(", ")
                )));
            }
        };

        counters::auth_attempted(label);
        tracing::debug!(mechanism = scram.mechanism(), "initiating SASL authentication");

        let msg = FrontendMessage::SaslInitialResponse {
            mechanism: scram.mechanism().to_string(),
            data: scram.client_first().into_bytes(),
        };
        self.send_message(&msg).await?;

        let server_first_data = match self.receive_message().await? {
            BackendMessage::Authentication(AuthenticationMessage::SaslContinue { data }) => data,
            BackendMessage::ErrorResponse(err) => {
                counters::auth_failed(label, "rejected");
                return Err(Error::Authentication(format!("SASL server error: {}", err)));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected SaslContinue during SASL authentication, got {}",
                    other.name()
                )));
            }
        };

        let server_first = String::from_utf8(server_first_data).map_err(|e| {
            Error::Authentication(format!("invalid UTF-8 in server first message: {}", e))
        })?;

        let (client_final, scram_state) = scram.client_final(&server_first).map_err(|e| {
            counters::auth_failed(label, "scram");
            Error::Authentication(format!("SCRAM error: {}", e))
        })?;

        self.send_message(&FrontendMessage::SaslResponse {
            data: client_final.into_bytes(),
        })
        .await?;

        let server_final_data = match self.receive_message().await? {
            BackendMessage::Authentication(AuthenticationMessage::SaslFinal { data }) => data,
            BackendMessage::ErrorResponse(err) => {
                counters::auth_failed(label, "rejected");
                return Err(Error::Authentication(format!("SASL server error: {}", err)));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected SaslFinal during SASL authentication, got {}",
                    other.name()
                )));
            }
        };

        let server_final = String::from_utf8(server_final_data).map_err(|e| {
            Error::Authentication(format!("invalid UTF-8 in server final message: {}", e))
        })?;

        scram
            .verify_server_final(&server_final, &scram_state)
            .map_err(|e| {
                counters::auth_failed(label, "server_proof");
                Error::Authentication(format!("SCRAM verification failed: {}", e))
            })?;

        Ok(label)
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(Error::ConnectionBusy(format!(
                "connection in state: {}",
                self.state
            )));
        }
        Ok(())
    }

    /// Execute a simple query and collect every backend message
    ///
    /// # Errors
    ///
    /// `Error::Sql` if the server answered with an ErrorResponse (the
    /// connection is idle again afterwards).
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<BackendMessage>> {
        self.drain_pending().await?;
        self.ensure_idle()?;

        self.state.transition(ConnectionState::QueryInProgress)?;
        self.send_message(&FrontendMessage::Query(query.to_string()))
            .await?;
        self.state.transition(ConnectionState::ReadingResults)?;

        let mut messages = Vec::new();
        let mut failure = None;

        loop {
            let msg = self.receive_message().await?;
            match msg {
                BackendMessage::ReadyForQuery { .. } => break,
                BackendMessage::ErrorResponse(ref err) if failure.is_none() => {
                    failure = Some(Error::Sql(err.to_string()));
                }
                _ => {}
            }
            messages.push(msg);
        }

        self.state.transition(ConnectionState::Idle)?;
        match failure {
            Some(err) => Err(err),
            None => Ok(messages),
        }
    }

    /// Run `sql` and stream its rows
    ///
    /// The stream borrows the connection. Dropping it early is allowed: the
    /// rest of the result is discarded before the connection's next use.
    pub async fn query(&mut self, sql: &str) -> Result<RowStream<'_>> {
        let started = Instant::now();

        self.drain_pending().await?;
        self.ensure_idle()?;

        self.state.transition(ConnectionState::QueryInProgress)?;
        self.send_message(&FrontendMessage::Query(sql.to_string()))
            .await?;

        let columns: Arc<[String]> = loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription(fields) => {
                    break fields.into_iter().map(|f| f.name).collect();
                }
                BackendMessage::ErrorResponse(err) => {
                    tracing::debug!("query failed: {}", err);
                    self.drain_until_ready().await?;
                    self.state.transition(ConnectionState::Idle)?;
                    counters::query_completed(labels::STATUS_ERROR);
                    return Err(Error::Sql(err.to_string()));
                }
                BackendMessage::CommandComplete(_) | BackendMessage::EmptyQueryResponse => {
                    self.drain_until_ready().await?;
                    self.state.transition(ConnectionState::Idle)?;
                    counters::query_completed(labels::STATUS_OK);
                    return Ok(RowStream::empty());
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!("notice: {}", notice);
                }
                BackendMessage::ParameterStatus { name, value } => {
                    tracing::debug!("parameter status: {} = {}", name, value);
                }
                other => {
                    self.mark_broken();
                    return Err(Error::Protocol(format!(
                        "unexpected message in query response: {}",
                        other.name()
                    )));
                }
            }
        };

        self.state.transition(ConnectionState::ReadingResults)?;
        self.rows_read = 0;
        histograms::query_startup_duration(started.elapsed().as_millis() as u64);

        let rows = stream::unfold(Some(self), {
            let columns = columns.clone();
            move |conn| {
                let columns = columns.clone();
                async move {
                    let conn = conn?;
                    match conn.next_row(&columns).await {
                        Ok(Some(row)) => Some((Ok(row), Some(conn))),
                        Ok(None) => None,
                        Err(e) => Some((Err(e), None)),
                    }
                }
            }
        });

        Ok(RowStream::new(columns, rows.boxed()))
    }

    /// Next data row of the current result, or `None` once ReadyForQuery arrives
    async fn next_row(&mut self, columns: &Arc<[String]>) -> Result<Option<Row>> {
        if self.state != ConnectionState::ReadingResults {
            return Ok(None);
        }

        loop {
            match self.receive_message().await? {
                BackendMessage::DataRow(values) => {
                    self.rows_read += 1;
                    return Ok(Some(Row::new(columns.clone(), values)));
                }
                BackendMessage::CommandComplete(tag) => {
                    tracing::debug!(rows = self.rows_read, "{}", tag);
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!("notice: {}", notice);
                }
                BackendMessage::ParameterStatus { .. } => {}
                BackendMessage::ReadyForQuery { .. } => {
                    self.state.transition(ConnectionState::Idle)?;
                    counters::query_completed(labels::STATUS_OK);
                    counters::rows_streamed(self.rows_read);
                    return Ok(None);
                }
                BackendMessage::ErrorResponse(err) => {
                    self.drain_until_ready().await?;
                    self.state.transition(ConnectionState::Idle)?;
                    counters::query_completed(labels::STATUS_ERROR);
                    return Err(Error::Sql(err.to_string()));
                }
                other => {
                    self.mark_broken();
                    return Err(Error::Protocol(format!(
                        "unexpected message while reading rows: {}",
                        other.name()
                    )));
                }
            }
        }
    }

    /// Discard what is left of an abandoned result
    async fn drain_pending(&mut self) -> Result<()> {
        if !self.state.has_pending_results() {
            return Ok(());
        }

        tracing::debug!(state = %self.state, "draining abandoned result");
        counters::query_completed(labels::STATUS_ABANDONED);
        self.drain_until_ready().await?;
        self.state.transition(ConnectionState::Idle)
    }

    async fn drain_until_ready(&mut self) -> Result<()> {
        loop {
            if let BackendMessage::ReadyForQuery { .. } = self.receive_message().await? {
                return Ok(());
            }
        }
    }

    /// Round trip `SELECT 1`
    pub async fn ping(&mut self) -> Result<()> {
        self.simple_query("SELECT 1").await.map(|_| ())
    }

    /// Whether the connection answers a trivial query within `timeout`
    ///
    /// Never fails: every problem, including the timeout, yields `false`.
    /// A probe cut short by the timeout leaves the connection broken.
    pub async fn is_valid(&mut self, timeout: Duration) -> bool {
        if !self.state.is_usable() {
            return false;
        }

        match tokio::time::timeout(timeout, self.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "liveness probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(?timeout, "liveness probe timed out");
                self.mark_broken();
                false
            }
        }
    }

    /// Send a frontend message
    async fn send_message(&mut self, msg: &FrontendMessage) -> Result<()> {
        let buf = encode_message(msg)?;
        let result = async {
            let transport = self.transport()?;
            transport.write_all(&buf).await?;
            transport.flush().await
        }
        .await;
        if result.is_err() {
            self.mark_broken();
        }
        result
    }

    /// Receive a backend message
    async fn receive_message(&mut self) -> Result<BackendMessage> {
        let result = self.read_message().await;
        if result.is_err() {
            self.mark_broken();
        }
        result
    }

    async fn read_message(&mut self) -> Result<BackendMessage> {
        loop {
            match decode_message(&mut self.read_buf) {
                Ok((msg, consumed)) => {
                    self.read_buf.advance(consumed);
                    return Ok(msg);
                }
                Err(e) if is_incomplete(&e) => {}
                Err(e) => return Err(Error::Protocol(e.to_string())),
            }

            let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
            let n = transport.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Send Terminate and close the socket
    pub async fn close(mut self) -> Result<()> {
        self.state.transition(ConnectionState::Closed)?;
        let _ = self.send_message(&FrontendMessage::Terminate).await;
        self.transport()?.shutdown().await?;
        Ok(())
    }
}

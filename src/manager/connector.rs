//! Postgres connector backed by [`Connection`]

use super::{ConnectParams, Connector, Session};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, SessionConfig, TlsConfig, Transport};
use crate::query::RowStream;
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::Instrument;

/// Opens TLS connections with the wire client
///
/// The rustls configuration is built once from `sslmode`/`sslRootCert` and
/// shared by every connection this connector opens.
#[derive(Debug, Clone)]
pub struct PgConnector {
    tls: TlsConfig,
}

impl PgConnector {
    /// Connector for `config`
    ///
    /// # Errors
    ///
    /// `Error::Config` if the trust anchors cannot be loaded or TLS is disabled.
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        let tls = TlsConfig::for_sslmode(config.sslmode, config.ssl_root_cert.as_deref())?
            .ok_or_else(|| Error::Config("connections require TLS".into()))?;
        Ok(Self { tls })
    }

    async fn connect(&self, params: &ConnectParams) -> Result<Connection> {
        let session = SessionConfig::builder(params.database.clone(), params.user.clone())
            .password(params.password.clone())
            .application_name(params.application_name.clone())
            .sslmode(params.sslmode)
            .channel_binding(params.channel_binding)
            .build();

        let transport = Transport::connect_tcp(&params.host, params.port).await?;
        let mut conn = Connection::new(transport);
        conn.startup(&session, Some(&self.tls), Some(&params.host))
            .await?;
        Ok(conn)
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Session = Connection;

    async fn open(&self, params: ConnectParams) -> Result<Connection> {
        let limit = params.connect_timeout;
        let span = tracing::info_span!("connect", host = %params.host, port = params.port);

        match tokio::time::timeout(limit, self.connect(&params).instrument(span)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit)),
        }
    }
}

#[async_trait]
impl Session for Connection {
    async fn is_valid(&mut self, timeout: Duration) -> bool {
        Connection::is_valid(self, timeout).await
    }

    async fn query<'a>(&'a mut self, sql: &str) -> Result<RowStream<'a>> {
        Connection::query(self, sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SslMode;
    use tokio::net::TcpListener;

    fn config() -> ConnectionConfig {
        ConnectionConfig::builder("127.0.0.1", "app", "app")
            .target("public", "users")
            .password("secret")
            .build()
            .unwrap()
    }

    fn params(port: u16, connect_timeout: Duration) -> ConnectParams {
        ConnectParams {
            host: "127.0.0.1".into(),
            port,
            database: "app".into(),
            user: "app".into(),
            password: "secret".into(),
            sslmode: SslMode::Require,
            connect_timeout,
            application_name: "test".into(),
            channel_binding: false,
        }
    }

    #[test]
    fn test_disable_is_rejected() {
        let mut config = config();
        config.sslmode = SslMode::Disable;
        assert!(matches!(PgConnector::new(&config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_server_refusing_tls_fails_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 8];
            socket.read_exact(&mut request).await.unwrap();
            socket.write_all(b"N").await.unwrap();
        });

        let connector = PgConnector::new(&config()).unwrap();
        let err = connector
            .open(params(port, Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("does not support TLS")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = PgConnector::new(&config()).unwrap();
        let err = connector
            .open(params(port, Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        drop(listener);
    }
}

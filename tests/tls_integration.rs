//! Integration tests for TLS modes
//!
//! These tests need a PostgreSQL server with TLS enabled. With a self-signed
//! certificate:
//!
//! ```bash
//! openssl req -x509 -newkey rsa:2048 -keyout /tmp/server.key -out /tmp/server.crt \
//!   -days 1 -nodes -subj "/CN=localhost" -addext "subjectAltName=DNS:localhost"
//!
//! export TLS_TEST_HOST=localhost TLS_TEST_PORT=5432
//! export TLS_TEST_USER=postgres TLS_TEST_PASSWORD=postgres TLS_TEST_DATABASE=postgres
//! export TLS_TEST_CERT_PATH=/tmp/server.crt
//!
//! cargo test --test tls_integration -- --ignored --nocapture
//! ```

use rds_iam_conn::connection::{Connection, ConnectionState, SslMode};
use rds_iam_conn::{
    AuthMode, ConnectParams, ConnectionConfig, Connector, Error, PgConnector, Session,
};
use std::env;
use std::time::Duration;

struct TlsTarget {
    host: String,
    port: u16,
    user: String,
    password: String,
    database: String,
    cert_path: Option<String>,
}

/// `None` when `TLS_TEST_HOST` is not set
fn target() -> Option<TlsTarget> {
    let host = env::var("TLS_TEST_HOST").ok()?;
    let var = |key: &str, default: &str| env::var(key).unwrap_or_else(|_| default.to_string());
    Some(TlsTarget {
        host,
        port: var("TLS_TEST_PORT", "5432").parse().ok()?,
        user: var("TLS_TEST_USER", "postgres"),
        password: var("TLS_TEST_PASSWORD", "postgres"),
        database: var("TLS_TEST_DATABASE", "postgres"),
        cert_path: env::var("TLS_TEST_CERT_PATH").ok(),
    })
}

fn config(t: &TlsTarget, host: &str, mode: SslMode, channel_binding: bool) -> ConnectionConfig {
    let mut builder = ConnectionConfig::builder(host, t.user.clone(), t.database.clone())
        .port(t.port)
        .target("public", "users")
        .password(t.password.clone())
        .sslmode(mode)
        .channel_binding(channel_binding);
    if let Some(path) = &t.cert_path {
        builder = builder.ssl_root_cert(path.clone());
    }
    builder.build().expect("config")
}

async fn open(config: &ConnectionConfig) -> rds_iam_conn::Result<Connection> {
    let password = match &config.auth {
        AuthMode::Password(p) => p.clone(),
        AuthMode::IamToken => unreachable!("password auth only"),
    };
    let connector = PgConnector::new(config)?;
    connector
        .open(ConnectParams::from_config(config, password))
        .await
}

#[tokio::test]
#[ignore] // Requires PostgreSQL with TLS enabled
async fn test_tls_require_accepts_self_signed() {
    let Some(t) = target() else {
        eprintln!("Skipping test: TLS_TEST_HOST not set");
        return;
    };

    let mut conn = open(&config(&t, &t.host, SslMode::Require, false))
        .await
        .expect("require should connect");
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert!(Session::is_valid(&mut conn, Duration::from_secs(1)).await);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL with TLS enabled and TLS_TEST_CERT_PATH
async fn test_tls_verify_full_with_custom_ca() {
    let Some(t) = target() else {
        eprintln!("Skipping test: TLS_TEST_HOST not set");
        return;
    };
    if t.cert_path.is_none() {
        eprintln!("Skipping test: TLS_TEST_CERT_PATH not set");
        return;
    }

    let conn = open(&config(&t, &t.host, SslMode::VerifyFull, false))
        .await
        .expect("verify-full should connect");
    conn.close().await.expect("close");
}

#[tokio::test]
#[ignore] // Requires PostgreSQL with TLS enabled and TLS_TEST_CERT_PATH
async fn test_tls_verify_ca_ignores_hostname() {
    let Some(t) = target() else {
        eprintln!("Skipping test: TLS_TEST_HOST not set");
        return;
    };
    if t.cert_path.is_none() {
        eprintln!("Skipping test: TLS_TEST_CERT_PATH not set");
        return;
    }

    // 127.0.0.1 is not in the certificate's names
    let conn = open(&config(&t, "127.0.0.1", SslMode::VerifyCa, false))
        .await
        .expect("verify-ca should connect by IP");
    conn.close().await.expect("close");

    let err = open(&config(&t, "127.0.0.1", SslMode::VerifyFull, false))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(ref m) if m.contains("TLS handshake failed")));
}

#[tokio::test]
#[ignore] // Requires PostgreSQL with TLS enabled
async fn test_tls_verify_full_rejects_unknown_ca() {
    let Some(t) = target() else {
        eprintln!("Skipping test: TLS_TEST_HOST not set");
        return;
    };

    // System roots only; a self-signed server certificate must be refused
    let mut config = config(&t, &t.host, SslMode::VerifyFull, false);
    config.ssl_root_cert = None;

    let err = open(&config).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
#[ignore] // Requires PostgreSQL with TLS enabled and scram-sha-256 in pg_hba.conf
async fn test_tls_scram_channel_binding() {
    let Some(t) = target() else {
        eprintln!("Skipping test: TLS_TEST_HOST not set");
        return;
    };

    let conn = open(&config(&t, &t.host, SslMode::Require, true))
        .await
        .expect("SCRAM-SHA-256-PLUS should authenticate");
    conn.close().await.expect("close");
}

//! Integration tests against a live Postgres
//!
//! These tests require a running Postgres instance with TLS enabled
//! (`ssl = on`) and password authentication. Connection settings come from
//! `PGHOST`, `PGPORT`, `PGUSER`, `PGPASSWORD` and `PGDATABASE`, defaulting to
//! `localhost:5432`, `postgres`/`postgres`.
//!
//! ```sh
//! cargo test --test integration -- --ignored
//! ```

use futures::TryStreamExt;
use rds_iam_conn::connection::{Connection, SessionConfig, SslMode, TlsConfig, Transport};
use rds_iam_conn::{run_query, ConnectionConfig, ConnectionManager, DataService, Row, SlotState};
use std::time::Duration;

const TABLE: &str = "rds_iam_conn_users";

struct Pg {
    host: String,
    port: u16,
    user: String,
    password: String,
    database: String,
}

fn pg() -> Pg {
    let var = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
    Pg {
        host: var("PGHOST", "localhost"),
        port: var("PGPORT", "5432").parse().expect("PGPORT"),
        user: var("PGUSER", "postgres"),
        password: var("PGPASSWORD", "postgres"),
        database: var("PGDATABASE", "postgres"),
    }
}

/// Create and fill `public.rds_iam_conn_users` through tokio-postgres
async fn seed(pg: &Pg) {
    let conn_str = format!(
        "host={} port={} user={} password={} dbname={}",
        pg.host, pg.port, pg.user, pg.password, pg.database
    );
    let (client, connection) = tokio_postgres::connect(&conn_str, tokio_postgres::NoTls)
        .await
        .expect("seed connect");
    tokio::spawn(connection);

    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS public.{table};
             CREATE TABLE public.{table} (id integer PRIMARY KEY, name text NOT NULL);
             INSERT INTO public.{table} VALUES (1, 'ada'), (2, 'grace'), (3, 'barbara');",
            table = TABLE
        ))
        .await
        .expect("seed");
}

fn config(pg: &Pg) -> ConnectionConfig {
    ConnectionConfig::builder(pg.host.clone(), pg.user.clone(), pg.database.clone())
        .port(pg.port)
        .target("public", TABLE)
        .password(pg.password.clone())
        .backoff(Duration::from_millis(100))
        .build()
        .expect("config")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rds_iam_conn=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_connect_and_query() {
    init_tracing();
    let pg = pg();

    let transport = Transport::connect_tcp(&pg.host, pg.port)
        .await
        .expect("connect");
    let mut conn = Connection::new(transport);

    let tls = TlsConfig::for_sslmode(SslMode::Require, None)
        .expect("tls")
        .expect("tls enabled");
    let session = SessionConfig::builder(pg.database.clone(), pg.user.clone())
        .password(pg.password.clone())
        .sslmode(SslMode::Require)
        .build();
    conn.startup(&session, Some(&tls), Some(&pg.host))
        .await
        .expect("startup");

    let messages = conn.simple_query("SELECT 1").await.expect("query");
    assert!(!messages.is_empty());
    assert!(conn.is_valid(Duration::from_secs(1)).await);

    conn.close().await.expect("close");
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_manager_reads_seeded_table() {
    init_tracing();
    let pg = pg();
    seed(&pg).await;

    let manager = ConnectionManager::from_config(config(&pg)).expect("manager");

    {
        let mut conn = manager.ensure_connection().await.expect("ensure");
        let rows: Vec<Row> = run_query(&mut *conn, "public", TABLE)
            .await
            .expect("query")
            .try_collect()
            .await
            .expect("rows");

        let names: Vec<_> = rows
            .iter()
            .map(|r| r.try_get("name").unwrap().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["ada", "grace", "barbara"]);
    }

    assert_eq!(manager.state().await, SlotState::Live);

    // Warm path: probe and reuse
    let mut conn = manager.ensure_connection().await.expect("reuse");
    let err = run_query(&mut *conn, "public", "rds_iam_conn_missing")
        .await
        .unwrap_err();
    assert!(matches!(err, rds_iam_conn::Error::QueryExecution { .. }));
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_abandoned_stream_then_get_data() {
    init_tracing();
    let pg = pg();
    seed(&pg).await;

    let service = DataService::new(ConnectionManager::from_config(config(&pg)).expect("manager"));

    {
        let mut conn = service.manager().ensure_connection().await.expect("ensure");
        let mut rows = run_query(&mut *conn, "public", TABLE).await.expect("query");
        let first = rows.try_next().await.expect("row").expect("some row");
        assert_eq!(first.try_get("id").unwrap(), Some("1"));
    }

    assert_eq!(service.get_data().await.expect("get_data"), 3);
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_wrong_password_is_refresh_error() {
    init_tracing();
    let pg = pg();

    let config = ConnectionConfig::builder(pg.host.clone(), pg.user.clone(), pg.database.clone())
        .port(pg.port)
        .target("public", TABLE)
        .password("definitely-not-the-password")
        .backoff(Duration::from_millis(10))
        .build()
        .expect("config");
    let manager = ConnectionManager::from_config(config).expect("manager");

    let err = manager.ensure_connection().await.unwrap_err();
    assert!(matches!(err.cause(), rds_iam_conn::Error::Authentication(_)));
    assert_eq!(manager.state().await, SlotState::Empty);
}

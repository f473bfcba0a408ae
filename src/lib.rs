//! Self-refreshing Postgres connection with RDS IAM authentication
//!
//! `rds-iam-conn` keeps one database connection per process and checks it
//! before every unit of work. A connection that fails its liveness probe is
//! replaced: after a fixed backoff a fresh credential is resolved (a newly
//! signed RDS IAM token, or a static password) and exactly one TLS connection
//! attempt is made.
//!
//! ```ignore
//! use rds_iam_conn::{ConnectionConfig, ConnectionManager, run_query};
//! use futures::TryStreamExt;
//!
//! let config = ConnectionConfig::from_env()?;
//! let manager = ConnectionManager::from_config(config)?;
//!
//! let mut conn = manager.ensure_connection().await?;
//! let rows: Vec<_> = run_query(&mut *conn, "public", "users").await?.try_collect().await?;
//! ```
//!
//! The crate carries its own minimal PostgreSQL v3 client (`connection`,
//! `protocol`) so that TLS, authentication and probing stay under its control.

#![warn(missing_docs)]

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod query;
pub mod service;

pub use auth::{AuthToken, CredentialProvider, RdsTokenProvider};
pub use config::{AuthMode, ConnectionConfig};
pub use error::{Error, Result};
pub use handler::UppercaseHandler;
pub use manager::{ConnectParams, ConnectionManager, Connector, PgConnector, Session, SlotState};
pub use query::{run_query, Row, RowStream};
pub use service::DataService;

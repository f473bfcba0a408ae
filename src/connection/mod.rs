//! Postgres wire connection
//!
//! This module handles:
//! * TCP transport with in-place TLS upgrade
//! * Connection lifecycle (TLS negotiation, startup, auth, queries)
//! * State machine enforcement
//! * `sslmode` to rustls verifier mapping

mod conn;
mod state;
mod tls;
mod transport;

pub use conn::{Connection, SessionConfig, SessionConfigBuilder};
pub use state::ConnectionState;
pub use tls::{parse_server_name, SslMode, TlsConfig, TlsConfigBuilder};
pub use transport::Transport;

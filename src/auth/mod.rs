//! Authentication
//!
//! * [`CredentialProvider`]: mints the short-lived password used for one
//!   connection attempt ([`RdsTokenProvider`] for RDS IAM authentication)
//! * [`ScramClient`]: SCRAM-SHA-256 exchange during the Postgres handshake

mod rds_token;
mod scram;

pub use rds_token::{presign_token, AwsCredentials, CredentialSource, RdsTokenProvider};
pub use scram::{ChannelBinding, ScramClient, ScramError, ScramState};

use crate::Result;
use async_trait::async_trait;

/// Short-lived credential used as the database password
///
/// Expiry is enforced by the issuing service, not tracked here. A token is
/// used for exactly one connection attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a token string
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the token
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Take the token string
    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Issues database authentication tokens
///
/// Implementations make at most one call to the token service per invocation
/// and never retry; retry policy belongs to the connection manager.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Mint a token for `username` connecting to `host:port` in `region`
    ///
    /// # Errors
    ///
    /// `Error::CredentialService` if the service is unreachable or refuses
    /// to issue a token.
    async fn generate_token(
        &self,
        username: &str,
        host: &str,
        region: &str,
        port: u16,
    ) -> Result<AuthToken>;
}

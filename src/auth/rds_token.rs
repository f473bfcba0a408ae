//! RDS IAM authentication tokens
//!
//! An RDS IAM token is an AWS Signature Version 4 presigned `connect` request
//! for `host:port`, valid for 15 minutes. The database verifies the signature
//! against IAM when the token is presented as the password.
//!
//! Signing credentials come from the AWS default credentials chain unless
//! configured otherwise: environment variables, shared config and credentials
//! files, web identity, ECS container credentials and EC2 instance metadata.

use super::{AuthToken, CredentialProvider};
use crate::{Error, Result};
use async_trait::async_trait;
use aws_config::default_provider::credentials::DefaultCredentialsChain;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::OnceCell;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime requested for each token, in seconds
pub const TOKEN_EXPIRY_SECS: u64 = 900;

const SERVICE: &str = "rds-db";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
/// SHA-256 of the empty payload
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// AWS access key pair, optionally with a session token
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    /// Long-term credentials
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Attach a session token (temporary credentials, e.g. an execution role)
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let access_key_id = non_empty("AWS_ACCESS_KEY_ID").ok_or_else(|| {
            Error::CredentialService("no AWS credentials: AWS_ACCESS_KEY_ID is not set".into())
        })?;
        let secret_access_key = non_empty("AWS_SECRET_ACCESS_KEY").ok_or_else(|| {
            Error::CredentialService("no AWS credentials: AWS_SECRET_ACCESS_KEY is not set".into())
        })?;

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: non_empty("AWS_SESSION_TOKEN"),
        })
    }

    /// Access key id
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }
}

impl From<&Credentials> for AwsCredentials {
    fn from(credentials: &Credentials) -> Self {
        Self {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().map(str::to_string),
        }
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where the signing credentials come from
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// AWS default credentials chain, built on first use
    DefaultChain(Arc<OnceCell<SharedCredentialsProvider>>),
    /// Any AWS SDK credentials provider
    Provider(SharedCredentialsProvider),
    /// Re-read `AWS_*` environment variables on every token request
    Environment,
    /// Fixed credentials
    Static(AwsCredentials),
}

/// [`CredentialProvider`] issuing RDS IAM authentication tokens
#[derive(Debug, Clone)]
pub struct RdsTokenProvider {
    source: CredentialSource,
}

impl RdsTokenProvider {
    /// Provider using the AWS default credentials chain
    pub fn from_env() -> Self {
        Self {
            source: CredentialSource::DefaultChain(Arc::new(OnceCell::new())),
        }
    }

    /// Provider reading only the `AWS_*` environment variables
    pub fn env_only() -> Self {
        Self {
            source: CredentialSource::Environment,
        }
    }

    /// Provider backed by an AWS SDK credentials provider
    pub fn with_provider(provider: impl ProvideCredentials + 'static) -> Self {
        Self {
            source: CredentialSource::Provider(SharedCredentialsProvider::new(provider)),
        }
    }

    /// Provider using fixed credentials
    pub fn with_credentials(credentials: AwsCredentials) -> Self {
        Self {
            source: CredentialSource::Static(credentials),
        }
    }

    /// Configured credential source
    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    async fn resolve_credentials(&self) -> Result<AwsCredentials> {
        match &self.source {
            CredentialSource::DefaultChain(chain) => {
                let provider = chain
                    .get_or_init(|| async {
                        SharedCredentialsProvider::new(DefaultCredentialsChain::builder().build().await)
                    })
                    .await;
                load_from(provider).await
            }
            CredentialSource::Provider(provider) => load_from(provider).await,
            CredentialSource::Environment => AwsCredentials::from_env(),
            CredentialSource::Static(credentials) => Ok(credentials.clone()),
        }
    }
}

async fn load_from(provider: &SharedCredentialsProvider) -> Result<AwsCredentials> {
    let credentials = provider
        .provide_credentials()
        .await
        .map_err(|e| Error::CredentialService(format!("no AWS credentials: {}", e)))?;
    Ok(AwsCredentials::from(&credentials))
}

impl Default for RdsTokenProvider {
    fn default() -> Self {
        Self::from_env()
    }
}

#[async_trait]
impl CredentialProvider for RdsTokenProvider {
    async fn generate_token(
        &self,
        username: &str,
        host: &str,
        region: &str,
        port: u16,
    ) -> Result<AuthToken> {
        let start = std::time::Instant::now();

        let result = match self.resolve_credentials().await {
            Ok(credentials) => presign_token(&credentials, username, host, region, port, Utc::now()),
            Err(e) => Err(e),
        };

        match result {
            Ok(token) => {
                crate::metrics::counters::token_issued();
                crate::metrics::histograms::token_duration(start.elapsed().as_millis() as u64);
                tracing::debug!(%username, %host, %region, port, "issued RDS IAM auth token");
                Ok(AuthToken::new(token))
            }
            Err(e) => {
                crate::metrics::counters::token_failed(e.category());
                tracing::warn!(%username, %host, %region, port, error = %e, "failed to issue RDS IAM auth token");
                Err(e)
            }
        }
    }
}

/// Build an RDS IAM token signed at `now`
///
/// The result has the shape
/// `<host>:<port>/?Action=connect&DBUser=<user>&X-Amz-...&X-Amz-Signature=<hex>`.
pub fn presign_token(
    credentials: &AwsCredentials,
    username: &str,
    host: &str,
    region: &str,
    port: u16,
    now: DateTime<Utc>,
) -> Result<String> {
    for (name, value) in [("username", username), ("host", host), ("region", region)] {
        if value.is_empty() {
            return Err(Error::CredentialService(format!(
                "cannot issue token: {} is empty",
                name
            )));
        }
    }

    let date = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let scope = format!("{}/{}/{}/aws4_request", date, region, SERVICE);
    let endpoint = format!("{}:{}", host, port);

    let mut params: Vec<(&str, String)> = vec![
        ("Action", "connect".to_string()),
        ("DBUser", username.to_string()),
        ("X-Amz-Algorithm", ALGORITHM.to_string()),
        (
            "X-Amz-Credential",
            format!("{}/{}", credentials.access_key_id, scope),
        ),
        ("X-Amz-Date", amz_date.clone()),
        ("X-Amz-Expires", TOKEN_EXPIRY_SECS.to_string()),
        ("X-Amz-SignedHeaders", "host".to_string()),
    ];
    if let Some(token) = &credentials.session_token {
        params.push(("X-Amz-Security-Token", token.clone()));
    }
    params.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_query = params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "GET\n/\n{}\nhost:{}\n\nhost\n{}",
        canonical_query, endpoint, EMPTY_PAYLOAD_SHA256
    );

    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac(
        format!("AWS4{}", credentials.secret_access_key).as_bytes(),
        date.as_bytes(),
    )?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, SERVICE.as_bytes())?;
    let k_signing = hmac(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes())?);

    Ok(format!(
        "{}/?{}&X-Amz-Signature={}",
        endpoint, canonical_query, signature
    ))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::CredentialService(format!("signing key error: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// SigV4 URI encoding: everything except unreserved characters is %XX-encoded
fn uri_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

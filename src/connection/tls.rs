//! TLS configuration for connections to RDS and other remote Postgres servers.
//!
//! `sslmode` maps onto certificate verification as follows:
//!
//! | mode          | chain verified | hostname verified |
//! |---------------|----------------|-------------------|
//! | `require`     | no             | no                |
//! | `verify-ca`   | yes            | no                |
//! | `verify-full` | yes            | yes               |
//!
//! Trust anchors come from `sslRootCert` when configured, otherwise from the
//! platform store, falling back to the Mozilla roots bundled in `webpki-roots`.

use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// SSL/TLS connection mode matching PostgreSQL `sslmode` parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SslMode {
    /// No TLS (plaintext connection); rejected by [`crate::ConnectionConfig`]
    Disable,
    /// TLS required, server certificate is not verified
    #[default]
    Require,
    /// TLS required, server certificate must chain to a trusted CA
    VerifyCa,
    /// TLS required, trusted chain and matching hostname
    VerifyFull,
}

impl SslMode {
    /// Whether this mode requires certificate verification (CA or full)
    pub fn requires_verification(&self) -> bool {
        matches!(self, Self::VerifyCa | Self::VerifyFull)
    }
}

impl std::fmt::Display for SslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disable => write!(f, "disable"),
            Self::Require => write!(f, "require"),
            Self::VerifyCa => write!(f, "verify-ca"),
            Self::VerifyFull => write!(f, "verify-full"),
        }
    }
}

impl std::str::FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "disable" => Ok(Self::Disable),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            _ => Err(Error::Config(format!(
                "invalid sslmode '{}': expected disable, require, verify-ca, or verify-full",
                s
            ))),
        }
    }
}

/// Compiled TLS client settings
///
/// Building loads certificates from disk, so build once and share.
#[derive(Clone)]
pub struct TlsConfig {
    ca_cert_path: Option<PathBuf>,
    verify_hostname: bool,
    danger_accept_invalid_certs: bool,
    client_config: Arc<ClientConfig>,
}

impl TlsConfig {
    /// Create a new TLS configuration builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// TLS settings for `mode`, or `None` for `disable`
    pub fn for_sslmode(mode: SslMode, ca_cert_path: Option<&Path>) -> Result<Option<Self>> {
        let builder = match mode {
            SslMode::Disable => return Ok(None),
            SslMode::Require => TlsConfig::builder().danger_accept_invalid_certs(true),
            SslMode::VerifyCa => TlsConfig::builder().verify_hostname(false),
            SslMode::VerifyFull => TlsConfig::builder().verify_hostname(true),
        };
        let builder = match ca_cert_path {
            Some(path) => builder.ca_cert_path(path),
            None => builder,
        };
        builder.build().map(Some)
    }

    /// Get the rustls ClientConfig for this TLS configuration.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Check if hostname verification is enabled.
    pub fn verify_hostname(&self) -> bool {
        self.verify_hostname
    }

    /// Check if certificate verification is disabled.
    pub fn danger_accept_invalid_certs(&self) -> bool {
        self.danger_accept_invalid_certs
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_cert_path", &self.ca_cert_path)
            .field("verify_hostname", &self.verify_hostname)
            .field(
                "danger_accept_invalid_certs",
                &self.danger_accept_invalid_certs,
            )
            .field("client_config", &"<ClientConfig>")
            .finish()
    }
}

/// Builder for TLS configuration.
pub struct TlsConfigBuilder {
    ca_cert_path: Option<PathBuf>,
    verify_hostname: bool,
    danger_accept_invalid_certs: bool,
}

impl Default for TlsConfigBuilder {
    fn default() -> Self {
        Self {
            ca_cert_path: None,
            verify_hostname: true,
            danger_accept_invalid_certs: false,
        }
    }
}

impl TlsConfigBuilder {
    /// Trust only the CAs in this PEM file instead of the system roots.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// Enable or disable hostname verification (default: enabled).
    ///
    /// Disabled, the chain is still verified against the trust anchors.
    pub fn verify_hostname(mut self, verify: bool) -> Self {
        self.verify_hostname = verify;
        self
    }

    /// ⚠️ **DANGER**: accept any server certificate.
    ///
    /// The connection is encrypted but not authenticated. This is what
    /// `sslmode=require` means.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.danger_accept_invalid_certs = accept;
        self
    }

    /// Build the TLS configuration.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the CA file cannot be read or holds no certificates,
    /// or if no trust anchors can be found at all.
    pub fn build(self) -> Result<TlsConfig> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let verifier: Arc<dyn ServerCertVerifier> = if self.danger_accept_invalid_certs {
            Arc::new(AcceptAnyServerCert {
                provider: provider.clone(),
            })
        } else {
            let roots = match &self.ca_cert_path {
                Some(path) => load_custom_ca(path)?,
                None => load_system_roots(),
            };
            let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| Error::Config(format!("invalid TLS trust anchors: {}", e)))?;
            if self.verify_hostname {
                webpki
            } else {
                Arc::new(ChainOnlyVerifier { inner: webpki })
            }
        };

        let client_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Config(format!("TLS provider setup failed: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        Ok(TlsConfig {
            ca_cert_path: self.ca_cert_path,
            verify_hostname: self.verify_hostname && !self.danger_accept_invalid_certs,
            danger_accept_invalid_certs: self.danger_accept_invalid_certs,
            client_config: Arc::new(client_config),
        })
    }
}

/// System roots, or the bundled Mozilla roots when the platform has none
fn load_system_roots() -> RootCertStore {
    let result = rustls_native_certs::load_native_certs();

    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(result.certs);
    if ignored > 0 || !result.errors.is_empty() {
        tracing::debug!(
            added,
            ignored,
            errors = result.errors.len(),
            "some system root certificates could not be loaded"
        );
    }

    if store.is_empty() {
        tracing::warn!("no system root certificates found, using bundled webpki roots");
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    store
}

/// Load trust anchors from a PEM file (e.g. the RDS global bundle)
fn load_custom_ca(ca_path: &Path) -> Result<RootCertStore> {
    let ca_cert_data = fs::read(ca_path).map_err(|e| {
        Error::Config(format!(
            "Failed to read CA certificate file '{}': {}",
            ca_path.display(),
            e
        ))
    })?;

    let mut reader = std::io::Cursor::new(&ca_cert_data);
    let mut root_store = RootCertStore::empty();

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => {
                let _ = root_store.add_parsable_certificates(std::iter::once(cert));
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Config(format!(
                    "Failed to parse CA certificate from '{}'",
                    ca_path.display()
                )));
            }
        }
    }

    if root_store.is_empty() {
        return Err(Error::Config(format!(
            "No valid certificates found in '{}'",
            ca_path.display()
        )));
    }

    Ok(root_store)
}

/// `sslmode=require`: encrypt without authenticating the server
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// `sslmode=verify-ca`: full chain verification, name mismatch tolerated
#[derive(Debug)]
struct ChainOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Parse a hostname or IP address for TLS SNI
///
/// A trailing dot is removed.
///
/// # Errors
///
/// `Error::Config` if `hostname` is neither a DNS name nor an IP address.
pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>> {
    let hostname = hostname.trim_end_matches('.');

    if hostname.is_empty() || hostname.len() > 253 {
        return Err(Error::Config(format!(
            "Invalid hostname for TLS: '{}'",
            hostname
        )));
    }

    ServerName::try_from(hostname.to_string())
        .map_err(|_| Error::Config(format!("Invalid hostname for TLS: '{}'", hostname)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_config_builder_defaults() {
        let tls = TlsConfigBuilder::default();
        assert!(!tls.danger_accept_invalid_certs);
        assert!(tls.verify_hostname);
        assert!(tls.ca_cert_path.is_none());
    }

    #[test]
    fn test_for_sslmode() {
        assert!(TlsConfig::for_sslmode(SslMode::Disable, None)
            .unwrap()
            .is_none());

        let require = TlsConfig::for_sslmode(SslMode::Require, None)
            .unwrap()
            .unwrap();
        assert!(require.danger_accept_invalid_certs());
        assert!(!require.verify_hostname());

        let verify_ca = TlsConfig::for_sslmode(SslMode::VerifyCa, None)
            .unwrap()
            .unwrap();
        assert!(!verify_ca.danger_accept_invalid_certs());
        assert!(!verify_ca.verify_hostname());

        let verify_full = TlsConfig::for_sslmode(SslMode::VerifyFull, None)
            .unwrap()
            .unwrap();
        assert!(!verify_full.danger_accept_invalid_certs());
        assert!(verify_full.verify_hostname());
    }

    #[test]
    fn test_missing_ca_file() {
        let result = TlsConfig::builder()
            .ca_cert_path("/nonexistent/rds-global-bundle.pem")
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let path = std::env::temp_dir().join(format!("rds-iam-conn-empty-{}.pem", std::process::id()));
        fs::write(&path, b"not a certificate\n").unwrap();

        let result = TlsConfig::builder().ca_cert_path(&path).build();
        let _ = fs::remove_file(&path);

        let err = result.unwrap_err();
        assert!(err.to_string().contains("No valid certificates"));
    }

    #[test]
    fn test_parse_server_name() {
        assert!(parse_server_name("localhost").is_ok());
        assert!(parse_server_name("mydb.abc123.us-east-1.rds.amazonaws.com").is_ok());
        assert!(parse_server_name("example.com.").is_ok());
        assert!(matches!(
            parse_server_name("10.0.0.12").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(parse_server_name("").is_err());
        assert!(parse_server_name("bad host").is_err());
    }

    #[test]
    fn test_ssl_mode_from_str() {
        assert_eq!("disable".parse::<SslMode>().unwrap(), SslMode::Disable);
        assert_eq!("require".parse::<SslMode>().unwrap(), SslMode::Require);
        assert_eq!("verify-ca".parse::<SslMode>().unwrap(), SslMode::VerifyCa);
        assert_eq!(
            "verify-full".parse::<SslMode>().unwrap(),
            SslMode::VerifyFull
        );
        assert!("prefer".parse::<SslMode>().is_err());
    }

    #[test]
    fn test_ssl_mode_display_round_trips() {
        for mode in [
            SslMode::Disable,
            SslMode::Require,
            SslMode::VerifyCa,
            SslMode::VerifyFull,
        ] {
            assert_eq!(mode.to_string().parse::<SslMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_ssl_mode_default_is_require() {
        assert_eq!(SslMode::default(), SslMode::Require);
        assert!(!SslMode::Require.requires_verification());
        assert!(SslMode::VerifyCa.requires_verification());
    }
}

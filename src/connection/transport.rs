//! TCP transport with in-place TLS upgrade

use crate::connection::TlsConfig;
use crate::{Error, Result};
use bytes::BytesMut;
use sha2::Digest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Socket carrying the Postgres protocol
pub enum Transport {
    /// Before (or without) TLS
    Plain(TcpStream),
    /// After a successful SSLRequest + handshake
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain(TcpStream)"),
            Transport::Tls(_) => f.write_str("Transport::Tls(TlsStream)"),
        }
    }
}

impl Transport {
    /// Open a TCP connection with Nagle disabled
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Transport::Plain(stream))
    }

    /// Whether TLS is active
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Write all bytes
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.write_all(buf).await?,
            Transport::Tls(stream) => stream.write_all(buf).await?,
        }
        Ok(())
    }

    /// Flush
    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush().await?,
            Transport::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    /// Read into buffer; `Ok(0)` means the peer closed
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = match self {
            Transport::Plain(stream) => stream.read_buf(buf).await?,
            Transport::Tls(stream) => stream.read_buf(buf).await?,
        };
        Ok(n)
    }

    /// Upgrade a plain transport to TLS after the server accepted SSLRequest
    ///
    /// `hostname` is sent as SNI and, under `verify-full`, matched against the
    /// certificate.
    pub async fn upgrade_to_tls(self, tls_config: &TlsConfig, hostname: &str) -> Result<Self> {
        match self {
            Transport::Plain(tcp_stream) => {
                let server_name = crate::connection::parse_server_name(hostname)?;
                let connector = tokio_rustls::TlsConnector::from(tls_config.client_config());
                let tls_stream = connector
                    .connect(server_name, tcp_stream)
                    .await
                    .map_err(|e| Error::Protocol(format!("TLS handshake failed: {}", e)))?;

                Ok(Transport::Tls(Box::new(tls_stream)))
            }
            Transport::Tls(_) => Err(Error::Protocol(
                "transport is already TLS-encrypted".into(),
            )),
        }
    }

    /// Shut down the write half
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.shutdown().await?,
            Transport::Tls(stream) => stream.shutdown().await?,
        }
        Ok(())
    }

    /// `tls-server-end-point` binding data: SHA-256 of the server's leaf certificate
    ///
    /// `None` on a plain transport.
    pub fn channel_binding_data(&self) -> Option<Vec<u8>> {
        match self {
            Transport::Plain(_) => None,
            Transport::Tls(stream) => {
                let (_tcp, conn) = stream.get_ref();
                let server_cert = conn.peer_certificates()?.first()?;
                Some(sha2::Sha256::digest(server_cert.as_ref()).to_vec())
            }
        }
    }
}

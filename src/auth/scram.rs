//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677) as used by Postgres 10+
//!
//! Used when the server asks for SASL instead of a cleartext password, which
//! is the case for static-password logins on most managed Postgres servers.
//! Over TLS the `-PLUS` variant binds the exchange to the server certificate
//! (`tls-server-end-point`).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Upper bound on the server-chosen PBKDF2 iteration count (Postgres uses 4096)
const MAX_ITERATIONS: u32 = 1_000_000;

/// SCRAM exchange failures
#[derive(Debug, Clone, Error)]
pub enum ScramError {
    /// Server signature did not verify
    #[error("invalid server proof: {0}")]
    InvalidServerProof(String),
    /// Server message was malformed
    #[error("invalid server message: {0}")]
    InvalidServerMessage(String),
    /// Base64 field could not be decoded
    #[error("base64 error: {0}")]
    Base64Error(String),
    /// HMAC could not be keyed
    #[error("crypto error: {0}")]
    Crypto(String),
}

/// Channel binding for the exchange
#[derive(Clone, Debug)]
pub enum ChannelBinding {
    /// No channel binding
    None,
    /// tls-server-end-point: SHA-256 hash of the server's DER-encoded certificate
    TlsServerEndPoint(Vec<u8>),
}

/// State carried from the client-final step to server verification
#[derive(Clone, Debug)]
pub struct ScramState {
    auth_message: Vec<u8>,
    server_key: Vec<u8>,
}

/// SCRAM-SHA-256 client
pub struct ScramClient {
    username: String,
    password: String,
    nonce: String,
    channel_binding: ChannelBinding,
}

impl ScramClient {
    /// Client without channel binding
    pub fn new(username: String, password: String) -> Self {
        Self::with_channel_binding(username, password, ChannelBinding::None)
    }

    /// Client with channel binding
    pub fn with_channel_binding(
        username: String,
        password: String,
        channel_binding: ChannelBinding,
    ) -> Self {
        let mut rng = rand::thread_rng();
        let nonce_bytes: Vec<u8> = (0..24).map(|_| rng.gen()).collect();
        let nonce = BASE64.encode(&nonce_bytes);

        Self {
            username,
            password,
            nonce,
            channel_binding,
        }
    }

    /// SASL mechanism name matching the channel binding
    pub fn mechanism(&self) -> &'static str {
        match self.channel_binding {
            ChannelBinding::None => crate::protocol::constants::sasl::SCRAM_SHA_256,
            ChannelBinding::TlsServerEndPoint(_) => {
                crate::protocol::constants::sasl::SCRAM_SHA_256_PLUS
            }
        }
    }

    /// GS2 header, including the empty authzid
    fn gs2_header(&self) -> &'static str {
        match self.channel_binding {
            ChannelBinding::None => "n,,",
            ChannelBinding::TlsServerEndPoint(_) => "p=tls-server-end-point,,",
        }
    }

    /// `n=<user>,r=<nonce>`
    ///
    /// Postgres ignores the SCRAM user name in favour of the startup user, but
    /// it must still be a valid saslname.
    fn client_first_bare(&self) -> String {
        format!("n={},r={}", escape_saslname(&self.username), self.nonce)
    }

    /// Client first message
    pub fn client_first(&self) -> String {
        format!("{}{}", self.gs2_header(), self.client_first_bare())
    }

    /// Process the server first message and build the client final message
    ///
    /// Returns (client_final_message, state for [`Self::verify_server_final`])
    pub fn client_final(&mut self, server_first: &str) -> Result<(String, ScramState), ScramError> {
        let (server_nonce, salt, iterations) = parse_server_first(server_first)?;

        if !server_nonce.starts_with(&self.nonce) || server_nonce.len() == self.nonce.len() {
            return Err(ScramError::InvalidServerMessage(
                "server nonce does not extend client nonce".to_string(),
            ));
        }

        let salt_bytes = BASE64
            .decode(&salt)
            .map_err(|_| ScramError::Base64Error("invalid salt encoding".to_string()))?;
        let iterations = iterations
            .parse::<u32>()
            .ok()
            .filter(|i| (1..=MAX_ITERATIONS).contains(i))
            .ok_or_else(|| {
                ScramError::InvalidServerMessage(format!(
                    "iteration count must be in 1..={}",
                    MAX_ITERATIONS
                ))
            })?;

        // c = base64(gs2-header [+ channel-binding-data])
        let mut cbind_input = self.gs2_header().as_bytes().to_vec();
        if let ChannelBinding::TlsServerEndPoint(data) = &self.channel_binding {
            cbind_input.extend_from_slice(data);
        }
        let client_final_without_proof =
            format!("c={},r={}", BASE64.encode(&cbind_input), server_nonce);

        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let salted_password = salted_password(&self.password, &salt_bytes, iterations)?;
        let proof = client_proof(&salted_password, auth_message.as_bytes())?;
        let server_key = hmac(&salted_password, b"Server Key")?;

        let client_final = format!("{},p={}", client_final_without_proof, BASE64.encode(proof));

        let state = ScramState {
            auth_message: auth_message.into_bytes(),
            server_key,
        };

        Ok((client_final, state))
    }

    /// Verify the server final message (`v=<signature>`)
    pub fn verify_server_final(
        &self,
        server_final: &str,
        state: &ScramState,
    ) -> Result<(), ScramError> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::InvalidServerProof(format!(
                "server reported error: {}",
                err
            )));
        }

        let server_sig_encoded = server_final
            .strip_prefix("v=")
            .ok_or_else(|| ScramError::InvalidServerMessage("missing 'v=' prefix".to_string()))?;

        let server_signature = BASE64.decode(server_sig_encoded).map_err(|_| {
            ScramError::Base64Error("invalid server signature encoding".to_string())
        })?;

        let expected_signature = hmac(&state.server_key, &state.auth_message)?;

        if constant_time_compare(&server_signature, &expected_signature) {
            Ok(())
        } else {
            Err(ScramError::InvalidServerProof(
                "server signature verification failed".to_string(),
            ))
        }
    }
}

/// Escape `,` and `=` as required for saslname
fn escape_saslname(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// Parse `r=<nonce>,s=<salt>,i=<iterations>` (order-insensitive, extensions ignored)
fn parse_server_first(msg: &str) -> Result<(String, String, String), ScramError> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in msg.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value);
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(value);
        } else if let Some(value) = part.strip_prefix("i=") {
            iterations = Some(value);
        }
    }

    match (nonce, salt, iterations) {
        (Some(r), Some(s), Some(i)) if !r.is_empty() && !s.is_empty() && !i.is_empty() => {
            Ok((r.to_string(), s.to_string(), i.to_string()))
        }
        _ => Err(ScramError::InvalidServerMessage(
            "missing required fields in server first message".to_string(),
        )),
    }
}

/// SaltedPassword := PBKDF2(password, salt, iterations, HMAC-SHA256)
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut out = [0u8; 32];
    pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut out)
        .map_err(|e| ScramError::Crypto(format!("PBKDF2 error: {}", e)))?;
    Ok(out)
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ScramError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ScramError::Crypto(format!("HMAC key error: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// ClientProof := ClientKey XOR HMAC(SHA256(ClientKey), AuthMessage)
fn client_proof(salted_password: &[u8], auth_message: &[u8]) -> Result<Vec<u8>, ScramError> {
    let client_key = hmac(salted_password, b"Client Key")?;
    let stored_key = Sha256::digest(&client_key);
    let client_signature = hmac(&stored_key, auth_message)?;

    Ok(client_key
        .iter()
        .zip(client_signature.iter())
        .map(|(k, s)| k ^ s)
        .collect())
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_first_for(client: &ScramClient) -> String {
        format!(
            "r={}srv,s={},i=4096",
            client.nonce,
            BASE64.encode(b"salty")
        )
    }

    #[test]
    fn test_client_first_message_format() {
        let client = ScramClient::new("app".to_string(), "secret".to_string());
        let first = client.client_first();
        assert!(first.starts_with("n,,n=app,r="));
        assert_eq!(client.mechanism(), "SCRAM-SHA-256");
    }

    #[test]
    fn test_client_first_with_channel_binding() {
        let client = ScramClient::with_channel_binding(
            "app".to_string(),
            "secret".to_string(),
            ChannelBinding::TlsServerEndPoint(vec![1, 2, 3]),
        );
        assert!(client
            .client_first()
            .starts_with("p=tls-server-end-point,,n=app,r="));
        assert_eq!(client.mechanism(), "SCRAM-SHA-256-PLUS");
    }

    #[test]
    fn test_username_is_escaped() {
        let client = ScramClient::new("a=b,c".to_string(), "pw".to_string());
        assert!(client.client_first().starts_with("n,,n=a=3Db=2Cc,r="));
    }

    #[test]
    fn test_client_final_without_binding_uses_biws() {
        let mut client = ScramClient::new("app".to_string(), "secret".to_string());
        let server_first = server_first_for(&client);
        let (client_final, _) = client.client_final(&server_first).unwrap();
        // base64("n,,") == "biws"
        assert!(client_final.starts_with("c=biws,r="));
        assert!(client_final.contains(",p="));
    }

    #[test]
    fn test_client_final_with_channel_binding() {
        let mut client = ScramClient::with_channel_binding(
            "app".to_string(),
            "secret".to_string(),
            ChannelBinding::TlsServerEndPoint(vec![0xAB; 32]),
        );
        let server_first = server_first_for(&client);
        let (client_final, _) = client.client_final(&server_first).unwrap();

        let c_value = client_final
            .split(',')
            .find_map(|s| s.strip_prefix("c="))
            .unwrap();
        let decoded = BASE64.decode(c_value).unwrap();
        let mut expected = b"p=tls-server-end-point,,".to_vec();
        expected.extend_from_slice(&[0xAB; 32]);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_client_final_nonce_prefix_mismatch() {
        let mut client = ScramClient::new("app".to_string(), "secret".to_string());
        let server_first = format!("r=someoneelse,s={},i=4096", BASE64.encode(b"salty"));
        assert!(matches!(
            client.client_final(&server_first),
            Err(ScramError::InvalidServerMessage(_))
        ));
    }

    #[test]
    fn test_client_final_nonce_not_extended() {
        let mut client = ScramClient::new("app".to_string(), "secret".to_string());
        let server_first = format!("r={},s={},i=4096", client.nonce, BASE64.encode(b"salty"));
        assert!(client.client_final(&server_first).is_err());
    }

    #[test]
    fn test_client_final_zero_iterations() {
        let mut client = ScramClient::new("app".to_string(), "secret".to_string());
        let server_first = format!("r={}srv,s={},i=0", client.nonce, BASE64.encode(b"salty"));
        assert!(client.client_final(&server_first).is_err());
    }

    #[test]
    fn test_client_final_rejects_excessive_iterations() {
        let mut client = ScramClient::new("app".to_string(), "secret".to_string());
        let server_first = format!(
            "r={}srv,s={},i=4294967295",
            client.nonce,
            BASE64.encode(b"salty")
        );
        match client.client_final(&server_first) {
            Err(ScramError::InvalidServerMessage(msg)) => assert!(msg.contains("iteration")),
            other => panic!("expected InvalidServerMessage, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_client_final_rejects_one_past_iteration_cap() {
        let mut client = ScramClient::new("app".to_string(), "secret".to_string());
        let server_first = format!(
            "r={}srv,s={},i={}",
            client.nonce,
            BASE64.encode(b"salty"),
            MAX_ITERATIONS + 1
        );
        assert!(client.client_final(&server_first).is_err());
    }

    #[test]
    fn test_client_final_invalid_base64_salt() {
        let mut client = ScramClient::new("app".to_string(), "secret".to_string());
        let server_first = format!("r={}srv,s=!!!,i=4096", client.nonce);
        assert!(matches!(
            client.client_final(&server_first),
            Err(ScramError::Base64Error(_))
        ));
    }

    #[test]
    fn test_parse_server_first_any_order() {
        let (r, s, i) = parse_server_first("i=4096,s=c2FsdA==,r=abc,x=ext").unwrap();
        assert_eq!(r, "abc");
        assert_eq!(s, "c2FsdA==");
        assert_eq!(i, "4096");
    }

    #[test]
    fn test_parse_server_first_missing_fields() {
        assert!(parse_server_first("r=abc,s=c2FsdA==").is_err());
        assert!(parse_server_first("").is_err());
        assert!(parse_server_first("r=,s=,i=").is_err());
    }

    #[test]
    fn test_verify_server_final_correct_signature() {
        let mut client = ScramClient::new("app".to_string(), "secret".to_string());
        let server_first = server_first_for(&client);
        let (_, state) = client.client_final(&server_first).unwrap();

        let expected = hmac(&state.server_key, &state.auth_message).unwrap();
        let server_final = format!("v={}", BASE64.encode(expected));
        assert!(client.verify_server_final(&server_final, &state).is_ok());
    }

    #[test]
    fn test_verify_server_final_wrong_signature() {
        let mut client = ScramClient::new("app".to_string(), "secret".to_string());
        let server_first = server_first_for(&client);
        let (_, state) = client.client_final(&server_first).unwrap();

        let server_final = format!("v={}", BASE64.encode([0u8; 32]));
        assert!(matches!(
            client.verify_server_final(&server_final, &state),
            Err(ScramError::InvalidServerProof(_))
        ));
    }

    #[test]
    fn test_verify_server_final_server_error() {
        let mut client = ScramClient::new("app".to_string(), "secret".to_string());
        let server_first = server_first_for(&client);
        let (_, state) = client.client_final(&server_first).unwrap();

        let err = client
            .verify_server_final("e=invalid-proof", &state)
            .unwrap_err();
        assert!(err.to_string().contains("invalid-proof"));
    }

    #[test]
    fn test_client_proof_is_deterministic() {
        let salted = salted_password("pencil", b"salt", 4096).unwrap();
        let a = client_proof(&salted, b"auth").unwrap();
        let b = client_proof(&salted, b"auth").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(&[], &[]));
        assert!(!constant_time_compare(&[], &[1]));
        let a = vec![0b1010_1010; 32];
        let mut b = a.clone();
        b[15] ^= 1;
        assert!(!constant_time_compare(&a, &b));
    }
}

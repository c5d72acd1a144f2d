//! SCRAM-SHA-256 client exchange (RFC 5802, RFC 7677)
//!
//! The default authentication method on modern PostgreSQL. The password is
//! never sent; client and server exchange proofs derived from a salted,
//! iterated hash, and the server's final message proves it knew the password
//! too.
//!
//! Channel binding is not offered (`n,,` - the replication session runs
//! without TLS), so the gs2 header is fixed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const GS2_HEADER: &str = "n,,";
/// base64("n,,"), sent back in the channel-binding attribute
const GS2_HEADER_B64: &str = "biws";
const CLIENT_NONCE_LEN: usize = 24;

/// SCRAM exchange errors
#[derive(Error, Debug)]
pub enum ScramError {
    #[error("malformed server message: {0}")]
    Malformed(String),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server rejected authentication: {0}")]
    Rejected(String),
    #[error("server signature verification failed")]
    ServerSignature,
    #[error("exchange steps called out of order")]
    OutOfOrder,
}

/// Client side of one SCRAM-SHA-256 exchange.
pub struct ScramExchange {
    username: String,
    password: String,
    nonce: String,
    client_first_bare: Option<String>,
    salted_password: Option<[u8; 32]>,
    auth_message: Option<String>,
}

impl ScramExchange {
    /// Start an exchange with a fresh random nonce.
    pub fn new(username: &str, password: &str) -> Self {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CLIENT_NONCE_LEN)
            .map(char::from)
            .collect();
        Self::with_nonce(username, password, nonce)
    }

    fn with_nonce(username: &str, password: &str, nonce: String) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            nonce,
            client_first_bare: None,
            salted_password: None,
            auth_message: None,
        }
    }

    /// The client-first message, to send as the SASL initial response.
    pub fn client_first_message(&mut self) -> String {
        let bare = format!("n={},r={}", saslname(&self.username), self.nonce);
        let message = format!("{GS2_HEADER}{bare}");
        self.client_first_bare = Some(bare);
        message
    }

    /// Consume the server-first message and produce the client-final message.
    pub fn client_final_message(&mut self, server_first: &[u8]) -> Result<String, ScramError> {
        let client_first_bare = self
            .client_first_bare
            .clone()
            .ok_or(ScramError::OutOfOrder)?;
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| ScramError::Malformed("server-first is not UTF-8".into()))?;

        let combined_nonce = attribute(server_first, 'r')
            .ok_or_else(|| ScramError::Malformed("missing nonce".into()))?;
        if !combined_nonce.starts_with(&self.nonce) || combined_nonce.len() <= self.nonce.len() {
            return Err(ScramError::NonceMismatch);
        }
        let salt = attribute(server_first, 's')
            .ok_or_else(|| ScramError::Malformed("missing salt".into()))?;
        let salt = BASE64
            .decode(salt)
            .map_err(|_| ScramError::Malformed("salt is not base64".into()))?;
        let iterations: u32 = attribute(server_first, 'i')
            .and_then(|i| i.parse().ok())
            .filter(|&i| i > 0)
            .ok_or_else(|| ScramError::Malformed("bad iteration count".into()))?;

        let salted_password = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={GS2_HEADER_B64},r={combined_nonce}");
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        self.salted_password = Some(salted_password);
        self.auth_message = Some(auth_message);
        Ok(format!("{without_proof},p={}", BASE64.encode(proof)))
    }

    /// Verify the server-final message: mutual authentication.
    pub fn verify_server_final(&self, server_final: &[u8]) -> Result<(), ScramError> {
        let salted_password = self.salted_password.ok_or(ScramError::OutOfOrder)?;
        let auth_message = self.auth_message.as_ref().ok_or(ScramError::OutOfOrder)?;
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| ScramError::Malformed("server-final is not UTF-8".into()))?;

        if let Some(error) = attribute(server_final, 'e') {
            return Err(ScramError::Rejected(error.to_string()));
        }
        let verifier = attribute(server_final, 'v')
            .ok_or_else(|| ScramError::Malformed("missing verifier".into()))?;

        let server_key = hmac(&salted_password, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());
        if BASE64.encode(server_signature) != verifier {
            return Err(ScramError::ServerSignature);
        }
        Ok(())
    }
}

/// Find a `k=value` attribute in a comma-separated SCRAM message.
fn attribute(message: &str, key: char) -> Option<&str> {
    message.split(',').find_map(|part| {
        let mut chars = part.chars();
        (chars.next() == Some(key) && chars.next() == Some('=')).then(|| &part[2..])
    })
}

/// Escape a username per RFC 5802 saslname rules.
fn saslname(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// `Hi(str, salt, i)`: PBKDF2-HMAC-SHA-256 with a one-block output.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac(password, &block);
    let mut result = u;
    for _ in 1..iterations {
        u = hmac(password, &u);
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }
    result
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC keys of any length are valid, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

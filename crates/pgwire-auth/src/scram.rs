//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677) without channel binding.
//!
//! The exchange runs in three steps:
//!
//! 1. [`ScramSha256::client_first`] produces the `SASLInitialResponse` payload.
//! 2. [`ScramSha256::parse_server_first`] validates the server challenge;
//!    the caller derives the salted password with [`salted_password`] and
//!    passes it to [`ScramSha256::client_final`].
//! 3. [`ScramSha256::verify_server_final`] checks the server signature.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};

use crate::error::AuthError;

/// SASL mechanism name.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

const NONCE_LEN: usize = 24;
// "n,," : no channel binding, no authzid.
const GS2_HEADER: &str = "n,,";

type HmacSha256 = Hmac<Sha256>;

/// Parsed `server-first-message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFirst {
    /// Combined client and server nonce.
    pub nonce: String,
    /// Decoded salt.
    pub salt: Vec<u8>,
    /// PBKDF2 iteration count.
    pub iterations: u32,
    raw: String,
}

/// Client side of one SCRAM-SHA-256 exchange.
pub struct ScramSha256 {
    client_first_bare: String,
    client_nonce: String,
    auth_message: Option<String>,
    server_key: Option<[u8; 32]>,
}

impl ScramSha256 {
    /// Start an exchange with a random nonce.
    ///
    /// PostgreSQL ignores the SCRAM user name in favor of the startup user,
    /// so it is sent empty.
    #[must_use]
    pub fn new() -> Self {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        Self::with_nonce("", nonce)
    }

    /// Start an exchange with a fixed user name and nonce.
    pub fn with_nonce(user: &str, nonce: impl Into<String>) -> Self {
        let client_nonce = nonce.into();
        let client_first_bare = format!("n={},r={}", escape_username(user), client_nonce);
        Self {
            client_first_bare,
            client_nonce,
            auth_message: None,
            server_key: None,
        }
    }

    /// The `client-first-message` payload.
    #[must_use]
    pub fn client_first(&self) -> Vec<u8> {
        format!("{GS2_HEADER}{}", self.client_first_bare).into_bytes()
    }

    /// Parse and validate the `server-first-message`.
    pub fn parse_server_first(&self, data: &[u8]) -> Result<ServerFirst, AuthError> {
        let raw = std::str::from_utf8(data)
            .map_err(|_| AuthError::InvalidServerMessage("not UTF-8".into()))?;

        if let Some(err) = raw.strip_prefix("e=") {
            return Err(AuthError::ServerError(err.to_string()));
        }

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in raw.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v.to_string()),
                Some(("s", v)) => {
                    salt = Some(STANDARD.decode(v).map_err(|_| {
                        AuthError::InvalidServerMessage("salt is not valid base64".into())
                    })?);
                }
                Some(("i", v)) => {
                    iterations = Some(v.parse::<u32>().map_err(|_| {
                        AuthError::InvalidServerMessage(format!("invalid iteration count: {v}"))
                    })?);
                }
                Some(("m", _)) => {
                    return Err(AuthError::InvalidServerMessage(
                        "unsupported mandatory extension".into(),
                    ));
                }
                _ => {}
            }
        }

        let nonce = nonce.ok_or_else(|| AuthError::InvalidServerMessage("missing nonce".into()))?;
        let salt = salt.ok_or_else(|| AuthError::InvalidServerMessage("missing salt".into()))?;
        let iterations = iterations
            .filter(|&i| i > 0)
            .ok_or_else(|| AuthError::InvalidServerMessage("missing iteration count".into()))?;

        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(AuthError::NonceMismatch);
        }

        Ok(ServerFirst {
            nonce,
            salt,
            iterations,
            raw: raw.to_string(),
        })
    }

    /// Build the `client-final-message` from a validated challenge and the
    /// salted password derived from it.
    pub fn client_final(
        &mut self,
        server_first: &ServerFirst,
        salted: &[u8; 32],
    ) -> Result<Vec<u8>, AuthError> {
        let channel_binding = STANDARD.encode(GS2_HEADER);
        let without_proof = format!("c={channel_binding},r={}", server_first.nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first.raw, without_proof
        );

        let client_key = hmac(salted, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);
        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        self.server_key = Some(hmac(salted, b"Server Key")?);
        self.auth_message = Some(auth_message);

        tracing::trace!(iterations = server_first.iterations, "computed SCRAM client proof");

        Ok(format!("{without_proof},p={}", STANDARD.encode(proof)).into_bytes())
    }

    /// Verify the `server-final-message` signature.
    pub fn verify_server_final(&self, data: &[u8]) -> Result<(), AuthError> {
        let raw = std::str::from_utf8(data)
            .map_err(|_| AuthError::InvalidServerMessage("not UTF-8".into()))?;
        if let Some(err) = raw.strip_prefix("e=") {
            return Err(AuthError::ServerError(err.to_string()));
        }
        let verifier = raw
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or_else(|| AuthError::InvalidServerMessage("missing verifier".into()))?;
        let signature = STANDARD
            .decode(verifier)
            .map_err(|_| AuthError::InvalidServerMessage("verifier is not valid base64".into()))?;

        let (Some(server_key), Some(auth_message)) = (&self.server_key, &self.auth_message) else {
            return Err(AuthError::InvalidServerMessage(
                "server-final received before client-final".into(),
            ));
        };

        let mut mac = HmacSha256::new_from_slice(server_key)
            .map_err(|e| AuthError::InvalidServerMessage(e.to_string()))?;
        mac.update(auth_message.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::ServerSignatureMismatch)
    }
}

impl Default for ScramSha256 {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScramSha256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramSha256")
            .field("client_nonce", &self.client_nonce)
            .field("completed", &self.auth_message.is_some())
            .finish()
    }
}

/// `Hi()` from RFC 5802: PBKDF2 with HMAC-SHA-256, single output block.
///
/// This is CPU-bound (one HMAC per iteration) and should not run on an
/// async worker thread for large iteration counts.
pub fn salted_password(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], AuthError> {
    let prf = HmacSha256::new_from_slice(password.as_bytes())
        .map_err(|e| AuthError::InvalidServerMessage(e.to_string()))?;

    let mut mac = prf.clone();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&u);

    for _ in 1..iterations {
        let mut mac = prf.clone();
        mac.update(&u);
        u = mac.finalize().into_bytes();
        for (o, b) in out.iter_mut().zip(u.iter()) {
            *o ^= b;
        }
    }
    Ok(out)
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32], AuthError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AuthError::InvalidServerMessage(e.to_string()))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn escape_username(user: &str) -> String {
    user.replace('=', "=3D").replace(',', "=2C")
}

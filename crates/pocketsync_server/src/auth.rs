//! Connection authentication.
//!
//! Tokens ride the WebSocket URL as a `token` query parameter and are
//! checked before the protocol handshake. A token names a user, a mint
//! time, and an HMAC-SHA256 signature over both:
//!
//! ```text
//! <user_id>.<millis>.<hex(hmac_sha256(secret, "<user_id>.<millis>"))>
//! ```
//!
//! A connection that fails validation is closed with code 4001 before
//! any protocol message is exchanged.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// The authenticated identity behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// User the token was minted for.
    pub user_id: String,
}

/// Validates connection tokens.
///
/// Returns the principal for a valid token, or `None` when the server
/// runs without authentication.
pub trait Authenticator: Send + Sync {
    /// Authenticates a connection from its token, if any.
    fn authenticate(&self, token: Option<&str>) -> ServerResult<Option<Principal>>;
}

/// Accepts every connection without a principal. The development and
/// test default.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _token: Option<&str>) -> ServerResult<Option<Principal>> {
        Ok(None)
    }
}

/// HMAC-SHA256 token validator.
#[derive(Clone)]
pub struct TokenValidator {
    secret: Vec<u8>,
    token_expiry: Duration,
}

impl TokenValidator {
    /// Creates a validator with a 24 hour token expiry.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Mints a token for a user at the current time.
    pub fn create_token(&self, user_id: &str) -> ServerResult<String> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let body = format!("{user_id}.{millis}");
        let signature = self.sign(body.as_bytes())?;
        Ok(format!("{body}.{}", hex_encode(&signature)))
    }

    fn sign(&self, data: &[u8]) -> ServerResult<[u8; 32]> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ServerError::AuthenticationFailed(e.to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    fn validate(&self, token: &str) -> ServerResult<Principal> {
        let (body, signature_hex) = token
            .rsplit_once('.')
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed token".into()))?;
        let (user_id, millis_str) = body
            .rsplit_once('.')
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed token".into()))?;
        let millis: u64 = millis_str
            .parse()
            .map_err(|_| ServerError::AuthenticationFailed("malformed timestamp".into()))?;

        let signature = hex_decode(signature_hex)
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed signature".into()))?;
        let expected = self.sign(body.as_bytes())?;
        if signature != expected {
            return Err(ServerError::AuthenticationFailed("invalid signature".into()));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let expiry_millis = self.token_expiry.as_millis() as u64;
        if now > millis.saturating_add(expiry_millis) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }

        Ok(Principal {
            user_id: user_id.to_string(),
        })
    }
}

impl Authenticator for TokenValidator {
    fn authenticate(&self, token: Option<&str>) -> ServerResult<Option<Principal>> {
        let token =
            token.ok_or_else(|| ServerError::AuthenticationFailed("missing token".into()))?;
        self.validate(token).map(Some)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}

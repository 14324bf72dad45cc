//! Signed connection targets for the upstream feed

use rand::Rng;
use rand::distr::Alphanumeric;
use sha2::{Digest, Sha256};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::{IngestError, Result};

pub const NONCE_LEN: usize = 16;

/// Header announcing the authentication scheme.
pub const AUTH_TYPE_HEADER: &str = "X-Auth-Type";
pub const AUTH_TYPE_SIGN: &str = "sign";

/// Lowercase hex SHA-256 over `timestamp_appId_nonce_secret`.
pub fn sign(timestamp_ms: u64, app_id: &str, nonce: &str, secret: &str) -> String {
    let digest = Sha256::digest(format!("{timestamp_ms}_{app_id}_{nonce}_{secret}").as_bytes());
    format!("{digest:x}")
}

/// Random alphanumeric nonce.
pub fn generate_nonce() -> String {
    rand::rng().sample_iter(&Alphanumeric).take(NONCE_LEN).map(char::from).collect()
}

/// Fully signed websocket target. Built fresh for every connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTarget {
    pub url: String,
    pub timestamp_ms: u64,
    pub nonce: String,
    pub sign: String,
}

impl SignedTarget {
    pub fn build(base_url: &str, app_id: &str, secret: &str, timestamp_ms: u64) -> Self {
        Self::with_nonce(base_url, app_id, secret, timestamp_ms, generate_nonce())
    }

    pub fn with_nonce(
        base_url: &str,
        app_id: &str,
        secret: &str,
        timestamp_ms: u64,
        nonce: String,
    ) -> Self {
        let sign = sign(timestamp_ms, app_id, &nonce, secret);
        let separator = if base_url.contains('?') { '&' } else { '?' };
        let url = format!(
            "{base_url}{separator}timestamp={timestamp_ms}&nonce={}&appId={}&sign={sign}",
            encode_component(&nonce),
            encode_component(app_id),
        );
        Self { url, timestamp_ms, nonce, sign }
    }

    /// Handshake request carrying the auth-type header.
    pub fn request(&self) -> Result<Request> {
        let mut request = self.url.as_str().into_client_request().map_err(|e| {
            IngestError::connection_failed_with_source("invalid upstream url", Box::new(e))
        })?;
        request
            .headers_mut()
            .insert(AUTH_TYPE_HEADER, HeaderValue::from_static(AUTH_TYPE_SIGN));
        Ok(request)
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

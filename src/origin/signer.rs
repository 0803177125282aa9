//! Per-request authentication headers for the NetStorage origin.
//!
//! Every request carries a signing string built from a fixed auth-data
//! version, the current Unix time, a fresh random 32-bit nonce and the key
//! name, followed by the resource path and the action header line. The
//! origin rejects signatures outside a short validity window, so headers are
//! produced fresh for every request and never cached.

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng as _;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Action used for streamed object reads.
pub const DOWNLOAD_ACTION: &str = "version=1&action=download";

pub const HEADER_ACTION: &str = "X-Akamai-ACS-Action";
pub const HEADER_AUTH_DATA: &str = "X-Akamai-ACS-Auth-Data";
pub const HEADER_AUTH_SIGN: &str = "X-Akamai-ACS-Auth-Sign";

/// Auth-data version 5 is HMAC-SHA256.
const AUTH_DATA_VERSION: u8 = 5;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signing key name is empty")]
    MissingKeyName,

    #[error("signing key is empty")]
    MissingKey,

    #[error("signing key rejected: {0}")]
    InvalidKey(String),
}

/// The three headers attached to one origin request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub action: String,
    pub auth_data: String,
    pub auth_sign: String,
}

impl SignedHeaders {
    pub fn pairs(&self) -> [(&'static str, &str); 3] {
        [
            (HEADER_ACTION, self.action.as_str()),
            (HEADER_AUTH_DATA, self.auth_data.as_str()),
            (HEADER_AUTH_SIGN, self.auth_sign.as_str()),
        ]
    }
}

#[derive(Clone)]
pub struct RequestSigner {
    key_name: String,
    mac: HmacSha256,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl RequestSigner {
    pub fn new(key_name: impl Into<String>, key: impl AsRef<[u8]>) -> Result<Self, SignerError> {
        let key_name = key_name.into();
        if key_name.trim().is_empty() {
            return Err(SignerError::MissingKeyName);
        }
        let key = key.as_ref();
        if key.is_empty() {
            return Err(SignerError::MissingKey);
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self { key_name, mac })
    }

    /// Headers for a download of `path`.
    pub fn sign(&self, path: &str) -> SignedHeaders {
        self.sign_action(path, DOWNLOAD_ACTION)
    }

    /// Headers for an arbitrary action (`list`, `dir`, ...) on `path`.
    pub fn sign_action(&self, path: &str, action: &str) -> SignedHeaders {
        let timestamp = chrono::Utc::now().timestamp();
        let nonce: u32 = rand::thread_rng().gen();
        self.sign_with(path, action, timestamp, nonce)
    }

    pub(crate) fn sign_with(
        &self,
        path: &str,
        action: &str,
        timestamp: i64,
        nonce: u32,
    ) -> SignedHeaders {
        let auth_data = format!(
            "{}, 0.0.0.0, 0.0.0.0, {}, {}, {}",
            AUTH_DATA_VERSION, timestamp, nonce, self.key_name
        );
        let sign_string = format!("{}\nx-akamai-acs-action:{}\n", path, action);

        let mut mac = self.mac.clone();
        mac.update(auth_data.as_bytes());
        mac.update(sign_string.as_bytes());
        let auth_sign =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        SignedHeaders {
            action: action.to_string(),
            auth_data,
            auth_sign,
        }
    }
}

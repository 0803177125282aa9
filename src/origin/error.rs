use thiserror::Error;

/// Failures talking to the origin store.
///
/// `is_retryable()` separates transient conditions (throttling, server
/// errors, dropped connections, truncated XML) from permanent ones such as a
/// missing object or a rejected signature.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("origin returned HTTP {status} for {path}")]
    HttpStatus { status: u16, path: String },

    #[error("origin request for {path} failed: {source}")]
    Http {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("malformed {action} response for {path}: {reason}")]
    Malformed {
        action: &'static str,
        path: String,
        reason: String,
    },

    #[error("invalid origin URL: {0}")]
    Url(#[from] url::ParseError),
}

impl OriginError {
    pub fn is_retryable(&self) -> bool {
        match self {
            OriginError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            OriginError::Http { .. } => true,
            OriginError::Malformed { .. } => true,
            OriginError::Url(_) => false,
        }
    }
}

use thiserror::Error;

use crate::destination::DestinationError;
use crate::origin::OriginError;

/// Why one transfer attempt failed.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("reading {path}: {source}")]
    Origin {
        path: String,
        #[source]
        source: OriginError,
    },

    #[error("writing {key}: {source}")]
    Destination {
        key: String,
        #[source]
        source: DestinationError,
    },

    #[error("transfer of {path} exceeded {secs}s")]
    Timeout { path: String, secs: u64 },

    #[error("{0}")]
    Layout(String),

    #[error("transfer task panicked: {0}")]
    Panicked(String),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Origin { source, .. } => source.is_retryable(),
            TransferError::Destination { source, .. } => source.is_retryable(),
            TransferError::Timeout { .. } => true,
            TransferError::Layout(_) => false,
            TransferError::Panicked(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_404_is_permanent() {
        let e = TransferError::Origin {
            path: "/r/v1/a_1.mp4".into(),
            source: OriginError::HttpStatus {
                status: 404,
                path: "/r/v1/a_1.mp4".into(),
            },
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_origin_503_is_retryable() {
        let e = TransferError::Origin {
            path: "p".into(),
            source: OriginError::HttpStatus {
                status: 503,
                path: "p".into(),
            },
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn test_timeout_and_panic_retryable() {
        assert!(TransferError::Timeout {
            path: "p".into(),
            secs: 1
        }
        .is_retryable());
        assert!(TransferError::Panicked("boom".into()).is_retryable());
    }

    #[test]
    fn test_destination_classification_passes_through() {
        let e = TransferError::Destination {
            key: "k".into(),
            source: DestinationError::Sdk {
                operation: "PutObject",
                key: "k".into(),
                message: "denied".into(),
                retryable: false,
            },
        };
        assert!(!e.is_retryable());
        assert_eq!(e.to_string(), "writing k: PutObject for k failed: denied");
    }
}

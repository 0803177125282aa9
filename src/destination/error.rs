use thiserror::Error;

/// Failures writing to the destination object store.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("{operation} for {key} failed: {message}")]
    Sdk {
        operation: &'static str,
        key: String,
        message: String,
        retryable: bool,
    },

    #[error("object store returned an unusable {operation} response for {key}: {message}")]
    Protocol {
        operation: &'static str,
        key: String,
        message: String,
    },
}

impl DestinationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DestinationError::Sdk { retryable, .. } => *retryable,
            DestinationError::Protocol { .. } => true,
        }
    }
}

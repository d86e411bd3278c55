//! Delivery errors.
//!
//! | Error Type | Queue behaviour |
//! |------------|-----------------|
//! | [`DeliveryError::Connectivity`] | Kept, `retryCount` incremented |
//! | [`DeliveryError::RejectedByServer`] | Discarded |
//! | [`DeliveryError::Server`] | Discarded from the queue; live batches are retried from memory |
//! | [`DeliveryError::RetryBudgetExhausted`] | Discarded without sending |

use thiserror::Error;

/// Errors that can occur while delivering a request to the backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeliveryError {
    /// The backend could not be reached at all.
    #[error("Backend unreachable: {0}")]
    Connectivity(String),

    /// The backend refused the request (4xx); retrying cannot succeed.
    #[error("Request rejected by server with status {status}")]
    RejectedByServer { status: u16 },

    /// The backend failed to handle the request (5xx).
    #[error("Server error with status {status}")]
    Server { status: u16 },

    /// A queued request used up its retries.
    #[error("Request {id} abandoned after {attempts} attempts")]
    RetryBudgetExhausted { id: String, attempts: u32 },

    /// The durable queue could not be read or written.
    #[error("Queue storage error: {0}")]
    Queue(#[from] caremon_store::Error),

    /// The request body could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Whether this failure means "no network" rather than a server verdict.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, DeliveryError::Connectivity(_))
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16) -> Self {
        if (400..500).contains(&status) {
            DeliveryError::RejectedByServer { status }
        } else {
            DeliveryError::Server { status }
        }
    }
}

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            DeliveryError::from_status(400),
            DeliveryError::RejectedByServer { status: 400 }
        ));
        assert!(matches!(
            DeliveryError::from_status(401),
            DeliveryError::RejectedByServer { .. }
        ));
        assert!(matches!(DeliveryError::from_status(503), DeliveryError::Server { status: 503 }));
    }

    #[test]
    fn test_connectivity_flag() {
        assert!(DeliveryError::Connectivity("dns".into()).is_connectivity());
        assert!(!DeliveryError::Server { status: 500 }.is_connectivity());
        assert!(!DeliveryError::RejectedByServer { status: 422 }.is_connectivity());
    }
}

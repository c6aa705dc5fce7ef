//! Error types for connector and transfer operations

use thiserror::Error;

use lodestone_core::CoreError;

use crate::digest::ChecksumFailure;

/// Transfer operation errors
#[derive(Debug, Error)]
pub enum TransferError {
    // ============ Connector Selection ============
    #[error("No connector available for repository '{repository}' (protocol '{protocol}')")]
    NoConnectorAvailable {
        repository: String,
        protocol: String,
    },

    #[error("A connector is already active for repository '{repository}' in this session")]
    ConnectorAlreadyActive { repository: String },

    #[error("Connector for repository '{repository}' is closed")]
    ConnectorClosed { repository: String },

    // ============ Transport ============
    #[error("Resource not found: {url}")]
    NotFound { url: String },

    #[error("Authentication required for {url}")]
    Unauthorized { url: String },

    #[error("Access denied to {url}")]
    Forbidden { url: String },

    #[error("HTTP error {status} for {url}")]
    Http { status: u16, url: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Request timed out: {url}")]
    RequestTimeout { url: String },

    #[error("Malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    // ============ Verification ============
    #[error(transparent)]
    ChecksumMismatch(#[from] ChecksumFailure),

    #[error("No checksum available for {resource} and the repository requires verification")]
    ChecksumUnavailable { resource: String },

    // ============ Cancellation ============
    #[error("Transfer cancelled: deadline of {}ms exceeded", .deadline.as_millis())]
    Cancelled { deadline: std::time::Duration },

    // ============ Local ============
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

impl TransferError {
    /// Whether a retry can reasonably be expected to succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Network { .. } | TransferError::RequestTimeout { .. } => true,
            TransferError::Http { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        let url = e.url().map(|u| u.to_string()).unwrap_or_default();
        if e.is_timeout() {
            TransferError::RequestTimeout { url }
        } else if e.is_connect() {
            TransferError::Network {
                message: format!("connection failed: {e}"),
            }
        } else if let Some(status) = e.status() {
            TransferError::Http {
                status: status.as_u16(),
                url,
            }
        } else {
            TransferError::Network {
                message: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> TransferError {
        TransferError::Http {
            status,
            url: "https://repo.example.com/a".to_string(),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(http(500).is_transient());
        assert!(http(502).is_transient());
        assert!(http(503).is_transient());
        assert!(http(504).is_transient());
        assert!(http(429).is_transient());
        assert!(http(408).is_transient());
        assert!(
            TransferError::Network {
                message: "reset".to_string()
            }
            .is_transient()
        );
        assert!(
            TransferError::RequestTimeout {
                url: String::new()
            }
            .is_transient()
        );

        assert!(!http(400).is_transient());
        assert!(
            !TransferError::NotFound {
                url: String::new()
            }
            .is_transient()
        );
        assert!(
            !TransferError::Unauthorized {
                url: String::new()
            }
            .is_transient()
        );
        assert!(
            !TransferError::Cancelled {
                deadline: std::time::Duration::from_secs(1)
            }
            .is_transient()
        );
    }
}

//! Batch transfer requests and per-item outcomes
//!
//! A batch is a list of independent items. Every item is attempted and
//! reaches exactly one terminal [`TransferOutcome`]; a single item's
//! failure never aborts its siblings. The caller reads the
//! [`BatchReport`] and decides whether partial success is acceptable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use lodestone_core::{Coordinate, MetadataRef, TransferDirection, TransferResource};

use crate::digest::{Algorithm, ChecksumFailure};
use crate::error::TransferError;

/// Request to download one artifact into a local file.
#[derive(Debug, Clone)]
pub struct ArtifactDownload {
    pub coordinate: Coordinate,
    pub destination: PathBuf,
    /// Caller-supplied expected digests; when empty the repository's
    /// published sidecars are consulted instead
    pub expected_digests: HashMap<Algorithm, String>,
    /// Overall deadline covering pool wait and transfer
    pub timeout: Option<Duration>,
}

impl ArtifactDownload {
    pub fn new(coordinate: Coordinate, destination: impl Into<PathBuf>) -> Self {
        Self {
            coordinate,
            destination: destination.into(),
            expected_digests: HashMap::new(),
            timeout: None,
        }
    }

    pub fn with_digest(mut self, algorithm: Algorithm, hex: impl Into<String>) -> Self {
        self.expected_digests.insert(algorithm, hex.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Request to upload one artifact from a local file.
#[derive(Debug, Clone)]
pub struct ArtifactUpload {
    pub coordinate: Coordinate,
    pub source: PathBuf,
    /// Expected digests of the source; verified against bytes actually
    /// sent
    pub expected_digests: HashMap<Algorithm, String>,
    pub timeout: Option<Duration>,
}

impl ArtifactUpload {
    pub fn new(coordinate: Coordinate, source: impl Into<PathBuf>) -> Self {
        Self {
            coordinate,
            source: source.into(),
            expected_digests: HashMap::new(),
            timeout: None,
        }
    }

    pub fn with_digest(mut self, algorithm: Algorithm, hex: impl Into<String>) -> Self {
        self.expected_digests.insert(algorithm, hex.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Request to download one metadata resource.
#[derive(Debug, Clone)]
pub struct MetadataDownload {
    pub metadata: MetadataRef,
    pub destination: PathBuf,
    pub timeout: Option<Duration>,
}

impl MetadataDownload {
    pub fn new(metadata: MetadataRef, destination: impl Into<PathBuf>) -> Self {
        Self {
            metadata,
            destination: destination.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Request to upload one metadata resource.
#[derive(Debug, Clone)]
pub struct MetadataUpload {
    pub metadata: MetadataRef,
    pub source: PathBuf,
    pub timeout: Option<Duration>,
}

impl MetadataUpload {
    pub fn new(metadata: MetadataRef, source: impl Into<PathBuf>) -> Self {
        Self {
            metadata,
            source: source.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Terminal state of one batch item, set exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Success,
    ChecksumMismatch(ChecksumFailure),
    NotFound,
    TransportFailure { message: String, transient: bool },
    Cancelled,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Success)
    }

    /// Collapse a transfer error into the outcome reported to callers.
    pub fn from_error(error: TransferError) -> Self {
        match error {
            TransferError::NotFound { .. } => TransferOutcome::NotFound,
            TransferError::ChecksumMismatch(failure) => TransferOutcome::ChecksumMismatch(failure),
            TransferError::ChecksumUnavailable { .. } => {
                TransferOutcome::ChecksumMismatch(ChecksumFailure::unavailable())
            }
            TransferError::Cancelled { .. } => TransferOutcome::Cancelled,
            other => TransferOutcome::TransportFailure {
                transient: other.is_transient(),
                message: other.to_string(),
            },
        }
    }
}

/// Outcome of one batch item.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub resource: TransferResource,
    pub direction: TransferDirection,
    pub outcome: TransferOutcome,
    /// Transfer attempts performed; 0 when served from the local cache
    pub attempts: u32,
    /// Bytes moved by the final attempt
    pub transferred: u64,
    /// Satisfied from the verified local cache without touching the
    /// network
    pub from_cache: bool,
}

/// Per-item outcomes of one batch call, in submission order (artifacts
/// before metadata).
#[derive(Debug, Default, Clone)]
pub struct BatchReport {
    pub results: Vec<TransferResult>,
}

impl BatchReport {
    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| !r.outcome.is_success())
    }

    pub fn failures(&self) -> Vec<&TransferResult> {
        self.results
            .iter()
            .filter(|r| !r.outcome.is_success())
            .collect()
    }

    pub fn result_for(&self, resource: &TransferResource) -> Option<&TransferResult> {
        self.results.iter().find(|r| &r.resource == resource)
    }
}

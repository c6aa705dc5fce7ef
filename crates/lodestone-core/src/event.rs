//! Transfer lifecycle events
//!
//! Events are immutable snapshots built in full before publication. For
//! one transfer the order is strict: `Started` precedes any
//! `Progressed`, which precede exactly one terminal event (`Succeeded`,
//! `Corrupted` or `Failed`). No ordering holds across transfers.

use std::fmt;

use crate::coordinate::{Coordinate, MetadataRef};

/// Lifecycle stage of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferEventKind {
    Started,
    Progressed,
    Succeeded,
    /// Bytes arrived but failed checksum verification
    Corrupted,
    Failed,
}

impl TransferEventKind {
    /// Whether this kind ends a transfer's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEventKind::Succeeded | TransferEventKind::Corrupted | TransferEventKind::Failed
        )
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Get,
    Put,
}

/// The resource a transfer moves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransferResource {
    Artifact(Coordinate),
    Metadata(MetadataRef),
}

impl TransferResource {
    /// Repository-relative path of the resource.
    pub fn repository_path(&self) -> String {
        match self {
            TransferResource::Artifact(coordinate) => coordinate.repository_path(),
            TransferResource::Metadata(metadata) => metadata.repository_path(),
        }
    }
}

impl fmt::Display for TransferResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferResource::Artifact(coordinate) => write!(f, "{coordinate}"),
            TransferResource::Metadata(metadata) => write!(f, "{metadata}"),
        }
    }
}

/// Immutable snapshot of one transfer lifecycle notification.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub kind: TransferEventKind,
    pub session_id: String,
    pub repository_id: String,
    pub resource: TransferResource,
    pub direction: TransferDirection,
    /// Bytes moved so far
    pub transferred: u64,
    /// Expected total, when the transport reports one
    pub total: Option<u64>,
    /// Causes; empty except for `Corrupted`/`Failed`
    pub errors: Vec<String>,
}

impl TransferEvent {
    pub fn builder(
        kind: TransferEventKind,
        session_id: impl Into<String>,
        repository_id: impl Into<String>,
        resource: TransferResource,
        direction: TransferDirection,
    ) -> TransferEventBuilder {
        TransferEventBuilder {
            event: TransferEvent {
                kind,
                session_id: session_id.into(),
                repository_id: repository_id.into(),
                resource,
                direction,
                transferred: 0,
                total: None,
                errors: Vec::new(),
            },
        }
    }
}

/// Construction-time convenience; the built event is never mutated.
pub struct TransferEventBuilder {
    event: TransferEvent,
}

impl TransferEventBuilder {
    pub fn transferred(mut self, bytes: u64) -> Self {
        self.event.transferred = bytes;
        self
    }

    pub fn total(mut self, bytes: u64) -> Self {
        self.event.total = Some(bytes);
        self
    }

    pub fn error(mut self, cause: impl Into<String>) -> Self {
        self.event.errors.push(cause.into());
        self
    }

    pub fn build(self) -> TransferEvent {
        self.event
    }
}

/// Observer of transfer lifecycle events, registered at session build
/// time. Implementations must not assume any cross-transfer ordering.
pub trait TransferListener: Send + Sync {
    fn on_event(&self, event: &TransferEvent);
}

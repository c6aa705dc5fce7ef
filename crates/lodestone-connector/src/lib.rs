//! Lodestone Connectors - repository access and the transfer engine
//!
//! This crate turns a heterogeneous set of repositories into a uniform,
//! concurrent, checksum-verified get/put operation:
//!
//! - **Connector registry**: protocol backends selected by declared
//!   priority, one live connector per (session, repository) binding
//! - **File connector**: local/mounted filesystem repositories
//! - **Async HTTP connector**: bounded connection pool, retries with
//!   backoff, resumable downloads, same-origin credential discipline
//! - **Digest verifier**: incremental SHA-1/SHA-256/MD5 with any-match
//!   verification against published sidecars
//! - **Event bus**: per-transfer lifecycle stream fanned out to the
//!   session's listeners
//!
//! ## Example
//!
//! ```rust,no_run
//! use lodestone_connector::{ArtifactDownload, Connector, ConnectorRegistry};
//! use lodestone_core::{Coordinate, RemoteRepository, Session};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::builder("/var/cache/artifacts").build()?;
//! let repository = RemoteRepository::new("central", "https://repo.example.com/releases")?;
//!
//! let registry = ConnectorRegistry::with_defaults();
//! let connector = registry.resolve(&session, &repository)?;
//!
//! let coordinate = Coordinate::parse("com.acme:lib:1.0")?;
//! let download = ArtifactDownload::new(
//!     coordinate.clone(),
//!     session.artifact_destination(&coordinate),
//! );
//! let report = connector.get(vec![download], vec![]).await?;
//! assert!(!report.has_failures());
//!
//! connector.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! Per-item failures never abort a batch; read the returned
//! [`BatchReport`] to decide whether partial success is acceptable.

pub mod connector;
pub mod digest;
mod engine;
pub mod error;
pub mod events;
pub mod file;
pub mod http;
pub mod registry;
pub mod request;

// Re-exports for convenience
pub use connector::Connector;
pub use digest::{Algorithm, ChecksumFailure, Digester};
pub use error::{Result, TransferError};
pub use events::EventBus;
pub use file::{FileConnector, FileConnectorFactory};
pub use http::{HttpConnector, HttpConnectorFactory};
pub use registry::{ConnectorFactory, ConnectorRegistry, LeasedConnector};
pub use request::{
    ArtifactDownload, ArtifactUpload, BatchReport, MetadataDownload, MetadataUpload,
    TransferOutcome, TransferResult,
};

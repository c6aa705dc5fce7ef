//! Lodestone Core - shared model for the artifact transfer layer
//!
//! This crate provides the foundational types used throughout Lodestone:
//! - `Coordinate` / `MetadataRef`: identities of versioned artifacts and
//!   repository metadata
//! - `RemoteRepository`: repository description with policies and
//!   credentials
//! - `Session`: per-run context carrying repositories, listeners, the
//!   local layout and the verified-download cache
//! - `TransferEvent` / `TransferListener`: the observable transfer
//!   lifecycle
//! - `LocalCache`: SQLite record of checksum-verified downloads

pub mod cache;
pub mod coordinate;
pub mod error;
pub mod event;
pub mod layout;
pub mod repository;
pub mod session;

pub use cache::{CacheEntry, LocalCache};
pub use coordinate::{Coordinate, DEFAULT_EXTENSION, MetadataRef};
pub use error::{CoreError, Result};
pub use event::{
    TransferDirection, TransferEvent, TransferEventBuilder, TransferEventKind, TransferListener,
    TransferResource,
};
pub use layout::{HierarchicalLayout, LocalLayout};
pub use repository::{
    Authentication, ChecksumPolicy, RemoteRepository, RepositorySet, UpdatePolicy,
    merge_repositories,
};
pub use session::{Session, SessionBuilder, TransferConfig};

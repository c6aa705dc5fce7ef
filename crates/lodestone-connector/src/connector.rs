//! The protocol-polymorphic connector contract

use async_trait::async_trait;

use lodestone_core::RemoteRepository;

use crate::error::Result;
use crate::request::{
    ArtifactDownload, ArtifactUpload, BatchReport, MetadataDownload, MetadataUpload,
};

/// A transfer backend bound to exactly one repository and session.
///
/// A connector exclusively owns its transport resources for the
/// lifetime of that binding. `get`/`put` attempt every item of the
/// batch and return one outcome per item; they only error on
/// batch-level precondition violations such as an already-closed
/// connector. `close` releases the binding and all transport
/// resources; further use is an error.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The repository this connector is bound to.
    fn repository(&self) -> &RemoteRepository;

    /// Download a batch of artifacts and metadata into caller-supplied
    /// local paths.
    async fn get(
        &self,
        artifacts: Vec<ArtifactDownload>,
        metadata: Vec<MetadataDownload>,
    ) -> Result<BatchReport>;

    /// Upload a batch of artifacts and metadata from local paths.
    async fn put(
        &self,
        artifacts: Vec<ArtifactUpload>,
        metadata: Vec<MetadataUpload>,
    ) -> Result<BatchReport>;

    /// Release the binding and all transport resources. Must be called
    /// exactly once.
    fn close(&self) -> Result<()>;
}

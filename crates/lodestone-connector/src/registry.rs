//! Connector factory registry
//!
//! Factories declare a priority and claim repository protocols.
//! `resolve` tries them in descending priority (ties broken by
//! registration order); the first factory that supports the protocol
//! constructs the connector. Construction never performs network I/O.
//! The registry also enforces that at most one connector is live per
//! (session, repository) binding at a time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use lodestone_core::{RemoteRepository, Session};

use crate::connector::Connector;
use crate::error::{Result, TransferError};
use crate::file::FileConnectorFactory;
use crate::http::HttpConnectorFactory;
use crate::request::{
    ArtifactDownload, ArtifactUpload, BatchReport, MetadataDownload, MetadataUpload,
};

/// Creates connectors for the protocols it claims.
pub trait ConnectorFactory: Send + Sync {
    /// Selection priority; the highest supporting factory wins.
    fn priority(&self) -> i32;

    /// Whether this factory claims the repository's protocol.
    fn supports(&self, repository: &RemoteRepository) -> bool;

    /// Construct a connector. Fails fast on a malformed repository,
    /// performs no I/O.
    fn new_connector(
        &self,
        session: &Session,
        repository: &RemoteRepository,
    ) -> Result<Box<dyn Connector>>;
}

type BindingKey = (String, String);

/// Registry of connector factories.
pub struct ConnectorRegistry {
    factories: Vec<Arc<dyn ConnectorFactory>>,
    active: Arc<Mutex<HashSet<BindingKey>>>,
}

impl ConnectorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Registry with the built-in file and HTTP factories.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FileConnectorFactory));
        registry.register(Arc::new(HttpConnectorFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn ConnectorFactory>) {
        self.factories.push(factory);
    }

    /// Select a connector for the repository, highest priority first.
    pub fn resolve(
        &self,
        session: &Session,
        repository: &RemoteRepository,
    ) -> Result<LeasedConnector> {
        let mut candidates: Vec<&Arc<dyn ConnectorFactory>> = self
            .factories
            .iter()
            .filter(|f| f.supports(repository))
            .collect();
        // Stable sort keeps registration order for equal priorities.
        candidates.sort_by_key(|f| std::cmp::Reverse(f.priority()));

        let factory = candidates
            .first()
            .ok_or_else(|| TransferError::NoConnectorAvailable {
                repository: repository.id().to_string(),
                protocol: repository.protocol().to_string(),
            })?;

        let lease = BindingLease::acquire(
            self.active.clone(),
            session.id().to_string(),
            repository.id().to_string(),
        )?;
        let inner = factory.new_connector(session, repository)?;
        Ok(LeasedConnector { inner, lease })
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Marks a (session, repository) binding as taken until released.
struct BindingLease {
    key: BindingKey,
    active: Arc<Mutex<HashSet<BindingKey>>>,
    released: AtomicBool,
}

impl BindingLease {
    fn acquire(
        active: Arc<Mutex<HashSet<BindingKey>>>,
        session_id: String,
        repository_id: String,
    ) -> Result<Self> {
        let key = (session_id, repository_id);
        {
            let mut held = active.lock().unwrap_or_else(PoisonError::into_inner);
            if !held.insert(key.clone()) {
                return Err(TransferError::ConnectorAlreadyActive {
                    repository: key.1,
                });
            }
        }
        Ok(Self {
            key,
            active,
            released: AtomicBool::new(false),
        })
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.key);
        }
    }
}

impl Drop for BindingLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// A connector owning its (session, repository) binding; the binding is
/// released on close or drop.
pub struct LeasedConnector {
    inner: Box<dyn Connector>,
    lease: BindingLease,
}

#[async_trait]
impl Connector for LeasedConnector {
    fn repository(&self) -> &RemoteRepository {
        self.inner.repository()
    }

    async fn get(
        &self,
        artifacts: Vec<ArtifactDownload>,
        metadata: Vec<MetadataDownload>,
    ) -> Result<BatchReport> {
        self.inner.get(artifacts, metadata).await
    }

    async fn put(
        &self,
        artifacts: Vec<ArtifactUpload>,
        metadata: Vec<MetadataUpload>,
    ) -> Result<BatchReport> {
        self.inner.put(artifacts, metadata).await
    }

    fn close(&self) -> Result<()> {
        let closed = self.inner.close();
        self.lease.release();
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeConnector {
        repository: RemoteRepository,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        fn repository(&self) -> &RemoteRepository {
            &self.repository
        }

        async fn get(
            &self,
            _artifacts: Vec<ArtifactDownload>,
            _metadata: Vec<MetadataDownload>,
        ) -> Result<BatchReport> {
            Ok(BatchReport::default())
        }

        async fn put(
            &self,
            _artifacts: Vec<ArtifactUpload>,
            _metadata: Vec<MetadataUpload>,
        ) -> Result<BatchReport> {
            Ok(BatchReport::default())
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeFactory {
        label: &'static str,
        priority: i32,
        protocol: &'static str,
    }

    impl ConnectorFactory for FakeFactory {
        fn priority(&self) -> i32 {
            self.priority
        }

        fn supports(&self, repository: &RemoteRepository) -> bool {
            repository.protocol().eq_ignore_ascii_case(self.protocol)
        }

        fn new_connector(
            &self,
            _session: &Session,
            repository: &RemoteRepository,
        ) -> Result<Box<dyn Connector>> {
            // Smuggle the winning factory's label out through the id.
            let repository =
                RemoteRepository::new(format!("{}-{}", repository.id(), self.label), "https://x")
                    .map_err(TransferError::Core)?;
            Ok(Box::new(FakeConnector { repository }))
        }
    }

    fn session() -> (tempfile::TempDir, Session) {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::builder(dir.path()).build().unwrap();
        (dir, session)
    }

    #[test]
    fn test_highest_priority_wins() {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(FakeFactory {
            label: "low",
            priority: 1,
            protocol: "https",
        }));
        registry.register(Arc::new(FakeFactory {
            label: "high",
            priority: 10,
            protocol: "https",
        }));

        let (_dir, session) = session();
        let repository = RemoteRepository::new("central", "https://repo.example.com").unwrap();
        let connector = registry.resolve(&session, &repository).unwrap();
        assert_eq!(connector.repository().id(), "central-high");
    }

    #[test]
    fn test_ties_break_by_registration_order() {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(FakeFactory {
            label: "first",
            priority: 5,
            protocol: "https",
        }));
        registry.register(Arc::new(FakeFactory {
            label: "second",
            priority: 5,
            protocol: "https",
        }));

        let (_dir, session) = session();
        let repository = RemoteRepository::new("central", "https://repo.example.com").unwrap();
        let connector = registry.resolve(&session, &repository).unwrap();
        assert_eq!(connector.repository().id(), "central-first");
    }

    #[test]
    fn test_no_connector_available() {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(FakeFactory {
            label: "web",
            priority: 1,
            protocol: "https",
        }));

        let (_dir, session) = session();
        let repository = RemoteRepository::new("odd", "sftp://repo.example.com").unwrap();
        match registry.resolve(&session, &repository) {
            Err(TransferError::NoConnectorAvailable { protocol, .. }) => {
                assert_eq!(protocol, "sftp");
            }
            other => panic!("unexpected resolution: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_binding_is_exclusive_until_closed() {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(FakeFactory {
            label: "web",
            priority: 1,
            protocol: "https",
        }));

        let (_dir, session) = session();
        let repository = RemoteRepository::new("central", "https://repo.example.com").unwrap();

        let first = registry.resolve(&session, &repository).unwrap();
        assert!(matches!(
            registry.resolve(&session, &repository),
            Err(TransferError::ConnectorAlreadyActive { .. })
        ));

        first.close().unwrap();
        let second = registry.resolve(&session, &repository).unwrap();

        // Dropping without close also releases the binding.
        drop(second);
        assert!(registry.resolve(&session, &repository).is_ok());
    }
}

//! Local filesystem connector
//!
//! Backs onto a directory derived from a `file://` repository URL.
//! Transfers degrade to file copies but still flow through the digest
//! verifier and the event bus, so callers observe the same lifecycle
//! as for remote repositories. Local I/O failures are fatal; retrying
//! them is not meaningful.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use url::Url;

use lodestone_core::{
    ChecksumPolicy, CoreError, LocalCache, RemoteRepository, Session, TransferDirection,
    TransferEvent, TransferEventKind, TransferResource,
};

use crate::connector::Connector;
use crate::digest::{self, Algorithm, Digester};
use crate::engine::{
    checksum_for_cache, failure_message, part_path, terminal_kind, with_deadline,
};
use crate::error::{Result, TransferError};
use crate::events::EventBus;
use crate::registry::ConnectorFactory;
use crate::request::{
    ArtifactDownload, ArtifactUpload, BatchReport, MetadataDownload, MetadataUpload,
    TransferOutcome, TransferResult,
};

/// Factory for `file://` repositories.
pub struct FileConnectorFactory;

impl ConnectorFactory for FileConnectorFactory {
    fn priority(&self) -> i32 {
        1
    }

    fn supports(&self, repository: &RemoteRepository) -> bool {
        repository.protocol().eq_ignore_ascii_case("file")
    }

    fn new_connector(
        &self,
        session: &Session,
        repository: &RemoteRepository,
    ) -> Result<Box<dyn Connector>> {
        Ok(Box::new(FileConnector::new(session, repository)?))
    }
}

/// Connector for a local or mounted filesystem repository.
pub struct FileConnector {
    repository: RemoteRepository,
    root: PathBuf,
    session_id: String,
    cache: Arc<LocalCache>,
    bus: EventBus,
    closed: AtomicBool,
}

impl FileConnector {
    /// Bind to a repository. Derives the root directory from the URL
    /// without touching the filesystem.
    pub fn new(session: &Session, repository: &RemoteRepository) -> Result<Self> {
        let url = Url::parse(repository.url()).map_err(|e| CoreError::InvalidRepositoryUrl {
            url: repository.url().to_string(),
            reason: e.to_string(),
        })?;
        let root = url
            .to_file_path()
            .map_err(|()| CoreError::InvalidRepositoryUrl {
                url: repository.url().to_string(),
                reason: "not a local filesystem path".to_string(),
            })?;

        Ok(Self {
            repository: repository.clone(),
            root,
            session_id: session.id().to_string(),
            cache: session.cache().clone(),
            bus: EventBus::for_session(session),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransferError::ConnectorClosed {
                repository: self.repository.id().to_string(),
            });
        }
        Ok(())
    }

    fn publish(&self, kind: TransferEventKind, resource: &TransferResource, direction: TransferDirection, transferred: u64, error: Option<String>) {
        let mut builder = TransferEvent::builder(
            kind,
            self.session_id.clone(),
            self.repository.id().to_string(),
            resource.clone(),
            direction,
        )
        .transferred(transferred);
        if let Some(error) = error {
            builder = builder.error(error);
        }
        self.bus.publish(builder.build());
    }

    /// Resolve the digests a download must match: caller-supplied ones,
    /// or the repository's sidecar files, subject to the checksum
    /// policy.
    async fn expected_digests(
        &self,
        source: &Path,
        supplied: &HashMap<Algorithm, String>,
    ) -> Result<Option<HashMap<Algorithm, String>>> {
        if !supplied.is_empty() {
            return Ok(Some(supplied.clone()));
        }
        match self.repository.checksum_policy() {
            ChecksumPolicy::Ignore => Ok(None),
            policy => {
                for algorithm in Algorithm::ALL {
                    let sidecar = sidecar_path(source, algorithm);
                    if let Ok(content) = tokio::fs::read_to_string(&sidecar).await
                        && let Some(hex) = digest::parse_sidecar(&content)
                    {
                        return Ok(Some(HashMap::from([(algorithm, hex)])));
                    }
                }
                if policy == ChecksumPolicy::Fail {
                    Err(TransferError::ChecksumUnavailable {
                        resource: source.display().to_string(),
                    })
                } else {
                    tracing::warn!(
                        source = %source.display(),
                        "no checksum published for resource, accepting unverified"
                    );
                    Ok(None)
                }
            }
        }
    }

    /// Copy one resource out of the repository, verify it and move it
    /// into place. Returns bytes copied and the recorded checksum.
    async fn fetch(
        &self,
        resource: &TransferResource,
        destination: &Path,
        supplied: &HashMap<Algorithm, String>,
    ) -> Result<(u64, Option<String>)> {
        let source = self.root.join(resource.repository_path());
        if tokio::fs::metadata(&source).await.is_err() {
            return Err(TransferError::NotFound {
                url: source.display().to_string(),
            });
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(destination);
        let transferred = tokio::fs::copy(&source, &part).await?;
        self.publish(
            TransferEventKind::Progressed,
            resource,
            TransferDirection::Get,
            transferred,
            None,
        );

        let mut recorded = None;
        if let Some(expected) = self.expected_digests(&source, supplied).await.map_err(
            |e| {
                // A strict policy with no digest source discards the copy.
                let _ = std::fs::remove_file(&part);
                e
            },
        )? {
            let algorithms: Vec<Algorithm> = expected.keys().copied().collect();
            let actual = Digester::digest_file(&part, &algorithms)?;
            if let Err(failure) = digest::verify(&actual, &expected) {
                tokio::fs::remove_file(&part).await.ok();
                return Err(TransferError::ChecksumMismatch(failure));
            }
            recorded = checksum_for_cache(&actual);
        }

        tokio::fs::rename(&part, destination).await?;
        Ok((transferred, recorded))
    }

    /// Copy one local file into the repository, writing sidecar
    /// checksums beside it.
    async fn store(
        &self,
        resource: &TransferResource,
        source: &Path,
        supplied: &HashMap<Algorithm, String>,
    ) -> Result<u64> {
        let destination = self.root.join(resource.repository_path());
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let part = part_path(&destination);
        let transferred = tokio::fs::copy(source, &part).await?;
        self.publish(
            TransferEventKind::Progressed,
            resource,
            TransferDirection::Put,
            transferred,
            None,
        );

        let mut algorithms: Vec<Algorithm> = supplied.keys().copied().collect();
        if !algorithms.contains(&Algorithm::Sha1) {
            algorithms.push(Algorithm::Sha1);
        }
        let actual = Digester::digest_file(&part, &algorithms)?;
        if !supplied.is_empty()
            && let Err(failure) = digest::verify(&actual, supplied)
        {
            tokio::fs::remove_file(&part).await.ok();
            return Err(TransferError::ChecksumMismatch(failure));
        }

        tokio::fs::rename(&part, &destination).await?;
        for (algorithm, hex) in &actual {
            let sidecar = sidecar_path(&destination, *algorithm);
            tokio::fs::write(&sidecar, format!("{hex}\n")).await?;
        }
        Ok(transferred)
    }

    async fn run_get(
        &self,
        resource: TransferResource,
        destination: PathBuf,
        supplied: HashMap<Algorithm, String>,
        timeout: Option<std::time::Duration>,
        cache_key: Option<&lodestone_core::Coordinate>,
    ) -> TransferResult {
        self.publish(
            TransferEventKind::Started,
            &resource,
            TransferDirection::Get,
            0,
            None,
        );

        let attempt = self.fetch(&resource, &destination, &supplied);
        let completed = with_deadline(timeout, attempt).await;
        let completed = match completed {
            Err(cancelled @ TransferError::Cancelled { .. }) => {
                tokio::fs::remove_file(part_path(&destination)).await.ok();
                Err(cancelled)
            }
            other => other,
        };

        let (outcome, transferred) = match completed {
            Ok((transferred, recorded)) => {
                if let Some(coordinate) = cache_key
                    && let Err(e) = self.cache.record(
                        self.repository.id(),
                        coordinate,
                        &destination,
                        recorded.as_deref(),
                    )
                {
                    tracing::warn!("failed to record verified download: {e}");
                }
                (TransferOutcome::Success, transferred)
            }
            Err(error) => (TransferOutcome::from_error(error), 0),
        };

        self.publish(
            terminal_kind(&outcome),
            &resource,
            TransferDirection::Get,
            transferred,
            failure_message(&outcome),
        );

        TransferResult {
            resource,
            direction: TransferDirection::Get,
            outcome,
            attempts: 1,
            transferred,
            from_cache: false,
        }
    }

    async fn run_put(
        &self,
        resource: TransferResource,
        source: PathBuf,
        supplied: HashMap<Algorithm, String>,
        timeout: Option<std::time::Duration>,
    ) -> TransferResult {
        self.publish(
            TransferEventKind::Started,
            &resource,
            TransferDirection::Put,
            0,
            None,
        );

        let attempt = self.store(&resource, &source, &supplied);
        let completed = with_deadline(timeout, attempt).await;

        let (outcome, transferred) = match completed {
            Ok(transferred) => (TransferOutcome::Success, transferred),
            Err(error) => (TransferOutcome::from_error(error), 0),
        };

        self.publish(
            terminal_kind(&outcome),
            &resource,
            TransferDirection::Put,
            transferred,
            failure_message(&outcome),
        );

        TransferResult {
            resource,
            direction: TransferDirection::Put,
            outcome,
            attempts: 1,
            transferred,
            from_cache: false,
        }
    }
}

#[async_trait]
impl Connector for FileConnector {
    fn repository(&self) -> &RemoteRepository {
        &self.repository
    }

    async fn get(
        &self,
        artifacts: Vec<ArtifactDownload>,
        metadata: Vec<MetadataDownload>,
    ) -> Result<BatchReport> {
        self.ensure_open()?;

        let mut report = BatchReport::default();
        for download in artifacts {
            let resource = TransferResource::Artifact(download.coordinate.clone());
            report.results.push(
                self.run_get(
                    resource,
                    download.destination,
                    download.expected_digests,
                    download.timeout,
                    Some(&download.coordinate),
                )
                .await,
            );
        }
        for download in metadata {
            let resource = TransferResource::Metadata(download.metadata);
            report.results.push(
                self.run_get(resource, download.destination, HashMap::new(), download.timeout, None)
                    .await,
            );
        }
        Ok(report)
    }

    async fn put(
        &self,
        artifacts: Vec<ArtifactUpload>,
        metadata: Vec<MetadataUpload>,
    ) -> Result<BatchReport> {
        self.ensure_open()?;

        let mut report = BatchReport::default();
        for upload in artifacts {
            let resource = TransferResource::Artifact(upload.coordinate);
            report.results.push(
                self.run_put(resource, upload.source, upload.expected_digests, upload.timeout)
                    .await,
            );
        }
        for upload in metadata {
            let resource = TransferResource::Metadata(upload.metadata);
            report.results.push(
                self.run_put(resource, upload.source, HashMap::new(), upload.timeout)
                    .await,
            );
        }
        Ok(report)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransferError::ConnectorClosed {
                repository: self.repository.id().to_string(),
            });
        }
        Ok(())
    }
}

fn sidecar_path(path: &Path, algorithm: Algorithm) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(algorithm.file_extension());
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use lodestone_core::{Coordinate, TransferListener};

    struct EventRecorder {
        kinds: Mutex<Vec<TransferEventKind>>,
    }

    impl TransferListener for EventRecorder {
        fn on_event(&self, event: &TransferEvent) {
            self.kinds.lock().unwrap().push(event.kind);
        }
    }

    struct Fixture {
        _local: tempfile::TempDir,
        _remote: tempfile::TempDir,
        session: Session,
        repository: RemoteRepository,
        remote_root: PathBuf,
        events: Arc<EventRecorder>,
    }

    fn fixture(policy: ChecksumPolicy) -> Fixture {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let events = Arc::new(EventRecorder {
            kinds: Mutex::new(Vec::new()),
        });
        let session = Session::builder(local.path())
            .listener(events.clone())
            .build()
            .unwrap();
        let repository = RemoteRepository::new(
            "local-mirror",
            format!("file://{}", remote.path().display()),
        )
        .unwrap()
        .with_checksum_policy(policy);
        let remote_root = remote.path().to_path_buf();
        Fixture {
            _local: local,
            _remote: remote,
            session,
            repository,
            remote_root,
            events,
        }
    }

    fn seed_artifact(root: &Path, coordinate: &Coordinate, content: &[u8], with_sidecar: Option<&str>) {
        let path = root.join(coordinate.repository_path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        if let Some(hex) = with_sidecar {
            std::fs::write(sidecar_path(&path, Algorithm::Sha1), format!("{hex}\n")).unwrap();
        }
    }

    const HELLO_SHA1: &str = "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed";

    #[tokio::test]
    async fn test_get_with_sidecar_verification() {
        let fx = fixture(ChecksumPolicy::Fail);
        let coordinate = Coordinate::new("com.acme", "lib", "1.0").unwrap();
        seed_artifact(&fx.remote_root, &coordinate, b"hello world", Some(HELLO_SHA1));

        let connector = FileConnector::new(&fx.session, &fx.repository).unwrap();
        let destination = fx.session.artifact_destination(&coordinate);
        let report = connector
            .get(
                vec![ArtifactDownload::new(coordinate.clone(), &destination)],
                vec![],
            )
            .await
            .unwrap();

        assert!(!report.has_failures());
        assert_eq!(std::fs::read(&destination).unwrap(), b"hello world");

        let entry = fx
            .session
            .cache()
            .lookup("local-mirror", &coordinate)
            .unwrap()
            .unwrap();
        assert_eq!(entry.checksum.as_deref(), Some(&format!("sha1:{HELLO_SHA1}")[..]));

        let kinds = fx.events.kinds.lock().unwrap();
        assert_eq!(
            *kinds,
            vec![
                TransferEventKind::Started,
                TransferEventKind::Progressed,
                TransferEventKind::Succeeded,
            ]
        );
    }

    #[tokio::test]
    async fn test_checksum_mismatch_discards_download() {
        let fx = fixture(ChecksumPolicy::Fail);
        let coordinate = Coordinate::new("com.acme", "lib", "1.0").unwrap();
        seed_artifact(&fx.remote_root, &coordinate, b"hello world", Some("def456"));

        let connector = FileConnector::new(&fx.session, &fx.repository).unwrap();
        let destination = fx.session.artifact_destination(&coordinate);
        let report = connector
            .get(
                vec![ArtifactDownload::new(coordinate.clone(), &destination)],
                vec![],
            )
            .await
            .unwrap();

        assert!(matches!(
            report.results[0].outcome,
            TransferOutcome::ChecksumMismatch(_)
        ));
        assert!(!destination.exists());
        assert!(!part_path(&destination).exists());
        assert!(
            fx.session
                .cache()
                .lookup("local-mirror", &coordinate)
                .unwrap()
                .is_none()
        );

        let kinds = fx.events.kinds.lock().unwrap();
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == TransferEventKind::Corrupted)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_item_does_not_block_siblings() {
        let fx = fixture(ChecksumPolicy::Warn);
        let present = Coordinate::new("com.acme", "lib", "1.0").unwrap();
        let absent = Coordinate::new("com.acme", "ghost", "9.9").unwrap();
        seed_artifact(&fx.remote_root, &present, b"hello world", Some(HELLO_SHA1));

        let connector = FileConnector::new(&fx.session, &fx.repository).unwrap();
        let report = connector
            .get(
                vec![
                    ArtifactDownload::new(
                        absent.clone(),
                        fx.session.artifact_destination(&absent),
                    ),
                    ArtifactDownload::new(
                        present.clone(),
                        fx.session.artifact_destination(&present),
                    ),
                ],
                vec![],
            )
            .await
            .unwrap();

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].outcome, TransferOutcome::NotFound);
        assert!(report.results[1].outcome.is_success());
    }

    #[tokio::test]
    async fn test_put_writes_artifact_and_sidecar() {
        let fx = fixture(ChecksumPolicy::Warn);
        let coordinate = Coordinate::new("com.acme", "lib", "1.0").unwrap();

        let source = fx.session.local_root().join("staging.tgz");
        std::fs::write(&source, b"hello world").unwrap();

        let connector = FileConnector::new(&fx.session, &fx.repository).unwrap();
        let report = connector
            .put(
                vec![ArtifactUpload::new(coordinate.clone(), &source)],
                vec![],
            )
            .await
            .unwrap();
        assert!(!report.has_failures());

        let stored = fx.remote_root.join(coordinate.repository_path());
        assert_eq!(std::fs::read(&stored).unwrap(), b"hello world");
        let sidecar = std::fs::read_to_string(sidecar_path(&stored, Algorithm::Sha1)).unwrap();
        assert_eq!(sidecar.trim(), HELLO_SHA1);
    }

    #[tokio::test]
    async fn test_use_after_close() {
        let fx = fixture(ChecksumPolicy::Warn);
        let connector = FileConnector::new(&fx.session, &fx.repository).unwrap();

        connector.close().unwrap();
        assert!(matches!(
            connector.close(),
            Err(TransferError::ConnectorClosed { .. })
        ));
        assert!(matches!(
            connector.get(vec![], vec![]).await,
            Err(TransferError::ConnectorClosed { .. })
        ));
    }
}

//! Transfer engine
//!
//! Executes a batch of transfer items concurrently against a bounded
//! pool. Each item independently acquires a pool slot, streams its
//! bytes, retries transient failures with exponential backoff and is
//! checksum-verified before it reaches its final path. One item's
//! failure never blocks its siblings; the batch call returns once every
//! item holds a terminal outcome.
//!
//! Downloads land in `<destination>.part` and are renamed into place
//! only after verification. Partial files survive transient transport
//! failures (so a later attempt can resume with a range request) but
//! are discarded on cancellation and on checksum mismatch.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use url::Url;

use lodestone_core::{
    ChecksumPolicy, Coordinate, LocalCache, RemoteRepository, Session, TransferConfig,
    TransferDirection, TransferEvent, TransferEventKind, TransferResource,
};

use crate::digest::{self, Algorithm, Digester};
use crate::error::{Result, TransferError};
use crate::events::EventBus;
use crate::http::HttpTransport;
use crate::request::{
    ArtifactDownload, ArtifactUpload, BatchReport, MetadataDownload, MetadataUpload,
    TransferOutcome, TransferResult,
};

const UPLOAD_CHUNK: usize = 64 * 1024;

/// Path a download is staged at until it passes verification.
pub(crate) fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Terminal event kind for an outcome.
pub(crate) fn terminal_kind(outcome: &TransferOutcome) -> TransferEventKind {
    match outcome {
        TransferOutcome::Success => TransferEventKind::Succeeded,
        TransferOutcome::ChecksumMismatch(_) => TransferEventKind::Corrupted,
        _ => TransferEventKind::Failed,
    }
}

/// Cause string carried by a terminal failure event.
pub(crate) fn failure_message(outcome: &TransferOutcome) -> Option<String> {
    match outcome {
        TransferOutcome::Success => None,
        TransferOutcome::ChecksumMismatch(failure) => Some(failure.to_string()),
        TransferOutcome::NotFound => Some("resource not found".to_string()),
        TransferOutcome::TransportFailure { message, .. } => Some(message.clone()),
        TransferOutcome::Cancelled => Some("deadline exceeded".to_string()),
    }
}

/// Checksum recorded in the local cache, strongest-preference order.
pub(crate) fn checksum_for_cache(actual: &HashMap<Algorithm, String>) -> Option<String> {
    Algorithm::ALL
        .iter()
        .find_map(|a| actual.get(a).map(|hex| format!("{a}:{hex}")))
}

/// Run `work` under the item's overall deadline, which covers waiting
/// for a pool slot as well as the transfer itself.
pub(crate) async fn with_deadline<T, F>(deadline: Option<Duration>, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Cancelled { deadline }),
        },
        None => work.await,
    }
}

fn next_backoff(current: Duration, config: &TransferConfig) -> Duration {
    current
        .mul_f64(config.backoff_factor.max(1.0))
        .min(config.max_backoff)
}

struct DownloadItem {
    resource: TransferResource,
    destination: PathBuf,
    expected: HashMap<Algorithm, String>,
    timeout: Option<Duration>,
    /// Present for artifacts, which are recorded in the local cache
    cache_key: Option<Coordinate>,
}

struct UploadItem {
    resource: TransferResource,
    source: PathBuf,
    expected: HashMap<Algorithm, String>,
    timeout: Option<Duration>,
}

struct Shared {
    repository: RemoteRepository,
    transport: Arc<HttpTransport>,
    session_id: String,
    cache: Arc<LocalCache>,
    bus: EventBus,
    config: TransferConfig,
    pool: Semaphore,
}

impl Shared {
    fn publish(
        &self,
        kind: TransferEventKind,
        resource: &TransferResource,
        direction: TransferDirection,
        transferred: u64,
        total: Option<u64>,
        error: Option<String>,
    ) {
        let mut builder = TransferEvent::builder(
            kind,
            self.session_id.clone(),
            self.repository.id().to_string(),
            resource.clone(),
            direction,
        )
        .transferred(transferred);
        if let Some(total) = total {
            builder = builder.total(total);
        }
        if let Some(error) = error {
            builder = builder.error(error);
        }
        self.bus.publish(builder.build());
    }

    async fn acquire_slot(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.pool
            .acquire()
            .await
            .map_err(|_| TransferError::Network {
                message: "transfer pool closed".to_string(),
            })
    }
}

/// Concurrent batch executor owned by one network-capable connector.
pub(crate) struct TransferEngine {
    shared: Arc<Shared>,
}

impl TransferEngine {
    pub(crate) fn new(
        session: &Session,
        repository: RemoteRepository,
        transport: Arc<HttpTransport>,
    ) -> Self {
        let config = session.config().clone();
        Self {
            shared: Arc::new(Shared {
                repository,
                transport,
                session_id: session.id().to_string(),
                cache: session.cache().clone(),
                bus: EventBus::for_session(session),
                pool: Semaphore::new(config.pool_size.max(1)),
                config,
            }),
        }
    }

    /// Download a batch. Returns once every item is terminal.
    pub(crate) async fn get(
        &self,
        artifacts: Vec<ArtifactDownload>,
        metadata: Vec<MetadataDownload>,
    ) -> BatchReport {
        let mut items = Vec::new();
        for download in artifacts {
            items.push(DownloadItem {
                resource: TransferResource::Artifact(download.coordinate.clone()),
                destination: download.destination,
                expected: download.expected_digests,
                timeout: download.timeout,
                cache_key: Some(download.coordinate),
            });
        }
        for download in metadata {
            items.push(DownloadItem {
                resource: TransferResource::Metadata(download.metadata),
                destination: download.destination,
                expected: HashMap::new(),
                timeout: download.timeout,
                cache_key: None,
            });
        }

        // Concurrent writes to one destination are serialized; after the
        // first success the later duplicate becomes a cache hit.
        let mut locks: HashMap<PathBuf, Arc<Mutex<bool>>> = HashMap::new();
        for item in &items {
            locks
                .entry(item.destination.clone())
                .or_insert_with(|| Arc::new(Mutex::new(false)));
        }

        let resources: Vec<TransferResource> = items.iter().map(|i| i.resource.clone()).collect();
        let mut tasks = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let shared = self.shared.clone();
            let lock = locks[&item.destination].clone();
            tasks.spawn(async move { (index, run_download(shared, item, lock).await) });
        }

        collect(tasks, resources, TransferDirection::Get).await
    }

    /// Upload a batch. Returns once every item is terminal.
    pub(crate) async fn put(
        &self,
        artifacts: Vec<ArtifactUpload>,
        metadata: Vec<MetadataUpload>,
    ) -> BatchReport {
        let mut items = Vec::new();
        for upload in artifacts {
            items.push(UploadItem {
                resource: TransferResource::Artifact(upload.coordinate),
                source: upload.source,
                expected: upload.expected_digests,
                timeout: upload.timeout,
            });
        }
        for upload in metadata {
            items.push(UploadItem {
                resource: TransferResource::Metadata(upload.metadata),
                source: upload.source,
                expected: HashMap::new(),
                timeout: upload.timeout,
            });
        }

        let resources: Vec<TransferResource> = items.iter().map(|i| i.resource.clone()).collect();
        let mut tasks = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let shared = self.shared.clone();
            tasks.spawn(async move { (index, run_upload(shared, item).await) });
        }

        collect(tasks, resources, TransferDirection::Put).await
    }
}

/// Drain the task set into per-item results in submission order. A
/// panicked task still yields a terminal outcome for its item.
async fn collect(
    mut tasks: JoinSet<(usize, TransferResult)>,
    resources: Vec<TransferResource>,
    direction: TransferDirection,
) -> BatchReport {
    let mut slots: Vec<Option<TransferResult>> = resources.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(e) => tracing::error!("transfer task did not complete: {e}"),
        }
    }

    let results = slots
        .into_iter()
        .zip(resources)
        .map(|(slot, resource)| {
            slot.unwrap_or_else(|| TransferResult {
                resource,
                direction,
                outcome: TransferOutcome::TransportFailure {
                    message: "transfer task aborted".to_string(),
                    transient: false,
                },
                attempts: 0,
                transferred: 0,
                from_cache: false,
            })
        })
        .collect();
    BatchReport { results }
}

async fn run_download(
    shared: Arc<Shared>,
    item: DownloadItem,
    lock: Arc<Mutex<bool>>,
) -> TransferResult {
    let mut completed = lock.lock().await;
    if *completed {
        // A sibling in this batch already produced this file.
        return cache_hit(&item);
    }

    if let Some(coordinate) = &item.cache_key
        && let Ok(Some(entry)) = shared.cache.lookup(shared.repository.id(), coordinate)
        && LocalCache::is_up_to_date(&entry, shared.repository.update_policy())
        && item.destination.exists()
    {
        *completed = true;
        return cache_hit(&item);
    }

    let attempts = AtomicU32::new(0);
    match item.timeout {
        Some(deadline) => {
            let work = execute_download(&shared, &item, &attempts, &mut *completed);
            match tokio::time::timeout(deadline, work).await {
                Ok(result) => result,
                Err(_) => {
                    tokio::fs::remove_file(part_path(&item.destination))
                        .await
                        .ok();
                    cancelled_result(&shared, item.resource, &attempts, TransferDirection::Get)
                }
            }
        }
        None => execute_download(&shared, &item, &attempts, &mut *completed).await,
    }
}



fn cache_hit(item: &DownloadItem) -> TransferResult {
    TransferResult {
        resource: item.resource.clone(),
        direction: TransferDirection::Get,
        outcome: TransferOutcome::Success,
        attempts: 0,
        transferred: 0,
        from_cache: true,
    }
}

fn cancelled_result(
    shared: &Shared,
    resource: TransferResource,
    attempts: &AtomicU32,
    direction: TransferDirection,
) -> TransferResult {
    let outcome = TransferOutcome::Cancelled;
    shared.publish(
        terminal_kind(&outcome),
        &resource,
        direction,
        0,
        None,
        failure_message(&outcome),
    );
    TransferResult {
        resource,
        direction,
        outcome,
        attempts: attempts.load(Ordering::Relaxed).max(1),
        transferred: 0,
        from_cache: false,
    }
}

/// Acquire a slot, run the transfer and publish the terminal event
/// before the slot is released, so observers never see more than
/// `pool_size` transfers between Started and a terminal event.
async fn execute_download(
    shared: &Shared,
    item: &DownloadItem,
    attempts: &AtomicU32,
    completed: &mut bool,
) -> TransferResult {
    let permit = shared.acquire_slot().await;
    let (outcome, transferred) = match &permit {
        Err(_) => (
            TransferOutcome::TransportFailure {
                message: "transfer pool closed".to_string(),
                transient: false,
            },
            0,
        ),
        Ok(_) => {
            shared.publish(
                TransferEventKind::Started,
                &item.resource,
                TransferDirection::Get,
                0,
                None,
                None,
            );
            match download_attempts(shared, item, attempts).await {
                Ok((transferred, checksum)) => {
                    if let Some(coordinate) = &item.cache_key
                        && let Err(e) = shared.cache.record(
                            shared.repository.id(),
                            coordinate,
                            &item.destination,
                            checksum.as_deref(),
                        )
                    {
                        tracing::warn!("failed to record verified download: {e}");
                    }
                    *completed = true;
                    (TransferOutcome::Success, transferred)
                }
                Err(error) => {
                    if matches!(
                        error,
                        TransferError::ChecksumMismatch(_)
                            | TransferError::ChecksumUnavailable { .. }
                    ) {
                        tokio::fs::remove_file(part_path(&item.destination))
                            .await
                            .ok();
                    }
                    (TransferOutcome::from_error(error), 0)
                }
            }
        }
    };

    shared.publish(
        terminal_kind(&outcome),
        &item.resource,
        TransferDirection::Get,
        transferred,
        None,
        failure_message(&outcome),
    );

    let result = TransferResult {
        resource: item.resource.clone(),
        direction: TransferDirection::Get,
        outcome,
        attempts: attempts.load(Ordering::Relaxed).max(1),
        transferred,
        from_cache: false,
    };
    drop(permit);
    result
}

/// Iterative retry loop; only transient failures are retried.
async fn download_attempts(
    shared: &Shared,
    item: &DownloadItem,
    attempts: &AtomicU32,
) -> Result<(u64, Option<String>)> {
    let mut backoff = shared.config.initial_backoff;
    loop {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        match download_once(shared, item).await {
            Ok(done) => return Ok(done),
            Err(error) if error.is_transient() && attempt < shared.config.max_attempts => {
                tracing::warn!(
                    resource = %item.resource,
                    attempt,
                    "transient transfer failure, retrying: {error}"
                );
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, &shared.config);
            }
            Err(error) => return Err(error),
        }
    }
}

async fn download_once(shared: &Shared, item: &DownloadItem) -> Result<(u64, Option<String>)> {
    let destination = &item.destination;
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = part_path(destination);

    let mut offset = 0u64;
    if shared.config.resume_downloads
        && let Ok(meta) = tokio::fs::metadata(&part).await
    {
        offset = meta.len();
    }

    let url = shared
        .transport
        .url_for(&item.resource.repository_path())?;
    let response = shared
        .transport
        .get(url.clone(), (offset > 0).then_some(offset))
        .await?;

    // A server that ignores the range request restarts the download.
    let resumed = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
    let total = response
        .content_length()
        .map(|len| if resumed { len + offset } else { len });

    let mut file = if resumed {
        tokio::fs::OpenOptions::new().append(true).open(&part).await?
    } else {
        tokio::fs::File::create(&part).await?
    };
    let mut transferred = if resumed { offset } else { 0 };

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        // Transient stream errors leave the partial file behind as
        // fuel for a resumed retry.
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        transferred += chunk.len() as u64;
        shared.publish(
            TransferEventKind::Progressed,
            &item.resource,
            TransferDirection::Get,
            transferred,
            total,
            None,
        );
    }
    file.sync_all().await?;
    drop(file);

    let mut recorded = None;
    if let Some(expected) = resolve_expected(shared, item, &url).await? {
        // The whole file is verified, not just the resumed tail.
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

/// Digests a download must match: the caller's, or the repository's
/// published sidecars, subject to the checksum policy.
async fn resolve_expected(
    shared: &Shared,
    item: &DownloadItem,
    url: &Url,
) -> Result<Option<HashMap<Algorithm, String>>> {
    if !item.expected.is_empty() {
        return Ok(Some(item.expected.clone()));
    }
    match shared.repository.checksum_policy() {
        ChecksumPolicy::Ignore => Ok(None),
        policy => {
            for algorithm in Algorithm::ALL {
                let Ok(sidecar) = sidecar_url(url, algorithm) else {
                    continue;
                };
                match shared.transport.get(sidecar, None).await {
                    Ok(response) => {
                        if let Ok(text) = response.text().await
                            && let Some(hex) = digest::parse_sidecar(&text)
                        {
                            return Ok(Some(HashMap::from([(algorithm, hex)])));
                        }
                    }
                    Err(TransferError::NotFound { .. }) => {}
                    Err(error) => {
                        tracing::debug!(
                            resource = %item.resource,
                            %algorithm,
                            "checksum sidecar unreachable: {error}"
                        );
                    }
                }
            }
            if policy == ChecksumPolicy::Fail {
                Err(TransferError::ChecksumUnavailable {
                    resource: item.resource.to_string(),
                })
            } else {
                tracing::warn!(
                    resource = %item.resource,
                    "no checksum published for resource, accepting unverified"
                );
                Ok(None)
            }
        }
    }
}

/// Sidecar resource URL: `<url>.<algorithm>`.
fn sidecar_url(url: &Url, algorithm: Algorithm) -> Result<Url> {
    Url::parse(&format!("{}.{}", url, algorithm.file_extension())).map_err(|e| {
        TransferError::MalformedResponse {
            url: url.to_string(),
            reason: format!("cannot derive sidecar url: {e}"),
        }
    })
}

async fn run_upload(shared: Arc<Shared>, item: UploadItem) -> TransferResult {
    let attempts = AtomicU32::new(0);
    match item.timeout {
        Some(deadline) => {
            let work = execute_upload(&shared, &item, &attempts);
            match tokio::time::timeout(deadline, work).await {
                Ok(result) => result,
                Err(_) => {
                    cancelled_result(&shared, item.resource, &attempts, TransferDirection::Put)
                }
            }
        }
        None => execute_upload(&shared, &item, &attempts).await,
    }
}

/// Slot, Started, attempts, terminal event, in that order; the slot is
/// held until the terminal event is out.
async fn execute_upload(
    shared: &Shared,
    item: &UploadItem,
    attempts: &AtomicU32,
) -> TransferResult {
    let permit = shared.acquire_slot().await;
    let (outcome, transferred) = match &permit {
        Err(_) => (
            TransferOutcome::TransportFailure {
                message: "transfer pool closed".to_string(),
                transient: false,
            },
            0,
        ),
        Ok(_) => {
            shared.publish(
                TransferEventKind::Started,
                &item.resource,
                TransferDirection::Put,
                0,
                None,
                None,
            );
            match upload_prepared(shared, item, attempts).await {
                Ok(transferred) => (TransferOutcome::Success, transferred),
                Err(error) => (TransferOutcome::from_error(error), 0),
            }
        }
    };

    shared.publish(
        terminal_kind(&outcome),
        &item.resource,
        TransferDirection::Put,
        transferred,
        None,
        failure_message(&outcome),
    );

    let result = TransferResult {
        resource: item.resource.clone(),
        direction: TransferDirection::Put,
        outcome,
        attempts: attempts.load(Ordering::Relaxed).max(1),
        transferred,
        from_cache: false,
    };
    drop(permit);
    result
}

async fn upload_prepared(shared: &Shared, item: &UploadItem, attempts: &AtomicU32) -> Result<u64> {
    let data = Arc::new(tokio::fs::read(&item.source).await?);

    let mut algorithms: Vec<Algorithm> = item.expected.keys().copied().collect();
    if !algorithms.contains(&Algorithm::Sha1) {
        algorithms.push(Algorithm::Sha1);
    }
    let mut digester = Digester::new(&algorithms);
    digester.update(&data);
    let actual = digester.finish();

    upload_attempts(shared, item, &data, &actual, attempts).await
}

async fn upload_attempts(
    shared: &Shared,
    item: &UploadItem,
    data: &Arc<Vec<u8>>,
    actual: &HashMap<Algorithm, String>,
    attempts: &AtomicU32,
) -> Result<u64> {
    let mut backoff = shared.config.initial_backoff;
    loop {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        match upload_once(shared, item, data, actual).await {
            Ok(transferred) => return Ok(transferred),
            Err(error) if error.is_transient() && attempt < shared.config.max_attempts => {
                tracing::warn!(
                    resource = %item.resource,
                    attempt,
                    "transient upload failure, retrying: {error}"
                );
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, &shared.config);
            }
            Err(error) => return Err(error),
        }
    }
}

async fn upload_once(
    shared: &Shared,
    item: &UploadItem,
    data: &Arc<Vec<u8>>,
    actual: &HashMap<Algorithm, String>,
) -> Result<u64> {
    let url = shared
        .transport
        .url_for(&item.resource.repository_path())?;

    let body = {
        let sink = progress_sink(shared);
        let resource = item.resource.clone();
        let data = data.clone();
        move || progress_body(sink.clone(), resource.clone(), data.clone())
    };
    shared.transport.put(url.clone(), body).await?;

    // The upload is only accepted once the recomputed digest matches.
    if !item.expected.is_empty()
        && let Err(failure) = digest::verify(actual, &item.expected)
    {
        return Err(TransferError::ChecksumMismatch(failure));
    }

    // Publish sidecar checksums next to the artifact.
    for algorithm in Algorithm::ALL {
        if let Some(hex) = actual.get(&algorithm) {
            let sidecar = sidecar_url(&url, algorithm)?;
            let payload = format!("{hex}\n");
            shared
                .transport
                .put(sidecar, move || reqwest::Body::from(payload.clone()))
                .await?;
        }
    }

    Ok(data.len() as u64)
}

fn progress_sink(shared: &Shared) -> Arc<ProgressSink> {
    Arc::new(ProgressSink {
        bus: shared.bus.clone(),
        session_id: shared.session_id.clone(),
        repository_id: shared.repository.id().to_string(),
    })
}

/// Owned slice of engine state a request body can carry into hyper.
struct ProgressSink {
    bus: EventBus,
    session_id: String,
    repository_id: String,
}

impl ProgressSink {
    fn publish(&self, resource: &TransferResource, transferred: u64, total: u64) {
        self.bus.publish(
            TransferEvent::builder(
                TransferEventKind::Progressed,
                self.session_id.clone(),
                self.repository_id.clone(),
                resource.clone(),
                TransferDirection::Put,
            )
            .transferred(transferred)
            .total(total)
            .build(),
        );
    }
}

/// Chunked upload body that reports progress as hyper pulls it.
fn progress_body(
    sink: Arc<ProgressSink>,
    resource: TransferResource,
    data: Arc<Vec<u8>>,
) -> reqwest::Body {
    let total = data.len() as u64;
    let offsets: Vec<usize> = (0..data.len()).step_by(UPLOAD_CHUNK).collect();
    let mut sent: u64 = 0;
    let stream = futures::stream::iter(offsets.into_iter().map(move |start| {
        let end = usize::min(start + UPLOAD_CHUNK, data.len());
        let chunk = data[start..end].to_vec();
        sent += chunk.len() as u64;
        sink.publish(&resource, sent, total);
        Ok::<Vec<u8>, std::io::Error>(chunk)
    }));
    reqwest::Body::wrap_stream(stream)
}

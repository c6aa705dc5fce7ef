//! Transfer sessions
//!
//! A [`Session`] carries everything a connector needs beyond the
//! repository itself: the local repository root and layout, the ordered
//! repository list, the listeners receiving transfer events, the shared
//! verified-download cache and the transfer tuning knobs. Listeners are
//! registered at build time only; the built session is immutable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::LocalCache;
use crate::coordinate::{Coordinate, MetadataRef};
use crate::error::Result;
use crate::event::TransferListener;
use crate::layout::{HierarchicalLayout, LocalLayout};
use crate::repository::{RemoteRepository, merge_repositories};

/// Tuning knobs for the transfer engine. All of these are configurable
/// defaults, not contracts.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Concurrent transfers per connector
    pub pool_size: usize,

    /// Total attempts per item, including the first
    pub max_attempts: u32,

    /// Backoff before the second attempt
    pub initial_backoff: Duration,

    /// Multiplier applied to the backoff after each failed attempt
    pub backoff_factor: f64,

    /// Ceiling for the backoff between attempts
    pub max_backoff: Duration,

    /// Per-request network timeout
    pub request_timeout: Duration,

    /// Resume interrupted downloads from partial files when the server
    /// supports range requests
    pub resume_downloads: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            resume_downloads: true,
        }
    }
}

/// Immutable context shared by every connector of one resolution run.
pub struct Session {
    id: String,
    local_root: PathBuf,
    layout: Arc<dyn LocalLayout>,
    repositories: Vec<RemoteRepository>,
    listeners: Vec<Arc<dyn TransferListener>>,
    cache: Arc<LocalCache>,
    config: TransferConfig,
}

impl Session {
    pub fn builder(local_root: impl Into<PathBuf>) -> SessionBuilder {
        SessionBuilder {
            id: "default".to_string(),
            local_root: local_root.into(),
            layout: None,
            repositories: Vec::new(),
            listeners: Vec::new(),
            cache: None,
            config: TransferConfig::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn layout(&self) -> &Arc<dyn LocalLayout> {
        &self.layout
    }

    /// Repositories in resolution order, deduplicated by id.
    pub fn repositories(&self) -> &[RemoteRepository] {
        &self.repositories
    }

    pub fn repository(&self, id: &str) -> Option<&RemoteRepository> {
        self.repositories.iter().find(|r| r.id() == id)
    }

    pub fn listeners(&self) -> &[Arc<dyn TransferListener>] {
        &self.listeners
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Absolute local path an artifact download lands at.
    pub fn artifact_destination(&self, coordinate: &Coordinate) -> PathBuf {
        self.local_root.join(self.layout.artifact_path(coordinate))
    }

    /// Absolute local path a metadata download lands at.
    pub fn metadata_destination(&self, metadata: &MetadataRef) -> PathBuf {
        self.local_root.join(self.layout.metadata_path(metadata))
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    id: String,
    local_root: PathBuf,
    layout: Option<Arc<dyn LocalLayout>>,
    repositories: Vec<RemoteRepository>,
    listeners: Vec<Arc<dyn TransferListener>>,
    cache: Option<Arc<LocalCache>>,
    config: TransferConfig,
}

impl SessionBuilder {
    /// Session identity, used to scope connector bindings.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn layout(mut self, layout: Arc<dyn LocalLayout>) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn repository(mut self, repository: RemoteRepository) -> Self {
        self.repositories.push(repository);
        self
    }

    pub fn repositories(mut self, repositories: impl IntoIterator<Item = RemoteRepository>) -> Self {
        self.repositories.extend(repositories);
        self
    }

    /// Register a transfer listener. Fan-out order is registration
    /// order.
    pub fn listener(mut self, listener: Arc<dyn TransferListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn cache(mut self, cache: Arc<LocalCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the session. Creates the local root if needed and opens
    /// the per-session cache next to it unless one was supplied.
    pub fn build(self) -> Result<Session> {
        std::fs::create_dir_all(&self.local_root)?;

        let cache = match self.cache {
            Some(cache) => cache,
            None => Arc::new(LocalCache::open_at(&self.local_root.join(".transfers.db"))?),
        };

        Ok(Session {
            id: self.id,
            local_root: self.local_root,
            layout: self
                .layout
                .unwrap_or_else(|| Arc::new(HierarchicalLayout)),
            repositories: merge_repositories(self.repositories),
            listeners: self.listeners,
            cache,
            config: self.config,
        })
    }
}

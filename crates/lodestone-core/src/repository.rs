//! Remote repository descriptions
//!
//! A [`RemoteRepository`] is immutable once constructed: the URL is
//! validated and the protocol scheme derived up front, so connector
//! selection never has to guess. A [`RepositorySet`] keeps an ordered,
//! id-deduplicated list of repositories and can be loaded from and saved
//! to a YAML definition file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CoreError, Result};

/// How often a cached artifact is re-checked against the remote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    /// Re-fetch on every request
    Always,

    /// Re-check once per UTC calendar day
    #[default]
    Daily,

    /// Never re-check while a verified copy exists
    Never,
}

/// How strictly published checksums are enforced on downloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    /// Missing or mismatching checksum fails the transfer
    Fail,

    /// Missing checksum is logged, mismatch still fails
    #[default]
    Warn,

    /// Checksums are not consulted at all
    Ignore,
}

/// A resolved username/password pair.
///
/// Acquisition and storage of credentials is the embedder's concern;
/// this type only carries an already-resolved pair to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    pub username: String,
    pub password: String,
}

impl Authentication {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value for the `Authorization` header.
    pub fn auth_header(&self) -> String {
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            format!("{}:{}", self.username, self.password),
        );
        format!("Basic {encoded}")
    }
}

/// Description of one remote repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRepository {
    id: String,

    url: String,

    /// Lowercased URL scheme, derived from the URL
    #[serde(default)]
    protocol: String,

    /// Credentials are never written to the definition file
    #[serde(skip)]
    authentication: Option<Authentication>,

    #[serde(default)]
    update_policy: UpdatePolicy,

    #[serde(default)]
    checksum_policy: ChecksumPolicy,
}

impl RemoteRepository {
    /// Create a repository description, validating the URL and deriving
    /// the protocol. Performs no I/O.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let url = url.into();
        if id.is_empty() {
            return Err(CoreError::InvalidRepositoryUrl {
                url,
                reason: "repository id must not be empty".to_string(),
            });
        }
        let parsed = Url::parse(&url).map_err(|e| CoreError::InvalidRepositoryUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            id,
            url,
            protocol: parsed.scheme().to_ascii_lowercase(),
            authentication: None,
            update_policy: UpdatePolicy::default(),
            checksum_policy: ChecksumPolicy::default(),
        })
    }

    pub fn with_authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = Some(authentication);
        self
    }

    pub fn with_update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.update_policy = policy;
        self
    }

    pub fn with_checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum_policy = policy;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Lowercased URL scheme, e.g. `https` or `file`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn authentication(&self) -> Option<&Authentication> {
        self.authentication.as_ref()
    }

    pub fn update_policy(&self) -> UpdatePolicy {
        self.update_policy
    }

    pub fn checksum_policy(&self) -> ChecksumPolicy {
        self.checksum_policy
    }
}

/// Merge repository lists preserving order; later duplicates of an id
/// are dropped (first definition wins).
pub fn merge_repositories(
    repositories: impl IntoIterator<Item = RemoteRepository>,
) -> Vec<RemoteRepository> {
    let mut merged: Vec<RemoteRepository> = Vec::new();
    for repository in repositories {
        if merged.iter().any(|r| r.id == repository.id) {
            tracing::debug!(id = %repository.id, "dropping duplicate repository definition");
            continue;
        }
        merged.push(repository);
    }
    merged
}

fn default_api_version() -> String {
    "lodestone.dev/v1".to_string()
}

/// Repository definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySet {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default)]
    repositories: Vec<RemoteRepository>,
}

impl Default for RepositorySet {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            repositories: Vec::new(),
        }
    }
}

impl RepositorySet {
    /// Load definitions from a YAML file. URLs are re-validated and
    /// protocols re-derived, so hand-edited files fail fast here.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut set: Self = serde_yaml::from_str(&content)?;
        for repository in &mut set.repositories {
            let parsed =
                Url::parse(&repository.url).map_err(|e| CoreError::InvalidRepositoryUrl {
                    url: repository.url.clone(),
                    reason: e.to_string(),
                })?;
            repository.protocol = parsed.scheme().to_ascii_lowercase();
        }
        set.repositories = merge_repositories(set.repositories);
        Ok(set)
    }

    /// Save definitions to a YAML file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Add a repository; duplicate ids are rejected.
    pub fn add(&mut self, repository: RemoteRepository) -> Result<()> {
        if self.get(&repository.id).is_some() {
            return Err(CoreError::RepositoryAlreadyExists {
                id: repository.id.clone(),
            });
        }
        self.repositories.push(repository);
        Ok(())
    }

    /// Merge another ordered list into this one, first definition wins.
    pub fn merge(&mut self, repositories: impl IntoIterator<Item = RemoteRepository>) {
        let combined = self.repositories.drain(..).chain(repositories);
        self.repositories = merge_repositories(combined);
    }

    pub fn get(&self, id: &str) -> Option<&RemoteRepository> {
        self.repositories.iter().find(|r| r.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Result<RemoteRepository> {
        let idx = self
            .repositories
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| CoreError::RepositoryNotFound { id: id.to_string() })?;
        Ok(self.repositories.remove(idx))
    }

    pub fn repositories(&self) -> &[RemoteRepository] {
        &self.repositories
    }
}

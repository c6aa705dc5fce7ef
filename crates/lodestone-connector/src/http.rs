//! Async HTTP connector
//!
//! Owns a reqwest client with automatic redirects disabled: redirects
//! are followed manually so credentials are never forwarded across
//! origins. Batches are delegated to the transfer engine, which runs
//! items concurrently against the session's pool bound.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::{Method, StatusCode, header};
use url::Url;

use lodestone_core::{CoreError, RemoteRepository, Session, TransferConfig};

use crate::connector::Connector;
use crate::engine::TransferEngine;
use crate::error::{Result, TransferError};
use crate::registry::ConnectorFactory;
use crate::request::{
    ArtifactDownload, ArtifactUpload, BatchReport, MetadataDownload, MetadataUpload,
};

const MAX_REDIRECTS: u32 = 10;

/// Factory for `http://` and `https://` repositories.
pub struct HttpConnectorFactory;

impl ConnectorFactory for HttpConnectorFactory {
    fn priority(&self) -> i32 {
        5
    }

    fn supports(&self, repository: &RemoteRepository) -> bool {
        repository.protocol().eq_ignore_ascii_case("http")
            || repository.protocol().eq_ignore_ascii_case("https")
    }

    fn new_connector(
        &self,
        session: &Session,
        repository: &RemoteRepository,
    ) -> Result<Box<dyn Connector>> {
        Ok(Box::new(HttpConnector::new(session, repository)?))
    }
}

/// HTTP client bound to one repository, with same-origin credential
/// discipline.
pub(crate) struct HttpTransport {
    client: reqwest::Client,
    base: Url,
    auth_header: Option<String>,
}

impl HttpTransport {
    pub(crate) fn new(repository: &RemoteRepository, config: &TransferConfig) -> Result<Self> {
        let mut base = Url::parse(repository.url()).map_err(|e| CoreError::InvalidRepositoryUrl {
            url: repository.url().to_string(),
            reason: e.to_string(),
        })?;
        // Url::join treats the last path segment as a file unless the
        // base ends with a slash.
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        let client = reqwest::Client::builder()
            // Redirects are handled manually to keep credentials from
            // leaking cross-origin.
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.request_timeout)
            .user_agent(concat!("lodestone/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransferError::Network {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base,
            auth_header: repository.authentication().map(|a| a.auth_header()),
        })
    }

    /// Absolute URL of a repository-relative resource path.
    pub(crate) fn url_for(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| TransferError::MalformedResponse {
                url: self.base.to_string(),
                reason: format!("cannot resolve resource path '{path}': {e}"),
            })
    }

    fn same_origin(a: &Url, b: &Url) -> bool {
        a.scheme() == b.scheme()
            && a.host() == b.host()
            && a.port_or_known_default() == b.port_or_known_default()
    }

    /// GET a resource, optionally resuming from a byte offset.
    pub(crate) async fn get(
        &self,
        url: Url,
        resume_from: Option<u64>,
    ) -> Result<reqwest::Response> {
        self.execute(Method::GET, url, resume_from, None).await
    }

    /// PUT a resource. The body is rebuilt per redirect hop.
    pub(crate) async fn put(
        &self,
        url: Url,
        body: impl Fn() -> reqwest::Body + Send + Sync,
    ) -> Result<reqwest::Response> {
        let body: &(dyn Fn() -> reqwest::Body + Send + Sync) = &body;
        self.execute(Method::PUT, url, None, Some(body)).await
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        resume_from: Option<u64>,
        body: Option<&(dyn Fn() -> reqwest::Body + Send + Sync)>,
    ) -> Result<reqwest::Response> {
        let origin = url.clone();
        let mut current = url;
        let mut redirects = 0;

        loop {
            let mut request = self.client.request(method.clone(), current.clone());

            // Credentials only travel to the origin they were scoped to.
            if Self::same_origin(&origin, &current) {
                if let Some(auth) = &self.auth_header {
                    request = request.header(header::AUTHORIZATION, auth);
                }
            } else {
                tracing::warn!(
                    from = %origin,
                    to = %current,
                    "cross-origin redirect, credentials not forwarded"
                );
            }
            if let Some(offset) = resume_from {
                request = request.header(header::RANGE, format!("bytes={offset}-"));
            }
            if let Some(body) = body {
                request = request.body(body());
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_redirection() {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(TransferError::Network {
                        message: format!("too many redirects (max {MAX_REDIRECTS})"),
                    });
                }
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| TransferError::MalformedResponse {
                        url: current.to_string(),
                        reason: "redirect without Location header".to_string(),
                    })?;
                current = current
                    .join(location)
                    .map_err(|e| TransferError::MalformedResponse {
                        url: current.to_string(),
                        reason: format!("invalid redirect target: {e}"),
                    })?;
                continue;
            }

            if status == StatusCode::NOT_FOUND {
                return Err(TransferError::NotFound {
                    url: current.to_string(),
                });
            }
            if status == StatusCode::UNAUTHORIZED {
                return Err(TransferError::Unauthorized {
                    url: current.to_string(),
                });
            }
            if status == StatusCode::FORBIDDEN {
                return Err(TransferError::Forbidden {
                    url: current.to_string(),
                });
            }
            if !status.is_success() {
                return Err(TransferError::Http {
                    status: status.as_u16(),
                    url: current.to_string(),
                });
            }

            return Ok(response);
        }
    }
}

/// Connector for HTTP-class repositories.
pub struct HttpConnector {
    repository: RemoteRepository,
    engine: TransferEngine,
    closed: AtomicBool,
}

impl HttpConnector {
    /// Bind to a repository. Builds the client and engine; performs no
    /// network I/O.
    pub fn new(session: &Session, repository: &RemoteRepository) -> Result<Self> {
        let transport = HttpTransport::new(repository, session.config())?;
        Ok(Self {
            repository: repository.clone(),
            engine: TransferEngine::new(session, repository.clone(), Arc::new(transport)),
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
}

#[async_trait]
impl Connector for HttpConnector {
    fn repository(&self) -> &RemoteRepository {
        &self.repository
    }

    async fn get(
        &self,
        artifacts: Vec<ArtifactDownload>,
        metadata: Vec<MetadataDownload>,
    ) -> Result<BatchReport> {
        self.ensure_open()?;
        Ok(self.engine.get(artifacts, metadata).await)
    }

    async fn put(
        &self,
        artifacts: Vec<ArtifactUpload>,
        metadata: Vec<MetadataUpload>,
    ) -> Result<BatchReport> {
        self.ensure_open()?;
        Ok(self.engine.put(artifacts, metadata).await)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_joins_relative_paths() {
        let repository =
            RemoteRepository::new("central", "https://repo.example.com/releases").unwrap();
        let transport = HttpTransport::new(&repository, &TransferConfig::default()).unwrap();

        assert_eq!(
            transport.url_for("com/acme/lib/1.0/lib-1.0.tgz").unwrap().as_str(),
            "https://repo.example.com/releases/com/acme/lib/1.0/lib-1.0.tgz"
        );
    }

    #[test]
    fn test_same_origin() {
        let a = Url::parse("https://repo.example.com/a").unwrap();
        let b = Url::parse("https://repo.example.com:443/b").unwrap();
        let c = Url::parse("https://cdn.example.com/a").unwrap();
        let d = Url::parse("http://repo.example.com/a").unwrap();

        assert!(HttpTransport::same_origin(&a, &b));
        assert!(!HttpTransport::same_origin(&a, &c));
        assert!(!HttpTransport::same_origin(&a, &d));
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::build::{BuildRequest, BuildStatus};
use crate::config::runtime;

#[derive(Error, Debug)]
pub enum Error {
    #[error("registry rejected push of tag {tag}: code {code}, body: {body}")]
    Rejected { tag: String, code: u16, body: String },

    #[error("build status carries no artifact reference")]
    MissingArtifact,

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),
}

/// Seam to the registry push API.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Make `source` available under `tag`.
    async fn push(&self, source: &str, tag: &str) -> Result<(), Error>;
}

/// Publishes the artifact of a succeeded build to the registry under the
/// build's monotonic tag. At most one push happens per commit SHA, so a
/// redelivered or re-run request can never mint a duplicate tag.
pub struct Publisher {
    registry: Arc<dyn Registry>,
    /// Tag each commit SHA was pushed under. A rebuild of the same SHA
    /// gets a fresh build number from the build API, so duplicates must
    /// answer with the tag that actually reached the registry, not the
    /// one from the current build status.
    published: Mutex<HashMap<String, String>>,
}

impl Publisher {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            published: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the tag the artifact is now published under.
    pub async fn publish(
        &self,
        request: &BuildRequest,
        status: &BuildStatus,
    ) -> Result<String, Error> {
        let tag = status.artifact_tag.clone().ok_or(Error::MissingArtifact)?;
        let source = status
            .artifact_digest
            .clone()
            .ok_or(Error::MissingArtifact)?;

        // The published map is held across the push, serializing pushes
        // and guaranteeing at most one per commit SHA.
        let mut published = self.published.lock().await;
        if let Some(pushed) = published.get(&request.sha) {
            debug!(
                "commit {} already published as tag {}, dropping tag {}",
                request.sha, pushed, tag
            );
            return Ok(pushed.clone());
        }

        published.insert(request.sha.clone(), tag.clone());
        match self.registry.push(&source, &tag).await {
            Ok(()) => {
                info!("published {} as tag {} for commit {}", source, tag, request.sha);
                Ok(tag)
            }
            Err(err) => {
                // nothing was pushed; allow a re-triggered run to try again
                published.remove(&request.sha);
                Err(err)
            }
        }
    }
}

const MANIFEST_TYPES: &str = "application/vnd.docker.distribution.manifest.v2+json, \
                              application/vnd.oci.image.manifest.v1+json";

/// Registry client that promotes an image digest to a tag by copying its
/// manifest, so no image data moves through this process.
pub struct HttpRegistry {
    client: reqwest::Client,
    url: String,
    repository: String,
    token: Option<String>,
}

impl HttpRegistry {
    pub fn new(cfg: &runtime::Config) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            url: cfg.registry_url.clone(),
            repository: cfg.registry_repository.clone(),
            token: cfg.registry_token.clone(),
        })
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.url, self.repository, reference)
    }

    fn authenticated(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn push(&self, source: &str, tag: &str) -> Result<(), Error> {
        debug!("fetching manifest for {source}");
        let resp = self
            .authenticated(self.client.get(self.manifest_url(source)))
            .header(ACCEPT, MANIFEST_TYPES)
            .send()
            .await?;

        let status = resp.status();
        let media_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/vnd.docker.distribution.manifest.v2+json")
            .to_string();
        let manifest = resp.bytes().await?;

        if !status.is_success() {
            return Err(Error::Rejected {
                tag: tag.to_string(),
                code: status.as_u16(),
                body: String::from_utf8_lossy(&manifest).to_string(),
            });
        }

        debug!("putting manifest under tag {tag}");
        let resp = self
            .authenticated(self.client.put(self.manifest_url(tag)))
            .header(CONTENT_TYPE, media_type)
            .body(manifest)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.bytes().await?;
            return Err(Error::Rejected {
                tag: tag.to_string(),
                code: status.as_u16(),
                body: String::from_utf8_lossy(&body).to_string(),
            });
        }
        Ok(())
    }
}

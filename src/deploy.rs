use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use thiserror::Error;

use crate::auth::Broker;
use crate::config::runtime;

/// Image update for one deployment. Constructed only from a succeeded
/// build; applying it twice with the same tag is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPatch {
    pub namespace: String,
    pub deployment: String,
    /// Full image reference including the published tag, never `latest`.
    pub image: String,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("cluster API rejected patch for {namespace}/{deployment}: code {code}, body: {body}")]
    Rejected {
        namespace: String,
        deployment: String,
        code: u16,
        body: String,
    },

    #[error("credential: {0}")]
    Credential(#[from] crate::auth::Error),

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Updated,
    Unchanged,
}

/// Seam to the cluster manifest-apply API.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn current_image(&self, namespace: &str, deployment: &str)
        -> Result<Option<String>, Error>;
    async fn apply(&self, patch: &DeploymentPatch) -> Result<(), Error>;
}

/// Applies deployment patches. Rejections are surfaced without retry;
/// recovering requires a new push or a manual re-trigger.
pub struct Updater {
    api: Arc<dyn ClusterApi>,
}

impl Updater {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    pub async fn apply(&self, patch: &DeploymentPatch) -> Result<Applied, Error> {
        let current = self
            .api
            .current_image(&patch.namespace, &patch.deployment)
            .await?;
        if current.as_deref() == Some(patch.image.as_str()) {
            debug!(
                "{}/{} already runs {}, nothing to apply",
                patch.namespace, patch.deployment, patch.image
            );
            return Ok(Applied::Unchanged);
        }

        self.api.apply(patch).await?;
        info!(
            "patched {}/{} to image {}",
            patch.namespace, patch.deployment, patch.image
        );
        Ok(Applied::Updated)
    }
}

/// Cluster API client patching the deployment's container image with a
/// strategic merge patch, scoped to one namespace by configuration.
pub struct HttpClusterApi {
    client: reqwest::Client,
    base_url: String,
    container: String,
    broker: Arc<Broker>,
}

impl HttpClusterApi {
    pub fn new(cfg: &runtime::Config, broker: Arc<Broker>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            base_url: cfg.cluster_url.clone(),
            container: cfg.container.clone(),
            broker,
        })
    }

    fn deployment_url(&self, namespace: &str, deployment: &str) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{}",
            self.base_url, namespace, deployment
        )
    }
}

#[derive(Deserialize)]
struct Deployment {
    spec: DeploymentSpec,
}

#[derive(Deserialize)]
struct DeploymentSpec {
    template: PodTemplate,
}

#[derive(Deserialize)]
struct PodTemplate {
    spec: PodSpec,
}

#[derive(Deserialize)]
struct PodSpec {
    containers: Vec<Container>,
}

#[derive(Deserialize)]
struct Container {
    name: String,
    image: String,
}

#[async_trait]
impl ClusterApi for HttpClusterApi {
    async fn current_image(
        &self,
        namespace: &str,
        deployment: &str,
    ) -> Result<Option<String>, Error> {
        let token = self.broker.token().await?;
        let resp = self
            .client
            .get(self.deployment_url(namespace, deployment))
            .bearer_auth(token)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(Error::Rejected {
                namespace: namespace.to_string(),
                deployment: deployment.to_string(),
                code: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).to_string(),
            });
        }

        let parsed: Deployment = serde_json::from_slice(&bytes).map_err(|_| Error::Rejected {
            namespace: namespace.to_string(),
            deployment: deployment.to_string(),
            code: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).to_string(),
        })?;

        Ok(parsed
            .spec
            .template
            .spec
            .containers
            .into_iter()
            .find(|container| container.name == self.container)
            .map(|container| container.image))
    }

    async fn apply(&self, patch: &DeploymentPatch) -> Result<(), Error> {
        let token = self.broker.token().await?;
        let payload = serde_json::json!({
            "spec": {
                "template": {
                    "spec": {
                        "containers": [{
                            "name": self.container,
                            "image": patch.image,
                        }]
                    }
                }
            }
        });

        debug!(
            "applying image {} to {}/{}",
            patch.image, patch.namespace, patch.deployment
        );
        let resp = self
            .client
            .patch(self.deployment_url(&patch.namespace, &patch.deployment))
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/strategic-merge-patch+json")
            .body(payload.to_string())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await?;
            return Err(Error::Rejected {
                namespace: patch.namespace.clone(),
                deployment: patch.deployment.clone(),
                code: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).to_string(),
            });
        }
        Ok(())
    }
}

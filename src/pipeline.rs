use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::build::{BuildRequest, BuildState, Dispatcher};
use crate::deploy::{Applied, DeploymentPatch, Updater};
use crate::publish::Publisher;

/// Every terminal failure names the commit it belongs to, so the operator
/// log always traces back to a push.
#[derive(Error, Debug)]
pub enum Error {
    #[error("build for commit {sha} failed (logs: {})", logs.as_deref().unwrap_or("unavailable"))]
    BuildFailed { sha: String, logs: Option<String> },

    #[error("dispatch for commit {sha}: {err}")]
    Dispatch {
        sha: String,
        #[source]
        err: crate::build::Error,
    },

    #[error("publish for commit {sha}: {err}")]
    Publish {
        sha: String,
        #[source]
        err: crate::publish::Error,
    },

    #[error("apply for commit {sha}: {err}")]
    Apply {
        sha: String,
        #[source]
        err: crate::deploy::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Deployed { tag: String },
    Unchanged { tag: String },
    /// A newer commit deployed while this build was in flight.
    Superseded { tag: String },
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Deployed { tag } => write!(f, "deployed tag {tag}"),
            Outcome::Unchanged { tag } => write!(f, "tag {tag} was already deployed"),
            Outcome::Superseded { tag } => write!(f, "tag {tag} superseded by a newer commit"),
        }
    }
}

/// Which deployment the pipeline feeds.
#[derive(Debug, Clone)]
pub struct Target {
    pub namespace: String,
    pub deployment: String,
    /// Image name without a tag, e.g. registry.example.com/team/app
    pub image_base: String,
}

type Key = (String, String);

/// What is currently deployed, versioned per (namespace, deployment) so
/// concurrent pipeline instances can order themselves.
#[derive(Debug, Clone)]
struct DeployedRecord {
    sha: String,
    committed_at: DateTime<Utc>,
}

/// One pipeline instance per build request: dispatch the remote build,
/// publish the artifact, patch the deployment. Instances run concurrently;
/// patch application is serialized per deployment and ordered
/// last-writer-wins by commit timestamp.
pub struct Pipeline {
    dispatcher: Dispatcher,
    publisher: Publisher,
    updater: Updater,
    target: Target,
    records: Mutex<HashMap<Key, DeployedRecord>>,
    locks: Mutex<HashMap<Key, Arc<Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(dispatcher: Dispatcher, publisher: Publisher, updater: Updater, target: Target) -> Self {
        Self {
            dispatcher,
            publisher,
            updater,
            target,
            records: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run an instance to completion, logging any terminal failure. The
    /// caller keeps serving other pushes.
    pub fn spawn(self: &Arc<Self>, request: BuildRequest) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let sha = request.sha.clone();
            if let Err(err) = pipeline.run(request).await {
                error!("pipeline instance for commit {sha}: {err}");
            }
        });
    }

    pub async fn run(&self, request: BuildRequest) -> Result<Outcome, Error> {
        info!(
            "pipeline started for commit {} on {}",
            request.sha, request.branch
        );

        let status = self
            .dispatcher
            .dispatch(&request)
            .await
            .map_err(|err| Error::Dispatch {
                sha: request.sha.clone(),
                err,
            })?;

        // Failed and Pending builds never produce a deployment patch.
        if status.state != BuildState::Succeeded {
            return Err(Error::BuildFailed {
                sha: request.sha.clone(),
                logs: status.logs_url,
            });
        }

        let tag = self
            .publisher
            .publish(&request, &status)
            .await
            .map_err(|err| Error::Publish {
                sha: request.sha.clone(),
                err,
            })?;

        let patch = DeploymentPatch {
            namespace: self.target.namespace.clone(),
            deployment: self.target.deployment.clone(),
            image: format!("{}:{}", self.target.image_base, tag),
        };

        let key = (patch.namespace.clone(), patch.deployment.clone());
        let slot = {
            let mut locks = self.locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };
        // one patch application in flight per deployment
        let _guard = slot.lock().await;

        if let Some(current) = self.records.lock().await.get(&key) {
            if current.committed_at > request.requested_at {
                info!(
                    "commit {} superseded by {} on {}/{}, not deploying tag {}",
                    request.sha, current.sha, key.0, key.1, tag
                );
                return Ok(Outcome::Superseded { tag });
            }
        }

        let applied = self
            .updater
            .apply(&patch)
            .await
            .map_err(|err| Error::Apply {
                sha: request.sha.clone(),
                err,
            })?;

        self.records.lock().await.insert(
            key,
            DeployedRecord {
                sha: request.sha.clone(),
                committed_at: request.requested_at,
            },
        );

        Ok(match applied {
            Applied::Updated => Outcome::Deployed { tag },
            Applied::Unchanged => Outcome::Unchanged { tag },
        })
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Broker;
use crate::config::runtime;

/// A qualifying push, as emitted by the source watcher. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub sha: String,
    pub branch: String,
    pub repository: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Succeeded | BuildState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct BuildStatus {
    pub state: BuildState,
    pub logs_url: Option<String>,
    /// Build number as assigned by the build API; monotonic per build config.
    pub artifact_tag: Option<String>,
    /// Digest of the produced image, resolvable in the registry.
    pub artifact_digest: Option<String>,
}

/// Identifies one remote build instantiated from the build config.
#[derive(Debug, Clone)]
pub struct BuildHandle {
    pub name: String,
    pub number: u64,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("credential: {0}")]
    Credential(#[from] crate::auth::Error),

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("build API rejected request: code {0}, body: {1}")]
    Api(u16, String),

    #[error("build failed after {attempts} attempts: {cause}")]
    BuildFailed { attempts: u32, cause: String },
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transient(err.to_string())
    }
}

/// Seam to the remote build API.
#[async_trait]
pub trait BuildApi: Send + Sync {
    async fn start_build(&self, request: &BuildRequest) -> Result<BuildHandle, Error>;
    async fn build_status(&self, handle: &BuildHandle) -> Result<BuildStatus, Error>;
}

/// Starts a remote build for a request and waits for it to reach a
/// terminal state. Transient failures are retried with bounded backoff;
/// an explicit remote build failure is surfaced as-is, since failed
/// builds are not flaky and re-running requires a new push.
pub struct Dispatcher {
    api: Arc<dyn BuildApi>,
    poll_interval: Duration,
    max_retries: u32,
    backoff_base: Duration,
}

impl Dispatcher {
    pub fn new(api: Arc<dyn BuildApi>, cfg: &runtime::Config) -> Self {
        Self {
            api,
            poll_interval: cfg.build_poll_interval,
            max_retries: cfg.max_transient_retries,
            backoff_base: cfg.backoff_base,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_timings(
        api: Arc<dyn BuildApi>,
        poll_interval: Duration,
        max_retries: u32,
        backoff_base: Duration,
    ) -> Self {
        Self {
            api,
            poll_interval,
            max_retries,
            backoff_base,
        }
    }

    /// Returns the terminal status of the build triggered by `request`.
    pub async fn dispatch(&self, request: &BuildRequest) -> Result<BuildStatus, Error> {
        let handle = self
            .with_retry(|| self.api.start_build(request))
            .await?;
        info!(
            "build {} (number {}) started for commit {}",
            handle.name, handle.number, request.sha
        );

        loop {
            let status = self
                .with_retry(|| self.api.build_status(&handle))
                .await?;
            if status.state.is_terminal() {
                info!(
                    "build {} finished for commit {}: {:?}",
                    handle.name, request.sha, status.state
                );
                return Ok(status);
            }
            debug!("build {} is {:?}, waiting", handle.name, status.state);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Err(Error::Transient(cause)) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(Error::BuildFailed {
                            attempts: attempt,
                            cause,
                        });
                    }
                    let delay = backoff_delay(self.backoff_base, attempt);
                    debug!("transient error ({cause}), retry {attempt} in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delay before retry `attempt` (1-based): exponential from `base`,
/// saturating at a fixed cap so an oversized configured base cannot
/// overflow or stall the pipeline.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(1u32 << attempt.saturating_sub(1).min(10))
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// Build API client against the cluster.
pub struct HttpBuildApi {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    build_config: String,
    broker: Arc<Broker>,
}

impl HttpBuildApi {
    pub fn new(cfg: &runtime::Config, broker: Arc<Broker>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            base_url: cfg.cluster_url.clone(),
            namespace: cfg.namespace.clone(),
            build_config: cfg.build_config.clone(),
            broker,
        })
    }
}

#[derive(Serialize)]
struct InstantiateRequest<'a> {
    commit: &'a str,
    branch: &'a str,
    repository: &'a str,
}

#[derive(Deserialize)]
struct RemoteBuild {
    name: String,
    number: u64,
    phase: RemotePhase,
    #[serde(default)]
    logs_url: Option<String>,
    #[serde(default)]
    output_digest: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
enum RemotePhase {
    New,
    Pending,
    Running,
    Complete,
    Failed,
    Error,
    Cancelled,
}

impl From<RemotePhase> for BuildState {
    fn from(phase: RemotePhase) -> Self {
        match phase {
            RemotePhase::New | RemotePhase::Pending => BuildState::Pending,
            RemotePhase::Running => BuildState::Running,
            RemotePhase::Complete => BuildState::Succeeded,
            RemotePhase::Failed | RemotePhase::Error | RemotePhase::Cancelled => BuildState::Failed,
        }
    }
}

impl From<&RemoteBuild> for BuildStatus {
    fn from(build: &RemoteBuild) -> Self {
        BuildStatus {
            state: build.phase.into(),
            logs_url: build.logs_url.clone(),
            artifact_tag: Some(build.number.to_string()),
            artifact_digest: build.output_digest.clone(),
        }
    }
}

async fn parse_build(resp: reqwest::Response) -> Result<RemoteBuild, Error> {
    let status = resp.status();
    let code = status.as_u16();
    let bytes = resp.bytes().await?;

    if status.is_server_error() {
        return Err(Error::Transient(format!("build API returned {code}")));
    }
    if !status.is_success() {
        return Err(Error::Api(code, String::from_utf8_lossy(&bytes).to_string()));
    }

    match serde_json::from_slice(&bytes) {
        Ok(build) => Ok(build),
        Err(_) => Err(Error::Api(code, String::from_utf8_lossy(&bytes).to_string())),
    }
}

#[async_trait]
impl BuildApi for HttpBuildApi {
    async fn start_build(&self, request: &BuildRequest) -> Result<BuildHandle, Error> {
        let token = self.broker.token().await?;
        let url = format!(
            "{}/namespaces/{}/buildconfigs/{}/instantiate",
            self.base_url, self.namespace, self.build_config
        );
        debug!("starting build for commit {} via {url}", request.sha);

        let resp = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&InstantiateRequest {
                commit: &request.sha,
                branch: &request.branch,
                repository: &request.repository,
            })
            .send()
            .await?;

        let build = parse_build(resp).await?;
        Ok(BuildHandle {
            name: build.name,
            number: build.number,
        })
    }

    async fn build_status(&self, handle: &BuildHandle) -> Result<BuildStatus, Error> {
        let token = self.broker.token().await?;
        let url = format!(
            "{}/namespaces/{}/builds/{}",
            self.base_url, self.namespace, handle.name
        );

        let resp = self.client.get(url).bearer_auth(token).send().await?;
        let build = parse_build(resp).await?;
        Ok(BuildStatus::from(&build))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::Mutex;

    use super::*;

    fn request() -> BuildRequest {
        BuildRequest {
            sha: "cafebabe".into(),
            branch: "main".into(),
            repository: "https://git.example.com/team/app.git".into(),
            requested_at: Utc::now(),
        }
    }

    fn status(state: BuildState) -> BuildStatus {
        BuildStatus {
            state,
            logs_url: None,
            artifact_tag: Some("17".into()),
            artifact_digest: Some("sha256:abc".into()),
        }
    }

    /// Replays a scripted sequence of start failures and status states.
    struct ScriptedApi {
        start_failures: AtomicU32,
        states: Mutex<VecDeque<BuildState>>,
        status_calls: AtomicU32,
    }

    impl ScriptedApi {
        fn new(start_failures: u32, states: Vec<BuildState>) -> Self {
            Self {
                start_failures: AtomicU32::new(start_failures),
                states: Mutex::new(states.into()),
                status_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl BuildApi for ScriptedApi {
        async fn start_build(&self, _request: &BuildRequest) -> Result<BuildHandle, Error> {
            if self.start_failures.load(Ordering::SeqCst) > 0 {
                self.start_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Transient("connection reset".into()));
            }
            Ok(BuildHandle {
                name: "app-17".into(),
                number: 17,
            })
        }

        async fn build_status(&self, _handle: &BuildHandle) -> Result<BuildStatus, Error> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let mut states = self.states.lock().await;
            let state = if states.len() > 1 {
                states.pop_front().unwrap()
            } else {
                *states.front().unwrap()
            };
            Ok(status(state))
        }
    }

    fn dispatcher(api: Arc<dyn BuildApi>) -> Dispatcher {
        Dispatcher::with_timings(api, Duration::from_millis(1), 3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn polls_until_succeeded() {
        let api = Arc::new(ScriptedApi::new(
            0,
            vec![BuildState::Pending, BuildState::Running, BuildState::Succeeded],
        ));
        let status = dispatcher(api.clone()).dispatch(&request()).await.unwrap();
        assert_eq!(status.state, BuildState::Succeeded);
        assert_eq!(status.artifact_tag.as_deref(), Some("17"));
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_start_failures_are_retried() {
        let api = Arc::new(ScriptedApi::new(2, vec![BuildState::Succeeded]));
        let status = dispatcher(api).dispatch(&request()).await.unwrap();
        assert_eq!(status.state, BuildState::Succeeded);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let api = Arc::new(ScriptedApi::new(10, vec![BuildState::Succeeded]));
        match dispatcher(api).dispatch(&request()).await {
            Err(Error::BuildFailed { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected BuildFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_build_is_terminal_without_retry() {
        let api = Arc::new(ScriptedApi::new(0, vec![BuildState::Failed]));
        let status = dispatcher(api.clone()).dispatch(&request()).await.unwrap();
        assert_eq!(status.state, BuildState::Failed);
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
        // oversized bases and attempt counts cap instead of panicking
        assert_eq!(backoff_delay(Duration::MAX, 2), MAX_BACKOFF);
        assert_eq!(backoff_delay(base, 1000), MAX_BACKOFF);
    }

    #[test]
    fn remote_phase_mapping() {
        assert_eq!(BuildState::from(RemotePhase::New), BuildState::Pending);
        assert_eq!(BuildState::from(RemotePhase::Complete), BuildState::Succeeded);
        assert_eq!(BuildState::from(RemotePhase::Cancelled), BuildState::Failed);
    }
}

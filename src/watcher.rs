use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use log::{debug, info};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::build::BuildRequest;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("webhook secret is not configured")]
    SecretMissing,

    #[error("webhook signature header missing or malformed")]
    SignatureMissing,

    #[error("webhook signature verification failed")]
    SignatureMismatch,

    #[error("malformed push payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("code: {0}, body: {1}")]
    Deserialize(u16, String),
}

/// A push to some branch of the watched repository. The webhook, poll and
/// CI trigger variants all reduce to producing one of these.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub repository: String,
    pub branch: String,
    pub sha: String,
    pub timestamp: DateTime<Utc>,
}

/// Verify a webhook body against its HMAC-SHA256 signature.
/// Comparison is constant-time to prevent timing attacks.
pub fn verify_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// Filters push events down to qualifying ones: correct branch, verified
/// signature, not a duplicate delivery. Emits at most one BuildRequest
/// per commit SHA within the dedupe window.
pub struct Watcher {
    branch: String,
    secret: Option<String>,
    dedupe_window: Duration,
    seen: HashMap<String, DateTime<Utc>>,
}

impl Watcher {
    pub fn new(branch: String, secret: Option<String>, dedupe_window: Duration) -> Self {
        Self {
            branch,
            secret,
            dedupe_window,
            seen: HashMap::new(),
        }
    }

    /// Verify and parse a raw webhook delivery. The signature header value
    /// may carry the conventional `sha256=` prefix.
    pub fn accept_webhook(
        &mut self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<Option<BuildRequest>, Error> {
        let secret = self.secret.as_deref().ok_or(Error::SecretMissing)?;
        let signature = signature.ok_or(Error::SignatureMissing)?;
        let signature = signature.strip_prefix("sha256=").unwrap_or(signature);

        if !verify_signature(body, signature, secret) {
            return Err(Error::SignatureMismatch);
        }

        let event = PushEvent::from_payload(body)?;
        Ok(self.accept(event))
    }

    /// Branch filter and dedupe. Returns None for non-qualifying events.
    pub fn accept(&mut self, event: PushEvent) -> Option<BuildRequest> {
        if event.branch != self.branch {
            debug!(
                "ignoring push of {} to branch {} (watching {})",
                event.sha, event.branch, self.branch
            );
            return None;
        }

        let now = Utc::now();
        self.prune(now);

        if self.seen.contains_key(&event.sha) {
            debug!("duplicate delivery of {} within dedupe window", event.sha);
            return None;
        }
        self.seen.insert(event.sha.clone(), now);

        info!("qualifying push: {} on {}", event.sha, event.branch);
        Some(BuildRequest {
            sha: event.sha,
            branch: event.branch,
            repository: event.repository,
            requested_at: event.timestamp,
        })
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.dedupe_window;
        self.seen.retain(|_, seen_at| now - *seen_at < window);
    }
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    repository: PayloadRepository,
    head_commit: Option<PayloadCommit>,
}

#[derive(Deserialize)]
struct PayloadRepository {
    clone_url: String,
}

#[derive(Deserialize)]
struct PayloadCommit {
    timestamp: DateTime<Utc>,
}

impl PushEvent {
    pub fn from_payload(body: &[u8]) -> Result<Self, Error> {
        let payload: PushPayload = serde_json::from_slice(body)?;
        let branch = payload
            .git_ref
            .strip_prefix("refs/heads/")
            .unwrap_or(&payload.git_ref)
            .to_string();
        Ok(PushEvent {
            repository: payload.repository.clone_url,
            branch,
            sha: payload.after,
            timestamp: payload
                .head_commit
                .map(|commit| commit.timestamp)
                .unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Deserialize)]
struct BranchHead {
    sha: String,
    commit: HeadCommit,
}

#[derive(Deserialize)]
struct HeadCommit {
    committer: Committer,
}

#[derive(Deserialize)]
struct Committer {
    date: DateTime<Utc>,
}

/// Fetch the current head of the watched branch, for the poll trigger.
pub async fn fetch_branch_head(
    client: &reqwest::Client,
    url: &str,
    repository: &str,
    branch: &str,
) -> Result<PushEvent, Error> {
    debug!("polling {url} for the head of {branch}");
    let resp = client.get(url).send().await?;

    let status = resp.status().as_u16();
    let bytes = resp.bytes().await?;

    let head: BranchHead = match serde_json::from_slice(&bytes) {
        Ok(head) => head,
        Err(_) => {
            let body = String::from_utf8_lossy(&bytes);
            return Err(Error::Deserialize(status, body.to_string()));
        }
    };

    Ok(PushEvent {
        repository: repository.to_string(),
        branch: branch.to_string(),
        sha: head.sha,
        timestamp: head.commit.committer.date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "s3cret";

    fn sign(body: &[u8], secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn payload(branch: &str, sha: &str) -> Vec<u8> {
        serde_json::json!({
            "ref": format!("refs/heads/{branch}"),
            "after": sha,
            "repository": { "clone_url": "https://git.example.com/team/app.git" },
            "head_commit": { "timestamp": "2025-06-01T12:00:00Z" },
        })
        .to_string()
        .into_bytes()
    }

    fn watcher() -> Watcher {
        Watcher::new("main".into(), Some(SECRET.into()), Duration::seconds(300))
    }

    #[test]
    fn valid_push_produces_build_request() {
        let body = payload("main", "cafebabe");
        let signature = format!("sha256={}", sign(&body, SECRET));

        let request = watcher()
            .accept_webhook(&body, Some(&signature))
            .unwrap()
            .unwrap();
        assert_eq!(request.sha, "cafebabe");
        assert_eq!(request.branch, "main");
        assert_eq!(request.repository, "https://git.example.com/team/app.git");
    }

    #[test]
    fn invalid_signature_is_rejected() {
        let body = payload("main", "cafebabe");
        let forged = sign(&body, "wrong-secret");

        match watcher().accept_webhook(&body, Some(&forged)) {
            Err(Error::SignatureMismatch) => {}
            other => panic!("expected SignatureMismatch, got {other:?}"),
        }
    }

    #[test]
    fn missing_signature_is_rejected() {
        let body = payload("main", "cafebabe");
        assert!(matches!(
            watcher().accept_webhook(&body, None),
            Err(Error::SignatureMissing)
        ));
    }

    #[test]
    fn duplicate_delivery_is_deduplicated() {
        let body = payload("main", "cafebabe");
        let signature = sign(&body, SECRET);

        let mut watcher = watcher();
        assert!(watcher
            .accept_webhook(&body, Some(&signature))
            .unwrap()
            .is_some());
        assert!(watcher
            .accept_webhook(&body, Some(&signature))
            .unwrap()
            .is_none());
    }

    #[test]
    fn dedupe_window_expires() {
        let mut watcher = Watcher::new("main".into(), None, Duration::seconds(0));
        let event = PushEvent::from_payload(&payload("main", "cafebabe")).unwrap();
        assert!(watcher.accept(event.clone()).is_some());
        // a zero-length window keeps nothing
        assert!(watcher.accept(event).is_some());
    }

    #[test]
    fn other_branches_are_filtered() {
        let body = payload("feature/x", "cafebabe");
        let signature = sign(&body, SECRET);
        assert!(watcher()
            .accept_webhook(&body, Some(&signature))
            .unwrap()
            .is_none());
    }

    #[test]
    fn payload_timestamp_is_used() {
        let event = PushEvent::from_payload(&payload("main", "cafebabe")).unwrap();
        assert_eq!(event.timestamp.to_rfc3339(), "2025-06-01T12:00:00+00:00");
    }
}

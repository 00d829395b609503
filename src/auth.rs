use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::runtime;

#[derive(Error, Debug)]
pub enum Error {
    #[error("credential expired and no refresh path is available")]
    Expired,

    #[error("no cluster credential source configured")]
    NotConfigured,

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("token exchange failed: code {0}, body: {1}")]
    Exchange(u16, String),
}

/// A currently valid cluster credential. Never cached outside the broker.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub expiry: DateTime<Utc>,
    pub endpoint: String,
}

impl Credential {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry > now
    }
}

/// Where fresh tokens come from.
enum TokenSource {
    /// Service-account token read from the environment on every refresh,
    /// so externally rotated tokens are picked up.
    Static { env_var: String, ttl: Duration },

    /// Exchange an ambient subject token (e.g. a CI-issued JWT) for a
    /// short-lived cluster token.
    Exchange { url: String, subject_env: String },
}

/// Single source of truth for the service-account token. All components
/// request credentials here instead of caching tokens themselves.
pub struct Broker {
    endpoint: String,
    source: TokenSource,
    leeway: Duration,
    current: RwLock<Option<Credential>>,
}

impl Broker {
    pub fn from_config(cfg: &runtime::Config) -> Result<Self, Error> {
        let source = match &cfg.token_exchange_url {
            Some(url) if std::env::var(&cfg.subject_token_env).is_ok() => TokenSource::Exchange {
                url: url.clone(),
                subject_env: cfg.subject_token_env.clone(),
            },
            _ if std::env::var(&cfg.cluster_token_env).is_ok() => TokenSource::Static {
                env_var: cfg.cluster_token_env.clone(),
                ttl: cfg.token_ttl,
            },
            _ => return Err(Error::NotConfigured),
        };

        Ok(Self::new(cfg.cluster_url.clone(), source, cfg.refresh_leeway))
    }

    fn new(endpoint: String, source: TokenSource, leeway: Duration) -> Self {
        Self {
            endpoint,
            source,
            leeway,
            current: RwLock::new(None),
        }
    }

    /// Returns a credential that is valid now, refreshing proactively
    /// when the cached one is inside the expiry leeway.
    pub async fn credential(&self) -> Result<Credential, Error> {
        let now = Utc::now();

        {
            let current = self.current.read().await;
            if let Some(credential) = current.as_ref() {
                if credential.expiry - self.leeway > now {
                    return Ok(credential.clone());
                }
            }
        }

        debug!("refreshing cluster credential");
        let fresh = self.refresh(now).await?;
        if !fresh.is_valid_at(now) {
            return Err(Error::Expired);
        }

        *self.current.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    pub async fn token(&self) -> Result<String, Error> {
        Ok(self.credential().await?.token)
    }

    async fn refresh(&self, now: DateTime<Utc>) -> Result<Credential, Error> {
        match &self.source {
            TokenSource::Static { env_var, ttl } => {
                let token = std::env::var(env_var).map_err(|_| Error::NotConfigured)?;
                Ok(Credential {
                    token,
                    expiry: now + *ttl,
                    endpoint: self.endpoint.clone(),
                })
            }
            TokenSource::Exchange { url, subject_env } => {
                let subject_token = std::env::var(subject_env).map_err(|_| Error::NotConfigured)?;
                let response = exchange_token(url, &subject_token, &self.endpoint).await?;
                Ok(Credential {
                    token: response.access_token,
                    expiry: now + Duration::seconds(response.expires_in),
                    endpoint: self.endpoint.clone(),
                })
            }
        }
    }
}

#[derive(Serialize)]
struct TokenExchangeRequest<'a> {
    grant_type: &'a str,
    requested_token_type: &'a str,
    audience: &'a str,
    subject_token: &'a str,
    subject_token_type: &'a str,
}

#[derive(Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
    expires_in: i64,
}

async fn exchange_token(
    url: &str,
    subject_token: &str,
    audience: &str,
) -> Result<TokenExchangeResponse, Error> {
    debug!("exchanging subject token for a cluster token");
    let client = reqwest::Client::builder()
        .timeout(StdDuration::from_secs(3))
        .build()?;

    let request = TokenExchangeRequest {
        grant_type: "urn:ietf:params:oauth:grant-type:token-exchange",
        requested_token_type: "urn:ietf:params:oauth:token-type:access_token",
        audience,
        subject_token,
        subject_token_type: "urn:ietf:params:oauth:token-type:jwt",
    };

    let resp = client.post(url).json(&request).send().await?;

    let status = resp.status().as_u16();
    let bytes = resp.bytes().await?;

    match serde_json::from_slice(&bytes) {
        Ok(token) => Ok(token),
        Err(_) => {
            let body = String::from_utf8_lossy(&bytes);
            Err(Error::Exchange(status, body.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_token_is_served_and_cached() {
        std::env::set_var("TEST_BROKER_TOKEN_A", "token-one");
        let broker = Broker::new(
            "https://cluster.example.com".into(),
            TokenSource::Static {
                env_var: "TEST_BROKER_TOKEN_A".into(),
                ttl: Duration::seconds(3600),
            },
            Duration::seconds(300),
        );

        let credential = broker.credential().await.unwrap();
        assert_eq!(credential.token, "token-one");
        assert_eq!(credential.endpoint, "https://cluster.example.com");
        assert!(credential.is_valid_at(Utc::now()));

        // a rotated env var is not picked up while the cached credential
        // is still outside the refresh leeway
        std::env::set_var("TEST_BROKER_TOKEN_A", "token-two");
        let cached = broker.credential().await.unwrap();
        assert_eq!(cached.token, "token-one");
    }

    #[tokio::test]
    async fn expired_credential_is_never_returned() {
        std::env::set_var("TEST_BROKER_TOKEN_B", "stale");
        let broker = Broker::new(
            "https://cluster.example.com".into(),
            TokenSource::Static {
                env_var: "TEST_BROKER_TOKEN_B".into(),
                // every refresh produces an already-expired credential
                ttl: Duration::seconds(0),
            },
            Duration::seconds(0),
        );

        match broker.credential().await {
            Err(Error::Expired) => {}
            other => panic!("expected Expired, got {:?}", other.map(|c| c.token)),
        }
    }

    #[tokio::test]
    async fn missing_source_is_reported() {
        let broker = Broker::new(
            "https://cluster.example.com".into(),
            TokenSource::Static {
                env_var: "TEST_BROKER_TOKEN_UNSET".into(),
                ttl: Duration::seconds(3600),
            },
            Duration::seconds(300),
        );

        assert!(matches!(broker.credential().await, Err(Error::NotConfigured)));
    }
}

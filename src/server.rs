use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use log::{info, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::pipeline::Pipeline;
use crate::watcher::{self, Watcher};

#[derive(Error, Debug)]
pub enum Error {
    #[error("bind {addr}: {err}")]
    Bind { addr: String, err: std::io::Error },

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

struct AppState {
    watcher: Mutex<Watcher>,
    pipeline: Arc<Pipeline>,
}

/// Accept push webhooks until interrupted. Each qualifying push runs its
/// own pipeline instance; the listener keeps serving.
pub async fn serve(bind: &str, watcher: Watcher, pipeline: Arc<Pipeline>) -> Result<(), Error> {
    let state = Arc::new(AppState {
        watcher: Mutex::new(watcher),
        pipeline,
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook", post(webhook))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| Error::Bind {
            addr: bind.to_string(),
            err,
        })?;
    info!("webhook listener on {bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok\n"
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok());

    let accepted = state.watcher.lock().await.accept_webhook(&body, signature);
    match accepted {
        Ok(Some(request)) => {
            let sha = request.sha.clone();
            state.pipeline.spawn(request);
            (StatusCode::ACCEPTED, format!("accepted {sha}\n"))
        }
        Ok(None) => (StatusCode::OK, "ignored\n".to_string()),
        Err(err) => {
            warn!("webhook rejected: {err}");
            let code = match err {
                watcher::Error::SecretMissing
                | watcher::Error::SignatureMissing
                | watcher::Error::SignatureMismatch => StatusCode::UNAUTHORIZED,
                _ => StatusCode::BAD_REQUEST,
            };
            (code, format!("{err}\n"))
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

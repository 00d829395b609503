/// Deployment trigger controller
use crate::Error::*;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use thiserror::Error;

use crate::build::{BuildApi, Dispatcher, HttpBuildApi};
use crate::deploy::{ClusterApi, HttpClusterApi, Updater};
use crate::pipeline::{Pipeline, Target};
use crate::publish::{HttpRegistry, Publisher, Registry};
use crate::watcher::{PushEvent, Watcher};

mod auth;
mod build;
mod config;
mod deploy;
mod pipeline;
mod publish;
mod server;
mod watcher;

/// Watch a repository branch, build on the cluster, publish the image,
/// and update the target deployment.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Listen for version-control push webhooks and run the pipeline for
    /// each qualifying push.
    Serve,
    /// Periodically poll the version-control API for new commits on the
    /// watched branch.
    Poll,
    /// Run one pipeline instance for the given commit, then exit. Meant to
    /// be invoked from CI.
    Trigger {
        /// Commit SHA to build and deploy.
        #[arg(long)]
        sha: String,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("filesystem error: {0}")]
    FilesystemError(#[from] std::io::Error),

    #[error("configuration file: {0}")]
    ConfigParse(#[from] config::file::Error),

    #[error("configuration: {0}")]
    Config(#[from] config::runtime::Error),

    #[error("credential broker: {0}")]
    Credential(#[from] auth::Error),

    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("pipeline: {0}")]
    Pipeline(#[from] pipeline::Error),

    #[error("server: {0}")]
    Server(#[from] server::Error),

    #[error("webhook secret is required for serve mode; set the variable named by watch.webhook_secret_env")]
    WebhookSecretMissing,

    #[error("poll mode requires watch.commit_api to be configured")]
    PollNotConfigured,
}

/// Read configuration file from disk.
///
/// If a configuration file name is not set explicitly, this function will
/// detect whether a config file with the default file name exists in the
/// working directory. If it does, it is used implicitly. If not, the
/// compiled-in defaults apply (and validation will flag missing values).
fn read_config(args: &Cli) -> Result<config::file::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "dtc.toml";

    let config_file = match &args.config {
        None => {
            if std::fs::metadata(DEFAULT_CONFIG_FILE)
                .map(|metadata| metadata.is_file())
                .unwrap_or(false)
            {
                Some(DEFAULT_CONFIG_FILE.to_string())
            } else {
                None
            }
        }
        Some(c) => Some(c.clone()),
    };

    Ok(if let Some(config_file) = config_file {
        config::file::File::default_with_user_config_file(&config_file)?
    } else {
        config::file::File::default()
    })
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {}", err.to_string());
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<(), Error> {
    env_logger::init();

    let args = Cli::parse();
    let cfg_file = read_config(&args)?;
    let cfg = config::runtime::Config::new(&cfg_file).map_err(Config)?;

    info!("deployment trigger controller {}", env!("CARGO_PKG_VERSION"));
    info!("watching {} on branch {}", cfg.repository, cfg.branch);
    info!("target deployment: {}/{}", cfg.namespace, cfg.deployment);

    let pipeline = build_pipeline(&cfg)?;

    match args.command {
        Commands::Serve => {
            if cfg.webhook_secret.is_none() {
                return Err(WebhookSecretMissing);
            }
            let watcher = Watcher::new(
                cfg.branch.clone(),
                cfg.webhook_secret.clone(),
                cfg.dedupe_window,
            );
            server::serve(&cfg.bind, watcher, pipeline).await?;
            Ok(())
        }
        Commands::Poll => {
            let watcher = Watcher::new(cfg.branch.clone(), None, cfg.dedupe_window);
            poll(&cfg, watcher, pipeline).await
        }
        Commands::Trigger { sha } => {
            let mut watcher = Watcher::new(cfg.branch.clone(), None, cfg.dedupe_window);
            let event = PushEvent {
                repository: cfg.repository.clone(),
                branch: cfg.branch.clone(),
                sha,
                timestamp: Utc::now(),
            };
            // branch matches by construction, so this always qualifies
            if let Some(request) = watcher.accept(event) {
                let outcome = pipeline.run(request).await?;
                info!("{outcome}");
            }
            Ok(())
        }
    }
}

fn build_pipeline(cfg: &config::runtime::Config) -> Result<Arc<Pipeline>, Error> {
    let broker = Arc::new(auth::Broker::from_config(cfg)?);

    let build_api: Arc<dyn BuildApi> = Arc::new(HttpBuildApi::new(cfg, broker.clone())?);
    let registry: Arc<dyn Registry> = Arc::new(HttpRegistry::new(cfg)?);
    let cluster: Arc<dyn ClusterApi> = Arc::new(HttpClusterApi::new(cfg, broker)?);

    Ok(Arc::new(Pipeline::new(
        Dispatcher::new(build_api, cfg),
        Publisher::new(registry),
        Updater::new(cluster),
        Target {
            namespace: cfg.namespace.clone(),
            deployment: cfg.deployment.clone(),
            image_base: cfg.image_base(),
        },
    )))
}

/// Poll trigger: synthesize a push event whenever the watched branch head
/// changes.
async fn poll(
    cfg: &config::runtime::Config,
    mut watcher: Watcher,
    pipeline: Arc<Pipeline>,
) -> Result<(), Error> {
    let url = cfg.commit_api.clone().ok_or(PollNotConfigured)?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    info!("polling {} every {:?}", url, cfg.poll_interval);
    let mut last_head: Option<String> = None;

    loop {
        match watcher::fetch_branch_head(&client, &url, &cfg.repository, &cfg.branch).await {
            Ok(event) => {
                if last_head.as_deref() != Some(event.sha.as_str()) {
                    last_head = Some(event.sha.clone());
                    if let Some(request) = watcher.accept(event) {
                        pipeline.spawn(request);
                    }
                }
            }
            Err(err) => warn!("poll: {err}"),
        }
        tokio::time::sleep(cfg.poll_interval).await;
    }
}

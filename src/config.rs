/// Configuration is split in two layers: `file` is the raw dtc.toml as
/// written by the operator, merged over the compiled-in defaults, and
/// `runtime` is the validated view the pipeline actually runs on.
pub mod file {
    use serde::Deserialize;
    use serde_inline_default::serde_inline_default;
    use thiserror::Error;

    const DEFAULT_CONFIG: &str = include_str!("../default.toml");

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("read {path}: {err}")]
        ReadFile { err: std::io::Error, path: String },

        #[error("parse: {0}")]
        Parse(#[from] toml::de::Error),
    }

    /// A dtc.toml file.
    #[derive(Deserialize, Debug)]
    pub struct File {
        pub description: Option<String>,
        #[serde(default)]
        pub watch: Watch,
        #[serde(default)]
        pub build: Build,
        #[serde(default)]
        pub cluster: Cluster,
        #[serde(default)]
        pub registry: Registry,
        #[serde(default)]
        pub deploy: Deploy,
        #[serde(default)]
        pub server: Server,
    }

    impl Default for File {
        fn default() -> Self {
            // The default config is compiled into the program, so
            // make sure to test default() to catch panics compile-time.
            toml::from_str(DEFAULT_CONFIG).unwrap()
        }
    }

    impl File {
        pub fn default_with_user_config_file(path: &str) -> Result<Self, Error> {
            let data = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
                err,
                path: path.to_string(),
            })?;
            Ok(toml::from_str(&data)?)
        }
    }

    /// Which repository and branch qualify a push for a pipeline run,
    /// and how push events reach us.
    #[serde_inline_default]
    #[derive(Deserialize, Debug)]
    pub struct Watch {
        #[serde_inline_default("main".to_string())]
        pub branch: String,
        pub repository: Option<String>,
        /// Name of the environment variable holding the webhook HMAC secret.
        #[serde_inline_default("DTC_WEBHOOK_SECRET".to_string())]
        pub webhook_secret_env: String,
        #[serde_inline_default(300)]
        pub dedupe_window_seconds: i64,
        /// Poll cadence for `dtc poll`.
        #[serde_inline_default(60)]
        pub poll_interval_seconds: u64,
        /// Endpoint returning the watched branch head as JSON, for `dtc poll`.
        pub commit_api: Option<String>,
    }

    impl Default for Watch {
        fn default() -> Self {
            Self {
                branch: "main".to_string(),
                repository: None,
                webhook_secret_env: "DTC_WEBHOOK_SECRET".to_string(),
                dedupe_window_seconds: 300,
                poll_interval_seconds: 60,
                commit_api: None,
            }
        }
    }

    #[serde_inline_default]
    #[derive(Deserialize, Debug)]
    pub struct Build {
        /// Name of the build config on the cluster to instantiate.
        pub build_config: Option<String>,
        #[serde_inline_default(5)]
        pub poll_interval_seconds: u64,
        #[serde_inline_default(5)]
        pub max_transient_retries: u32,
        #[serde_inline_default(500)]
        pub backoff_base_ms: u64,
    }

    impl Default for Build {
        fn default() -> Self {
            Self {
                build_config: None,
                poll_interval_seconds: 5,
                max_transient_retries: 5,
                backoff_base_ms: 500,
            }
        }
    }

    #[serde_inline_default]
    #[derive(Deserialize, Debug)]
    pub struct Cluster {
        pub api_url: Option<String>,
        pub namespace: Option<String>,
        /// Name of the environment variable holding the service-account token.
        #[serde_inline_default("DTC_CLUSTER_TOKEN".to_string())]
        pub token_env: String,
        /// Token exchange endpoint; when set, a subject token is exchanged
        /// for the cluster token instead of using a static one.
        pub token_exchange_url: Option<String>,
        #[serde_inline_default("DTC_SUBJECT_TOKEN".to_string())]
        pub subject_token_env: String,
        /// Assumed lifetime of a static token.
        #[serde_inline_default(3600)]
        pub token_ttl_seconds: i64,
        #[serde_inline_default(300)]
        pub refresh_leeway_seconds: i64,
    }

    impl Default for Cluster {
        fn default() -> Self {
            Self {
                api_url: None,
                namespace: None,
                token_env: "DTC_CLUSTER_TOKEN".to_string(),
                token_exchange_url: None,
                subject_token_env: "DTC_SUBJECT_TOKEN".to_string(),
                token_ttl_seconds: 3600,
                refresh_leeway_seconds: 300,
            }
        }
    }

    #[serde_inline_default]
    #[derive(Deserialize, Debug)]
    pub struct Registry {
        /// Base URL of the registry API, e.g. https://registry.example.com
        pub url: Option<String>,
        /// Image repository within the registry, e.g. team/app
        pub repository: Option<String>,
        #[serde_inline_default("DTC_REGISTRY_TOKEN".to_string())]
        pub token_env: String,
    }

    impl Default for Registry {
        fn default() -> Self {
            Self {
                url: None,
                repository: None,
                token_env: "DTC_REGISTRY_TOKEN".to_string(),
            }
        }
    }

    #[derive(Deserialize, Debug, Default)]
    pub struct Deploy {
        pub deployment: Option<String>,
        /// Container to patch; defaults to the deployment name.
        pub container: Option<String>,
    }

    #[serde_inline_default]
    #[derive(Deserialize, Debug)]
    pub struct Server {
        #[serde_inline_default("0.0.0.0:8080".to_string())]
        pub bind: String,
    }

    impl Default for Server {
        fn default() -> Self {
            Self {
                bind: "0.0.0.0:8080".to_string(),
            }
        }
    }
}

pub mod runtime {
    use std::time::Duration;
    use thiserror::Error;

    use super::file;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("missing required configuration value: {0}")]
        MissingValue(&'static str),
    }

    /// Validated configuration. Required values are resolved, and secrets
    /// are read from the environment variables named in the file layer.
    #[derive(Debug, Clone)]
    pub struct Config {
        pub branch: String,
        pub repository: String,
        pub webhook_secret: Option<String>,
        pub dedupe_window: chrono::Duration,
        pub poll_interval: Duration,
        pub commit_api: Option<String>,

        pub build_config: String,
        pub build_poll_interval: Duration,
        pub max_transient_retries: u32,
        pub backoff_base: Duration,

        pub cluster_url: String,
        pub namespace: String,
        pub cluster_token_env: String,
        pub token_exchange_url: Option<String>,
        pub subject_token_env: String,
        pub token_ttl: chrono::Duration,
        pub refresh_leeway: chrono::Duration,

        pub registry_url: String,
        pub registry_repository: String,
        pub registry_token: Option<String>,

        pub deployment: String,
        pub container: String,

        pub bind: String,
    }

    impl Config {
        pub fn new(file: &file::File) -> Result<Self, Error> {
            let repository = file
                .watch
                .repository
                .clone()
                .ok_or(Error::MissingValue("watch.repository"))?;
            let build_config = file
                .build
                .build_config
                .clone()
                .ok_or(Error::MissingValue("build.build_config"))?;
            let cluster_url = file
                .cluster
                .api_url
                .clone()
                .ok_or(Error::MissingValue("cluster.api_url"))?;
            let namespace = file
                .cluster
                .namespace
                .clone()
                .ok_or(Error::MissingValue("cluster.namespace"))?;
            let registry_url = file
                .registry
                .url
                .clone()
                .ok_or(Error::MissingValue("registry.url"))?;
            let registry_repository = file
                .registry
                .repository
                .clone()
                .ok_or(Error::MissingValue("registry.repository"))?;
            let deployment = file
                .deploy
                .deployment
                .clone()
                .ok_or(Error::MissingValue("deploy.deployment"))?;
            let container = file
                .deploy
                .container
                .clone()
                .unwrap_or_else(|| deployment.clone());

            Ok(Config {
                branch: file.watch.branch.clone(),
                repository,
                webhook_secret: std::env::var(&file.watch.webhook_secret_env).ok(),
                dedupe_window: chrono::Duration::seconds(file.watch.dedupe_window_seconds),
                poll_interval: Duration::from_secs(file.watch.poll_interval_seconds),
                commit_api: file.watch.commit_api.clone(),

                build_config,
                build_poll_interval: Duration::from_secs(file.build.poll_interval_seconds),
                max_transient_retries: file.build.max_transient_retries,
                backoff_base: Duration::from_millis(file.build.backoff_base_ms),

                cluster_url: cluster_url.trim_end_matches('/').to_string(),
                namespace,
                cluster_token_env: file.cluster.token_env.clone(),
                token_exchange_url: file.cluster.token_exchange_url.clone(),
                subject_token_env: file.cluster.subject_token_env.clone(),
                token_ttl: chrono::Duration::seconds(file.cluster.token_ttl_seconds),
                refresh_leeway: chrono::Duration::seconds(file.cluster.refresh_leeway_seconds),

                registry_url: registry_url.trim_end_matches('/').to_string(),
                registry_repository,
                registry_token: std::env::var(&file.registry.token_env).ok(),

                deployment,
                container,

                bind: file.server.bind.clone(),
            })
        }

        /// Image name without a tag, as it appears in deployment manifests.
        pub fn image_base(&self) -> String {
            let host = self
                .registry_url
                .trim_start_matches("https://")
                .trim_start_matches("http://");
            format!("{}/{}", host, self.registry_repository)
        }
    }
}

#[cfg(test)]
pub mod test {
    #[test]
    pub fn load_default_configuration() {
        let cfg = super::file::File::default();
        assert_eq!(cfg.description, Some("Default configuration file".into()));
        assert_eq!(cfg.watch.branch, "main");
        assert_eq!(cfg.build.max_transient_retries, 5);
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
    }

    #[test]
    pub fn user_configuration_fills_defaults() {
        let cfg: super::file::File = toml::from_str(
            r#"
            [watch]
            repository = "https://git.example.com/team/app.git"
            branch = "production"

            [build]
            build_config = "app"

            [cluster]
            api_url = "https://cluster.example.com/"
            namespace = "team"

            [registry]
            url = "https://registry.example.com"
            repository = "team/app"

            [deploy]
            deployment = "app"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.watch.branch, "production");
        // untouched sections keep their defaults
        assert_eq!(cfg.watch.dedupe_window_seconds, 300);
        assert_eq!(cfg.build.poll_interval_seconds, 5);

        let runtime = super::runtime::Config::new(&cfg).unwrap();
        assert_eq!(runtime.cluster_url, "https://cluster.example.com");
        assert_eq!(runtime.container, "app");
        assert_eq!(runtime.image_base(), "registry.example.com/team/app");
    }

    #[test]
    pub fn missing_required_value_is_reported() {
        let cfg = super::file::File::default();
        let err = super::runtime::Config::new(&cfg).unwrap_err();
        assert!(err.to_string().contains("watch.repository"));
    }
}

//! Service configuration.
//!
//! A YAML document with `grpc`, `kubernetes`, `worker` and `logging`
//! sections. Every scalar key can be overridden from the environment with
//! the `OTTO` prefix and `__` as the section separator, e.g.
//! `OTTO_GRPC__PORT=9999` or `OTTO_KUBERNETES__NAMESPACE=ci`.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub grpc: GrpcConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrpcConfig {
    /// Listening port for the ingress services.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Dial target for egress log forwarding.
    #[serde(default)]
    pub otto_handler_host: String,

    /// Bypass the real egress transport and log locally instead.
    #[serde(default)]
    pub mock_mode: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesConfig {
    /// Namespace for all pod operations.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Identity the deployment binds its pod-management RBAC to.
    #[serde(default)]
    pub service_account: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Image used when a stage does not name one.
    #[serde(default = "default_worker_image")]
    pub image: String,

    #[serde(default)]
    pub cpu_limit: String,

    #[serde(default)]
    pub memory_limit: String,

    /// Additional static labels applied to every worker pod.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `compact` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_port() -> u16 {
    9090
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_worker_image() -> String {
    "alpine:latest".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            otto_handler_host: String::new(),
            mock_mode: false,
        }
    }
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            service_account: String::new(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            image: default_worker_image(),
            cpu_limit: String::new(),
            memory_limit: String::new(),
            labels: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load from an optional YAML file, then layer environment overrides on
    /// top. A missing path means pure defaults plus environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("OTTO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
            .map_err(Into::into)
    }

    /// Built-in defaults, untouched by files or environment.
    pub fn defaults() -> Self {
        Self::default()
    }
}

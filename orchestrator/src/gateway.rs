//! Thin wrapper over the cluster API for pod management and log reads.
//!
//! The gateway is stateless beyond its namespaced client handle. Errors are
//! surfaced verbatim, wrapped with the operation and pod name; retries are
//! the caller's business, never the gateway's.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Options for pod log reads, both streaming and one-shot.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub follow: bool,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
    pub container: Option<String>,
    pub timestamps: bool,
    pub previous: bool,
}

/// One line of pod output. When the cluster was asked for timestamps the
/// leading RFC 3339 prefix is parsed off; otherwise (or when unparseable)
/// the timestamp is the engine's wall clock and the text is the raw line.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Seam between the engine and the cluster. Production uses [`KubeGateway`];
/// tests substitute an in-memory fake.
#[async_trait]
pub trait PodGateway: Send + Sync {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;
    async fn get_pod(&self, name: &str) -> Result<Pod>;
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>>;
    async fn delete_pod(&self, name: &str) -> Result<()>;
    async fn stream_pod_logs(
        &self,
        name: &str,
        opts: LogOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<LogLine>>;
    async fn get_pod_logs(&self, name: &str, opts: LogOptions) -> Result<String>;
}

pub struct KubeGateway {
    pods: Api<Pod>,
    namespace: String,
}

impl KubeGateway {
    /// Connect using the pod-bound in-cluster identity when available,
    /// falling back to an inferred kubeconfig (`KUBECONFIG` or the default
    /// home path). An empty namespace resolves to `default`.
    pub async fn connect(namespace: &str) -> Result<Self> {
        let namespace = if namespace.is_empty() {
            "default"
        } else {
            namespace
        };
        let config = match kube::Config::incluster() {
            Ok(config) => config,
            Err(_) => kube::Config::infer()
                .await
                .map_err(|e| Error::ClusterConfig(e.to_string()))?,
        };
        let client =
            Client::try_from(config).map_err(|e| Error::ClusterConfig(e.to_string()))?;
        tracing::info!(%namespace, "connected to cluster API");
        Ok(Self {
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn log_params(opts: &LogOptions) -> LogParams {
        LogParams {
            container: opts.container.clone(),
            follow: opts.follow,
            previous: opts.previous,
            since_seconds: opts.since_seconds,
            tail_lines: opts.tail_lines,
            timestamps: opts.timestamps,
            ..Default::default()
        }
    }
}

fn wrap(op: &'static str, pod: &str, source: kube::Error) -> Error {
    Error::Gateway {
        op,
        pod: pod.to_string(),
        source,
    }
}

/// Cluster log lines with `timestamps: true` lead with a fixed-width
/// RFC 3339 stamp and a single space.
const TIMESTAMP_PREFIX_LEN: usize = 30;

fn parse_line(raw: String, timestamps: bool) -> LogLine {
    if timestamps && raw.len() > TIMESTAMP_PREFIX_LEN {
        let (prefix, rest) = raw.split_at(TIMESTAMP_PREFIX_LEN);
        if let Some(text) = rest.strip_prefix(' ')
            && let Ok(ts) = DateTime::parse_from_rfc3339(prefix)
        {
            return LogLine {
                timestamp: ts.with_timezone(&Utc),
                text: text.to_string(),
            };
        }
    }
    LogLine {
        timestamp: Utc::now(),
        text: raw,
    }
}

#[async_trait]
impl PodGateway for KubeGateway {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        self.pods
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| wrap("create_pod", name, e))
    }

    async fn get_pod(&self, name: &str) -> Result<Pod> {
        self.pods
            .get(name)
            .await
            .map_err(|e| wrap("get_pod", name, e))
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(label_selector);
        let list = self
            .pods
            .list(&lp)
            .await
            .map_err(|e| wrap("list_pods", label_selector, e))?;
        Ok(list.items)
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(wrap("delete_pod", name, e)),
        }
    }

    async fn stream_pod_logs(
        &self,
        name: &str,
        opts: LogOptions,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<LogLine>> {
        let stream = self
            .pods
            .log_stream(name, &Self::log_params(&opts))
            .await
            .map_err(|e| wrap("stream_pod_logs", name, e))?;

        let (tx, rx) = mpsc::channel(1000);
        let timestamps = opts.timestamps;
        let pod = name.to_string();
        tokio::spawn(async move {
            let mut lines = stream.lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = lines.try_next() => match next {
                        Ok(Some(raw)) => {
                            if tx.send(parse_line(raw, timestamps)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(%pod, ?e, "pod log stream ended with error");
                            break;
                        }
                    },
                }
            }
        });
        Ok(rx)
    }

    async fn get_pod_logs(&self, name: &str, opts: LogOptions) -> Result<String> {
        self.pods
            .logs(name, &Self::log_params(&opts))
            .await
            .map_err(|e| wrap("get_pod_logs", name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timestamped_line() {
        let line = parse_line(
            "2026-03-01T10:30:00.000000000Z compiling module".to_string(),
            true,
        );
        assert_eq!(line.text, "compiling module");
        assert_eq!(
            line.timestamp,
            "2026-03-01T10:30:00Z".parse::<DateTime<Utc>>().expect("ts")
        );
    }

    #[test]
    fn unparseable_prefix_keeps_raw_text() {
        let raw = "not-a-timestamp-prefix-padding!! compiling module";
        let line = parse_line(raw.to_string(), true);
        assert_eq!(line.text, raw);
    }

    #[test]
    fn short_line_keeps_raw_text() {
        let line = parse_line("ok".to_string(), true);
        assert_eq!(line.text, "ok");
    }

    #[test]
    fn without_timestamps_nothing_is_stripped() {
        let raw = "2026-03-01T10:30:00.000000000Z compiling module";
        let line = parse_line(raw.to_string(), false);
        assert_eq!(line.text, raw);
    }
}

//! Worker lifecycle management: create a pod, drive it to a terminal
//! phase, and clean it up on every exit path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use otto_common::{annotations, labels};

use crate::error::{Error, Result};
use crate::gateway::PodGateway;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Resource bounds for a worker container. Values are opaque quantity
/// strings honored by the cluster.
#[derive(Debug, Clone, Default)]
pub struct ResourceBounds {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

impl ResourceBounds {
    fn is_empty(&self) -> bool {
        self.cpu_request.is_none()
            && self.cpu_limit.is_none()
            && self.memory_request.is_none()
            && self.memory_limit.is_none()
    }
}

/// Immutable description of one worker pod.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub resources: ResourceBounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalPhase {
    Succeeded,
    Failed,
}

/// Record produced when a worker reaches a terminal phase.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub name: String,
    pub phase: TerminalPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub failure: Option<String>,
}

impl WorkerOutcome {
    pub fn succeeded(&self) -> bool {
        self.phase == TerminalPhase::Succeeded
    }
}

/// Aggregate of a concurrent batch. Terminal outcomes are data here;
/// transport faults and cancellation surface as errors instead.
#[derive(Debug)]
pub struct BatchOutcome {
    pub outcomes: Vec<WorkerOutcome>,
}

impl BatchOutcome {
    pub fn successful(&self) -> u32 {
        self.outcomes.iter().filter(|o| o.succeeded()).count() as u32
    }

    pub fn failed_workers(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.name.clone())
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.succeeded())
    }

    /// The batch-level failure, when any worker failed.
    pub fn failure(&self) -> Option<Error> {
        let failed = self.failed_workers();
        if failed.is_empty() {
            None
        } else {
            Some(Error::BatchFailed { failed })
        }
    }
}

#[derive(Clone)]
pub struct WorkerManager {
    gateway: Arc<dyn PodGateway>,
    poll_interval: Duration,
    cleanup_timeout: Duration,
}

impl WorkerManager {
    pub fn new(gateway: Arc<dyn PodGateway>) -> Self {
        Self {
            gateway,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Create the pod for `spec` and drive it to a terminal phase. The pod
    /// is deleted on every exit path after creation: success, failure,
    /// cancellation, or error.
    pub async fn run_worker(
        &self,
        spec: &WorkerSpec,
        cancel: &CancellationToken,
    ) -> Result<WorkerOutcome> {
        let pod = build_pod(spec);
        let started_at = Utc::now();
        self.gateway.create_pod(&pod).await?;
        tracing::info!(worker = %spec.name, image = %spec.image, "created worker pod");

        let waited = self.wait_terminal(&spec.name, cancel).await;
        self.cleanup(&spec.name).await;

        let (phase, failure) = waited?;
        let finished_at = Utc::now();
        if let Some(reason) = &failure {
            tracing::warn!(worker = %spec.name, %reason, "worker failed");
        } else {
            tracing::info!(worker = %spec.name, "worker succeeded");
        }
        Ok(WorkerOutcome {
            name: spec.name.clone(),
            phase,
            started_at,
            finished_at,
            duration: (finished_at - started_at).to_std().unwrap_or_default(),
            failure,
        })
    }

    /// Run `specs` concurrently and aggregate per-worker outcomes. The
    /// call returns once every worker has finished (and been cleaned up).
    pub async fn run_batch(
        &self,
        specs: &[WorkerSpec],
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        if specs.is_empty() {
            return Err(Error::Input("batch of zero worker specs".to_string()));
        }

        let (tx, mut rx) = mpsc::channel(specs.len());
        for spec in specs.iter().cloned() {
            let manager = self.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = manager.run_worker(&spec, &cancel).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(specs.len());
        let mut first_err = None;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(BatchOutcome { outcomes }),
        }
    }

    /// Workers owned by this system that are still pending or running.
    pub async fn list_active(&self) -> Result<Vec<Pod>> {
        let selector = format!("{}={}", labels::MANAGED_BY, labels::MANAGED_BY_VALUE);
        let pods = self.gateway.list_pods(&selector).await?;
        Ok(pods
            .into_iter()
            .filter(|p| matches!(pod_phase(p), Some("Pending") | Some("Running")))
            .collect())
    }

    /// Gracefully delete up to `count` active workers, oldest first.
    /// Returns the names actually issued for deletion.
    pub async fn terminate_workers(&self, count: usize) -> Result<Vec<String>> {
        let mut pods = self.list_active().await?;
        pods.sort_by(|a, b| {
            let ka = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
            let kb = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
            ka.cmp(&kb)
        });

        let mut deleted = Vec::new();
        for pod in pods.into_iter().take(count) {
            let Some(name) = pod.metadata.name else {
                continue;
            };
            self.gateway.delete_pod(&name).await?;
            tracing::info!(worker = %name, "issued graceful delete for scale-down");
            deleted.push(name);
        }
        Ok(deleted)
    }

    async fn wait_terminal(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(TerminalPhase, Option<String>)> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = ticker.tick() => {}
            }
            let pod = self.gateway.get_pod(name).await?;
            match pod_phase(&pod) {
                Some("Succeeded") => return Ok((TerminalPhase::Succeeded, None)),
                Some("Failed") => {
                    return Ok((TerminalPhase::Failed, Some(failure_reason(&pod))));
                }
                _ => {}
            }
        }
    }

    /// Deletion must survive caller cancellation, so it runs under its own
    /// bounded timeout rather than the worker's token. Failures are logged
    /// and never mask the primary outcome.
    async fn cleanup(&self, name: &str) {
        match tokio::time::timeout(self.cleanup_timeout, self.gateway.delete_pod(name)).await {
            Ok(Ok(())) => tracing::debug!(worker = %name, "cleaned up worker pod"),
            Ok(Err(e)) => tracing::warn!(worker = %name, ?e, "failed to clean up worker pod"),
            Err(_) => {
                let e = Error::Timeout {
                    op: "deleting worker pod",
                    timeout: self.cleanup_timeout,
                };
                tracing::warn!(worker = %name, %e, "worker pod cleanup abandoned");
            }
        }
    }
}

pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Build the pod object for a worker spec: non-restarting, labelled as
/// managed by this system, stamped with its creation time.
pub fn build_pod(spec: &WorkerSpec) -> Pod {
    let mut pod_labels = spec.labels.clone();
    pod_labels
        .entry(labels::MANAGED_BY.to_string())
        .or_insert_with(|| labels::MANAGED_BY_VALUE.to_string());
    pod_labels
        .entry(labels::APP.to_string())
        .or_insert_with(|| labels::WORKER_APP.to_string());

    let mut pod_annotations = BTreeMap::new();
    pod_annotations.insert(
        annotations::CREATED_AT.to_string(),
        Utc::now().to_rfc3339(),
    );

    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(pod_labels),
            annotations: Some(pod_annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "worker".to_string(),
                image: Some(spec.image.clone()),
                command: (!spec.command.is_empty()).then(|| spec.command.clone()),
                args: (!spec.args.is_empty()).then(|| spec.args.clone()),
                resources: resource_requirements(&spec.resources),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

fn resource_requirements(bounds: &ResourceBounds) -> Option<ResourceRequirements> {
    if bounds.is_empty() {
        return None;
    }
    let mut requests = BTreeMap::new();
    if let Some(cpu) = &bounds.cpu_request {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &bounds.memory_request {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }
    let mut limits = BTreeMap::new();
    if let Some(cpu) = &bounds.cpu_limit {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &bounds.memory_limit {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    Some(ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    })
}

/// Synthesize a human-readable reason for a failed pod: the first
/// terminated container wins, then the first stuck waiting container,
/// then an unready pod condition.
pub fn failure_reason(pod: &Pod) -> String {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());

    if let Some(statuses) = statuses {
        for status in statuses {
            if let Some(term) = status.state.as_ref().and_then(|s| s.terminated.as_ref()) {
                let reason = term.reason.as_deref().unwrap_or("Error");
                return format!(
                    "container '{}' terminated with exit code {} ({})",
                    status.name, term.exit_code, reason
                );
            }
        }
        for status in statuses {
            if let Some(waiting) = status.state.as_ref().and_then(|s| s.waiting.as_ref())
                && let Some(reason) = waiting.reason.as_deref()
            {
                return match waiting.message.as_deref() {
                    Some(message) => format!(
                        "container '{}' stuck waiting: {reason}: {message}",
                        status.name
                    ),
                    None => format!("container '{}' stuck waiting: {reason}", status.name),
                };
            }
        }
    }

    if let Some(conditions) = pod.status.as_ref().and_then(|s| s.conditions.as_ref())
        && let Some(cond) = conditions
            .iter()
            .find(|c| c.type_ == "Ready" && c.status == "False")
        && let Some(message) = cond.message.as_deref()
    {
        return format!("pod not ready: {message}");
    }

    "worker failed with no reported container status".to_string()
}

/// Error message for status reporting: the first container that exited
/// non-zero, if any.
pub fn nonzero_exit_error(pod: &Pod) -> Option<String> {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())?;
    statuses.iter().find_map(|status| {
        let term = status.state.as_ref()?.terminated.as_ref()?;
        if term.exit_code != 0 {
            let reason = term.reason.as_deref().unwrap_or("Error");
            Some(format!(
                "container '{}' exited with code {} ({})",
                status.name, term.exit_code, reason
            ))
        } else {
            None
        }
    })
}

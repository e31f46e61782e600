//! In-memory gateway fake for engine tests. Pod phases are scripted per
//! pod name and creation attempt, so lifecycle and retry behavior can be
//! exercised without a cluster.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use otto_common::labels;

use crate::error::{Error, Result};
use crate::gateway::{LogLine, LogOptions, PodGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakePhase {
    Succeeded,
    Failed,
    Running,
}

type Decider = dyn Fn(&str, u32) -> FakePhase + Send + Sync;

#[derive(Default)]
struct FakeState {
    pods: HashMap<String, Pod>,
    attempts: HashMap<String, u32>,
    created: Vec<String>,
    deleted: Vec<String>,
}

pub struct FakeGateway {
    decider: Box<Decider>,
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::with_decider(|_, _| FakePhase::Succeeded)
    }

    /// Pods with these names reach `Failed` with a non-zero exit.
    pub fn failing_names(names: &[&str]) -> Self {
        let failing: HashSet<String> = names.iter().map(|n| n.to_string()).collect();
        Self::with_decider(move |name, _| {
            if failing.contains(name) {
                FakePhase::Failed
            } else {
                FakePhase::Succeeded
            }
        })
    }

    /// Pods never leave `Running`; only cancellation ends a wait.
    pub fn never_terminal() -> Self {
        Self::with_decider(|_, _| FakePhase::Running)
    }

    /// Pods whose name contains `fragment` fail for the first `failures`
    /// creation attempts, then succeed.
    pub fn flaky(fragment: &str, failures: u32) -> Self {
        let fragment = fragment.to_string();
        Self::with_decider(move |name, attempt| {
            if name.contains(&fragment) && attempt <= failures {
                FakePhase::Failed
            } else {
                FakePhase::Succeeded
            }
        })
    }

    pub fn with_decider(decider: impl Fn(&str, u32) -> FakePhase + Send + Sync + 'static) -> Self {
        Self {
            decider: Box::new(decider),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub async fn pod_exists(&self, name: &str) -> bool {
        self.state.lock().await.pods.contains_key(name)
    }

    pub async fn created_names(&self) -> Vec<String> {
        self.state.lock().await.created.clone()
    }

    pub async fn deleted_names(&self) -> Vec<String> {
        self.state.lock().await.deleted.clone()
    }

    pub async fn creation_attempts(&self, name: &str) -> u32 {
        self.state
            .lock()
            .await
            .attempts
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub async fn live_pod_count(&self) -> usize {
        self.state.lock().await.pods.len()
    }

    /// Insert a running, system-owned pod directly, bypassing the decider.
    pub async fn seed_running_pod(&self, name: &str, created_second: i64) {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.creation_timestamp = Some(Time(
            Timestamp::from_second(created_second).expect("timestamp"),
        ));
        pod.metadata.labels = Some(
            [
                (
                    labels::MANAGED_BY.to_string(),
                    labels::MANAGED_BY_VALUE.to_string(),
                ),
                (labels::APP.to_string(), labels::WORKER_APP.to_string()),
            ]
            .into(),
        );
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        self.state.lock().await.pods.insert(name.to_string(), pod);
    }

    fn status_for(phase: FakePhase) -> PodStatus {
        match phase {
            FakePhase::Succeeded => PodStatus {
                phase: Some("Succeeded".to_string()),
                ..Default::default()
            },
            FakePhase::Running => PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            },
            FakePhase::Failed => PodStatus {
                phase: Some("Failed".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "worker".to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: 1,
                            reason: Some("Error".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            },
        }
    }

    fn not_found(op: &'static str, name: &str) -> Error {
        Error::Gateway {
            op,
            pod: name.to_string(),
            source: kube::Error::Api(Box::new(kube::core::Status {
                status: Some(kube::core::response::StatusSummary::Failure),
                message: format!("pods \"{name}\" not found"),
                reason: "NotFound".to_string(),
                code: 404,
                metadata: None,
                details: None,
            })),
        }
    }
}

fn selector_matches(selector: &str, pod: &Pod) -> bool {
    let Some(pod_labels) = pod.metadata.labels.as_ref() else {
        return selector.is_empty();
    };
    selector.split(',').all(|pair| {
        match pair.split_once('=') {
            Some((k, v)) => pod_labels.get(k).map(String::as_str) == Some(v),
            None => true,
        }
    })
}

#[async_trait]
impl PodGateway for FakeGateway {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Input("pod without a name".to_string()))?;
        let mut state = self.state.lock().await;
        let attempt = state.attempts.entry(name.clone()).or_insert(0);
        *attempt += 1;
        let phase = (self.decider)(&name, *attempt);

        let mut stored = pod.clone();
        stored.status = Some(Self::status_for(phase));
        state.created.push(name.clone());
        state.pods.insert(name, stored.clone());
        Ok(stored)
    }

    async fn get_pod(&self, name: &str) -> Result<Pod> {
        self.state
            .lock()
            .await
            .pods
            .get(name)
            .cloned()
            .ok_or_else(|| Self::not_found("get_pod", name))
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .await
            .pods
            .values()
            .filter(|pod| selector_matches(label_selector, pod))
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.pods.remove(name);
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn stream_pod_logs(
        &self,
        _name: &str,
        _opts: LogOptions,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<LogLine>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn get_pod_logs(&self, _name: &str, _opts: LogOptions) -> Result<String> {
        Ok(String::new())
    }
}

//! RPC surface: the orchestrator service consumed by the handler and the
//! log service consumed by worker pods. Thin wrappers that validate,
//! dispatch to the engine, and map engine errors onto status codes.

use std::collections::BTreeMap;
use std::pin::Pin;

use chrono::Utc;
use futures::Stream;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use otto_common::{labels, names};

use crate::config::WorkerConfig;
use crate::error::Error;
use crate::fabric::{self, LogFabric, Registration, Submission};
use crate::pipeline::PipelineSpec;
use crate::proto::otto::{
    LogStreamResponse, PipelineProgress, PipelineRequest, RegistrationResponse,
    RegistrationStatus, ResponseStatus, ScaleDownRequest, ScaleDownResponse, ScaleUpRequest,
    ScaleUpResponse, WorkerLogEntry, WorkerRegistration, WorkerStatus, WorkerStatusRequest,
    WorkerStatusResponse,
    orchestrator_service_server::OrchestratorService,
    worker_log_service_server::WorkerLogService,
};
use crate::scheduler::PipelineScheduler;
use crate::worker::{self, ResourceBounds, WorkerManager, WorkerSpec};

fn to_status(e: Error) -> Status {
    match e {
        Error::Input(_) | Error::Invariant(_) => Status::invalid_argument(e.to_string()),
        Error::AlreadyExists(_) => Status::already_exists(e.to_string()),
        Error::Canceled => Status::cancelled(e.to_string()),
        _ => Status::internal(e.to_string()),
    }
}

/// Fragment limit for scale-up pod names, leaving room for the index.
const SCALE_UP_NAME_LIMIT: usize = 50;

pub struct OrchestratorApi {
    scheduler: PipelineScheduler,
    manager: WorkerManager,
    worker_config: WorkerConfig,
    shutdown: CancellationToken,
}

impl OrchestratorApi {
    pub fn new(
        scheduler: PipelineScheduler,
        manager: WorkerManager,
        worker_config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            manager,
            worker_config,
            shutdown,
        }
    }

    fn scale_up_specs(&self, req: &ScaleUpRequest) -> Vec<WorkerSpec> {
        let base = names::dns_label_with_limit(
            &format!("otto-worker-{}", req.task_id),
            SCALE_UP_NAME_LIMIT,
        );

        let mut base_labels = BTreeMap::new();
        for (key, value) in &self.worker_config.labels {
            base_labels.insert(key.clone(), names::label_value(value));
        }
        base_labels.insert(
            labels::MANAGED_BY.to_string(),
            labels::MANAGED_BY_VALUE.to_string(),
        );
        base_labels.insert(labels::APP.to_string(), labels::WORKER_APP.to_string());
        base_labels.insert(labels::TASK_ID.to_string(), names::label_value(&req.task_id));
        if !req.repository.is_empty() {
            base_labels.insert(
                labels::REPOSITORY.to_string(),
                names::label_value(&req.repository),
            );
        }
        if !req.commit.is_empty() {
            base_labels.insert(labels::COMMIT.to_string(), names::label_value(&req.commit));
        }

        (1..=req.worker_count)
            .map(|index| {
                let mut worker_labels = base_labels.clone();
                worker_labels.insert(labels::WORKER_INDEX.to_string(), index.to_string());
                WorkerSpec {
                    name: format!("{base}-{index}"),
                    image: self.worker_config.image.clone(),
                    command: Vec::new(),
                    args: Vec::new(),
                    labels: worker_labels,
                    resources: ResourceBounds {
                        cpu_limit: (!self.worker_config.cpu_limit.is_empty())
                            .then(|| self.worker_config.cpu_limit.clone()),
                        memory_limit: (!self.worker_config.memory_limit.is_empty())
                            .then(|| self.worker_config.memory_limit.clone()),
                        ..Default::default()
                    },
                }
            })
            .collect()
    }
}

fn time_string(time: Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>) -> String {
    time.map(|t| t.0.to_string()).unwrap_or_default()
}

fn worker_status_of(pod: &Pod) -> WorkerStatus {
    let completed_at = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses.iter().find_map(|s| {
                s.state
                    .as_ref()?
                    .terminated
                    .as_ref()?
                    .finished_at
                    .as_ref()
                    .map(|t| t.0.to_string())
            })
        })
        .unwrap_or_default();

    WorkerStatus {
        pod_name: pod.metadata.name.clone().unwrap_or_default(),
        phase: worker::pod_phase(pod).unwrap_or_default().to_string(),
        node_name: pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default(),
        pod_ip: pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .unwrap_or_default(),
        labels: pod
            .metadata
            .labels
            .clone()
            .map(|m| m.into_iter().collect())
            .unwrap_or_default(),
        created_at: time_string(pod.metadata.creation_timestamp.as_ref()),
        started_at: time_string(pod.status.as_ref().and_then(|s| s.start_time.as_ref())),
        completed_at,
        error_message: worker::nonzero_exit_error(pod).unwrap_or_default(),
    }
}

#[tonic::async_trait]
impl OrchestratorService for OrchestratorApi {
    async fn scale_up(
        &self,
        request: Request<ScaleUpRequest>,
    ) -> Result<Response<ScaleUpResponse>, Status> {
        let req = request.into_inner();
        if req.task_id.is_empty() {
            return Err(Status::invalid_argument("task id must not be empty"));
        }
        if req.worker_count == 0 {
            return Err(Status::invalid_argument("worker count must be positive"));
        }

        let started_at = Utc::now();
        let specs = self.scale_up_specs(&req);
        let pod_names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        tracing::info!(
            task = %req.task_id,
            count = req.worker_count,
            "scale-up accepted"
        );

        // The RPC acknowledges scheduling; the batch runs detached and
        // outcomes are observed through get_worker_status.
        let manager = self.manager.clone();
        let task_id = req.task_id.clone();
        let batch_cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            match manager.run_batch(&specs, &batch_cancel).await {
                Ok(batch) if batch.all_succeeded() => {
                    tracing::info!(task = %task_id, workers = batch.outcomes.len(), "scale-up batch finished");
                }
                Ok(batch) => {
                    tracing::warn!(
                        task = %task_id,
                        failed = ?batch.failed_workers(),
                        "scale-up batch finished with failures"
                    );
                }
                Err(e) => {
                    tracing::warn!(task = %task_id, ?e, "scale-up batch aborted");
                }
            }
        });

        Ok(Response::new(ScaleUpResponse {
            status: ResponseStatus::Success as i32,
            message: format!("scheduled {} workers", req.worker_count),
            pod_names,
            scheduled_count: req.worker_count,
            started_at: started_at.to_rfc3339(),
            completed_at: Utc::now().to_rfc3339(),
        }))
    }

    async fn scale_down(
        &self,
        request: Request<ScaleDownRequest>,
    ) -> Result<Response<ScaleDownResponse>, Status> {
        let req = request.into_inner();
        let deleted = self
            .manager
            .terminate_workers(req.worker_count as usize)
            .await
            .map_err(to_status)?;
        Ok(Response::new(ScaleDownResponse {
            status: ResponseStatus::Success as i32,
            message: format!("issued graceful deletes for {} workers", deleted.len()),
            processed_count: deleted.len() as u32,
            pod_names: deleted,
        }))
    }

    async fn get_worker_status(
        &self,
        request: Request<WorkerStatusRequest>,
    ) -> Result<Response<WorkerStatusResponse>, Status> {
        let req = request.into_inner();
        let pods = self.manager.list_active().await.map_err(to_status)?;

        let workers: Vec<WorkerStatus> = pods
            .iter()
            .filter(|pod| {
                if req.task_id.is_empty() {
                    return true;
                }
                pod.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(labels::TASK_ID))
                    .map(String::as_str)
                    == Some(req.task_id.as_str())
            })
            .map(worker_status_of)
            .collect();

        let count_phase = |phase: &str| workers.iter().filter(|w| w.phase == phase).count() as u32;
        Ok(Response::new(WorkerStatusResponse {
            running: count_phase("Running"),
            pending: count_phase("Pending"),
            succeeded: count_phase("Succeeded"),
            failed: count_phase("Failed"),
            workers,
        }))
    }

    type ExecutePipelineStream =
        Pin<Box<dyn Stream<Item = Result<PipelineProgress, Status>> + Send>>;

    async fn execute_pipeline(
        &self,
        request: Request<PipelineRequest>,
    ) -> Result<Response<Self::ExecutePipelineStream>, Status> {
        let spec = PipelineSpec::from_proto(request.into_inner()).map_err(to_status)?;
        tracing::info!(
            pipeline = %spec.id,
            stages = spec.stages.len(),
            repository = %spec.repository,
            "pipeline execution requested"
        );
        let rx = self
            .scheduler
            .execute(spec, self.shutdown.child_token())
            .await
            .map_err(to_status)?;
        let stream = ReceiverStream::new(rx).map(|progress| Ok(progress.into_proto()));
        Ok(Response::new(Box::pin(stream)))
    }
}

pub struct WorkerLogApi {
    fabric: LogFabric,
}

impl WorkerLogApi {
    pub fn new(fabric: LogFabric) -> Self {
        Self { fabric }
    }
}

#[tonic::async_trait]
impl WorkerLogService for WorkerLogApi {
    async fn register_worker(
        &self,
        request: Request<WorkerRegistration>,
    ) -> Result<Response<RegistrationResponse>, Status> {
        let req = request.into_inner();
        match self
            .fabric
            .register(&req.worker_id, &req.task_id)
            .await
            .map_err(to_status)?
        {
            Registration::Accepted { session, config } => {
                Ok(Response::new(RegistrationResponse {
                    status: RegistrationStatus::Accepted as i32,
                    session_id: session.id.clone(),
                    message: "registered".to_string(),
                    config: Some(config),
                }))
            }
            Registration::AlreadyRegistered { session_id } => {
                Ok(Response::new(RegistrationResponse {
                    status: RegistrationStatus::AlreadyRegistered as i32,
                    session_id,
                    message: format!("worker '{}' already has an active session", req.worker_id),
                    config: None,
                }))
            }
            Registration::ServerFull => Ok(Response::new(RegistrationResponse {
                status: RegistrationStatus::ServerFull as i32,
                session_id: String::new(),
                message: format!("session limit reached for worker '{}'", req.worker_id),
                config: None,
            })),
        }
    }

    type StreamLogsStream =
        Pin<Box<dyn Stream<Item = Result<LogStreamResponse, Status>> + Send>>;

    async fn stream_logs(
        &self,
        request: Request<Streaming<WorkerLogEntry>>,
    ) -> Result<Response<Self::StreamLogsStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(fabric::RESPONSE_CHANNEL_CAPACITY);
        let fabric = self.fabric.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(entry)) => match fabric.submit(entry, tx.clone()).await {
                        Submission::Queued => {}
                        Submission::Rejected(response) => {
                            if tx.send(Ok(response)).await.is_err() {
                                break;
                            }
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(?e, "log ingest stream ended");
                        break;
                    }
                }
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

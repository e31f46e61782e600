//! Pipeline data model: stages, DAG level computation, worker spec
//! synthesis, and the progress event shape.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use otto_common::{labels, names};

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::proto::otto;
use crate::worker::{ResourceBounds, WorkerSpec};

/// Prefix for every pipeline worker pod name.
pub const POD_NAME_PREFIX: &str = "otto-worker";

/// The prefix + pipeline id + stage id fragment is truncated to this many
/// characters before the worker index suffix, keeping the composite within
/// the DNS label cap.
const POD_NAME_BASE_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub id: String,
    pub name: String,
    pub stage_type: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub worker_count: u32,
    pub depends_on: Vec<String>,
    pub retry: Option<RetryPolicy>,
}

/// A validated pipeline request.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub id: String,
    pub name: String,
    pub stages: Vec<Stage>,
    pub repository: String,
    pub commit: String,
    pub triggered_by: String,
    pub reason: String,
}

impl PipelineSpec {
    pub fn from_proto(req: otto::PipelineRequest) -> Result<Self> {
        if req.pipeline_id.is_empty() {
            return Err(Error::Input("pipeline id must not be empty".to_string()));
        }
        if req.stages.is_empty() {
            return Err(Error::Input(format!(
                "pipeline '{}' has no stages",
                req.pipeline_id
            )));
        }

        let mut seen = HashSet::new();
        let mut stages = Vec::with_capacity(req.stages.len());
        for stage in req.stages {
            if stage.id.is_empty() {
                return Err(Error::Input("stage id must not be empty".to_string()));
            }
            if !seen.insert(stage.id.clone()) {
                return Err(Error::Input(format!("duplicate stage id '{}'", stage.id)));
            }
            if stage.worker_count == 0 {
                return Err(Error::Input(format!(
                    "stage '{}' requires a worker count of at least 1",
                    stage.id
                )));
            }
            stages.push(Stage {
                id: stage.id,
                name: stage.name,
                stage_type: stage.stage_type,
                image: stage.image,
                command: stage.command,
                args: stage.args,
                worker_count: stage.worker_count,
                depends_on: stage.depends_on,
                retry: stage.retry.map(|r| RetryPolicy {
                    max_attempts: r.max_attempts,
                    delay: Duration::from_secs(u64::from(r.delay_seconds)),
                }),
            });
        }

        Ok(Self {
            id: req.pipeline_id,
            name: req.name,
            stages,
            repository: req.repository,
            commit: req.commit,
            triggered_by: req.triggered_by,
            reason: req.reason,
        })
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }
}

/// Group stages into parallel levels: repeatedly take every stage whose
/// remaining dependencies are satisfied. A round that makes no progress
/// while stages remain means the dependency graph has a cycle.
pub fn plan_levels(stages: &[Stage]) -> Result<Vec<Vec<String>>> {
    let ids: HashSet<&str> = stages.iter().map(|s| s.id.as_str()).collect();
    for stage in stages {
        for dep in &stage.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(Error::Invariant(format!(
                    "stage '{}' depends on unknown stage '{}'",
                    stage.id, dep
                )));
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> = stages
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for stage in stages {
        for dep in &stage.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(stage.id.as_str());
        }
    }

    let mut levels = Vec::new();
    while !in_degree.is_empty() {
        // Request order within a level is preserved.
        let level: Vec<String> = stages
            .iter()
            .filter(|s| in_degree.get(s.id.as_str()) == Some(&0))
            .map(|s| s.id.clone())
            .collect();
        if level.is_empty() {
            let mut remaining: Vec<&str> = in_degree.keys().copied().collect();
            remaining.sort_unstable();
            return Err(Error::Invariant(format!(
                "dependency cycle detected among stages: {}",
                remaining.join(", ")
            )));
        }
        for id in &level {
            in_degree.remove(id.as_str());
            if let Some(next) = dependents.get(id.as_str()) {
                for dependent in next {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                    }
                }
            }
        }
        levels.push(level);
    }
    Ok(levels)
}

/// Pod name for worker `index` of a stage: sanitized
/// `otto-worker-<pipeline>-<stage>` base plus the index suffix.
pub fn worker_pod_name(pipeline_id: &str, stage_id: &str, index: u32) -> String {
    let base = format!("{POD_NAME_PREFIX}-{pipeline_id}-{stage_id}");
    let base = names::dns_label_with_limit(&base, POD_NAME_BASE_LIMIT);
    format!("{base}-{index}")
}

/// Worker specs for one stage, indexed 1..=worker_count.
pub fn stage_worker_specs(
    pipeline: &PipelineSpec,
    stage: &Stage,
    worker_config: &WorkerConfig,
) -> Vec<WorkerSpec> {
    let image = if stage.image.is_empty() {
        worker_config.image.clone()
    } else {
        stage.image.clone()
    };

    let mut base_labels = BTreeMap::new();
    for (key, value) in &worker_config.labels {
        base_labels.insert(key.clone(), names::label_value(value));
    }
    base_labels.insert(
        labels::MANAGED_BY.to_string(),
        labels::MANAGED_BY_VALUE.to_string(),
    );
    base_labels.insert(labels::APP.to_string(), labels::WORKER_APP.to_string());
    base_labels.insert(
        labels::PIPELINE_ID.to_string(),
        names::label_value(&pipeline.id),
    );
    base_labels.insert(labels::STAGE_ID.to_string(), names::label_value(&stage.id));
    base_labels.insert(
        labels::STAGE_TYPE.to_string(),
        names::label_value(&stage.stage_type),
    );

    let resources = ResourceBounds {
        cpu_limit: (!worker_config.cpu_limit.is_empty()).then(|| worker_config.cpu_limit.clone()),
        memory_limit: (!worker_config.memory_limit.is_empty())
            .then(|| worker_config.memory_limit.clone()),
        ..Default::default()
    };

    (1..=stage.worker_count)
        .map(|index| WorkerSpec {
            name: worker_pod_name(&pipeline.id, &stage.id, index),
            image: image.clone(),
            command: stage.command.clone(),
            args: stage.args.clone(),
            labels: base_labels.clone(),
            resources: resources.clone(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Skipped,
}

impl StageStatus {
    pub fn as_proto(self) -> i32 {
        match self {
            StageStatus::Pending => otto::StageStatus::Pending as i32,
            StageStatus::Running => otto::StageStatus::Running as i32,
            StageStatus::Completed => otto::StageStatus::Completed as i32,
            StageStatus::Failed => otto::StageStatus::Failed as i32,
            StageStatus::Retrying => otto::StageStatus::Retrying as i32,
            StageStatus::Skipped => otto::StageStatus::Skipped as i32,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StageMetrics {
    pub duration: Duration,
    pub successful_workers: u32,
    pub total_workers: u32,
}

/// Mutable execution record for one stage.
#[derive(Debug, Clone)]
pub struct StageExecution {
    pub stage_id: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub pod_names: Vec<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub metrics: Option<StageMetrics>,
}

impl StageExecution {
    pub fn new(stage_id: &str) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            status: StageStatus::Pending,
            started_at: None,
            ended_at: None,
            pod_names: Vec::new(),
            retry_count: 0,
            last_error: None,
            metrics: None,
        }
    }
}

/// One progress event on the pipeline's stream. A pipeline-level envelope
/// carries an empty stage id.
#[derive(Debug, Clone)]
pub struct Progress {
    pub pipeline_id: String,
    pub stage_id: String,
    pub status: StageStatus,
    pub message: String,
    pub percent: u32,
    pub timestamp: DateTime<Utc>,
    pub pod_names: Vec<String>,
    pub metrics: Option<StageMetrics>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Progress {
    pub fn pipeline_level(pipeline_id: &str, status: StageStatus, message: String) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            stage_id: String::new(),
            status,
            message,
            percent: match status {
                StageStatus::Completed => 100,
                _ => 0,
            },
            timestamp: Utc::now(),
            pod_names: Vec::new(),
            metrics: None,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    pub fn stage_level(pipeline_id: &str, exec: &StageExecution, message: String) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            stage_id: exec.stage_id.clone(),
            status: exec.status,
            message,
            percent: match exec.status {
                StageStatus::Completed => 100,
                _ => 0,
            },
            timestamp: Utc::now(),
            pod_names: exec.pod_names.clone(),
            metrics: exec.metrics,
            started_at: exec.started_at,
            ended_at: exec.ended_at,
            error: exec.last_error.clone(),
        }
    }

    pub fn is_pipeline_level(&self) -> bool {
        self.stage_id.is_empty()
    }

    pub fn into_proto(self) -> otto::PipelineProgress {
        otto::PipelineProgress {
            pipeline_id: self.pipeline_id,
            stage_id: self.stage_id,
            status: self.status.as_proto(),
            message: self.message,
            percent: self.percent,
            timestamp: self.timestamp.to_rfc3339(),
            pod_names: self.pod_names,
            metrics: self.metrics.map(|m| otto::StageMetrics {
                duration_seconds: m.duration.as_secs_f64(),
                successful_workers: m.successful_workers,
                total_workers: m.total_workers,
            }),
            started_at: self
                .started_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            ended_at: self.ended_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            error: self.error.unwrap_or_default(),
        }
    }
}

//! Pipeline execution engine: admission, level-by-level fan-out with
//! fail-fast, per-stage retry, progress emission, and a cancellation
//! domain per pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use otto_common::wait;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::pipeline::{
    self, PipelineSpec, Progress, Stage, StageExecution, StageMetrics, StageStatus,
};
use crate::worker::WorkerManager;

/// Progress events queue here per pipeline; intermediate events are
/// dropped with a warning when the consumer lags this far behind.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 100;

struct PipelineRun {
    spec: PipelineSpec,
    cancel: CancellationToken,
    executions: Mutex<HashMap<String, StageExecution>>,
}

struct SchedulerInner {
    manager: WorkerManager,
    worker_config: WorkerConfig,
    active: RwLock<HashMap<String, CancellationToken>>,
}

#[derive(Clone)]
pub struct PipelineScheduler {
    inner: Arc<SchedulerInner>,
}

impl PipelineScheduler {
    pub fn new(manager: WorkerManager, worker_config: WorkerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                manager,
                worker_config,
                active: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Admit and launch a pipeline. The returned receiver is the progress
    /// stream; it always terminates with exactly one pipeline-level
    /// `Completed` or `Failed` event and then closes. Dropping the
    /// receiver cancels the pipeline.
    pub async fn execute(
        &self,
        spec: PipelineSpec,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Progress>> {
        let levels = pipeline::plan_levels(&spec.stages)?;

        {
            let mut active = self.inner.active.write().await;
            if active.contains_key(&spec.id) {
                return Err(Error::AlreadyExists(spec.id.clone()));
            }
            active.insert(spec.id.clone(), cancel.clone());
        }

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);

        // Client disconnect collapses the pipeline's cancellation domain.
        // The watcher exits once the pipeline itself winds down, releasing
        // its sender clone so the stream can close.
        let watch_tx = tx.clone();
        let watch_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watch_tx.closed() => watch_cancel.cancel(),
                _ = watch_cancel.cancelled() => {}
            }
        });

        let executions = spec
            .stages
            .iter()
            .map(|s| (s.id.clone(), StageExecution::new(&s.id)))
            .collect();
        let run = Arc::new(PipelineRun {
            spec,
            cancel,
            executions: Mutex::new(executions),
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.drive(run, levels, tx).await;
        });
        Ok(rx)
    }

    pub async fn is_executing(&self, pipeline_id: &str) -> bool {
        self.inner.active.read().await.contains_key(pipeline_id)
    }

    /// Trip a pipeline's cancellation domain. Returns false for unknown or
    /// already-finished pipelines.
    pub async fn cancel(&self, pipeline_id: &str) -> bool {
        match self.inner.active.read().await.get(pipeline_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every executing pipeline (server shutdown).
    pub async fn cancel_all(&self) {
        for token in self.inner.active.read().await.values() {
            token.cancel();
        }
    }

    async fn drive(
        &self,
        run: Arc<PipelineRun>,
        levels: Vec<Vec<String>>,
        tx: mpsc::Sender<Progress>,
    ) {
        let pipeline_id = run.spec.id.clone();
        tracing::info!(
            pipeline = %pipeline_id,
            stages = run.spec.stages.len(),
            levels = levels.len(),
            "pipeline accepted"
        );

        // Start and terminal envelopes are emitted while no stage task is
        // producing, so they use a blocking send and are never dropped.
        let _ = tx
            .send(Progress::pipeline_level(
                &pipeline_id,
                StageStatus::Pending,
                format!("pipeline '{}' accepted", run.spec.name),
            ))
            .await;

        let result = self.run_levels(&run, &levels, &tx).await;

        match result {
            Ok(()) => {
                tracing::info!(pipeline = %pipeline_id, "pipeline completed");
                let _ = tx
                    .send(Progress::pipeline_level(
                        &pipeline_id,
                        StageStatus::Completed,
                        format!("pipeline '{}' completed", run.spec.name),
                    ))
                    .await;
            }
            Err(e) => {
                let skipped = {
                    let executions = run.executions.lock().await;
                    let mut skipped: Vec<String> = executions
                        .values()
                        .filter(|x| x.status == StageStatus::Skipped)
                        .map(|x| x.stage_id.clone())
                        .collect();
                    skipped.sort_unstable();
                    skipped
                };
                tracing::warn!(pipeline = %pipeline_id, ?e, ?skipped, "pipeline failed");
                let mut progress = Progress::pipeline_level(
                    &pipeline_id,
                    StageStatus::Failed,
                    if skipped.is_empty() {
                        format!("pipeline '{}' failed", run.spec.name)
                    } else {
                        format!(
                            "pipeline '{}' failed, skipped stages: {}",
                            run.spec.name,
                            skipped.join(", ")
                        )
                    },
                );
                progress.error = Some(e.to_string());
                let _ = tx.send(progress).await;
            }
        }

        self.inner.active.write().await.remove(&pipeline_id);
        // Releases the disconnect watcher and any in-flight stage waits.
        run.cancel.cancel();
    }

    async fn run_levels(
        &self,
        run: &Arc<PipelineRun>,
        levels: &[Vec<String>],
        tx: &mpsc::Sender<Progress>,
    ) -> Result<()> {
        for level in levels {
            if run.cancel.is_cancelled() {
                self.skip_pending(run, tx).await;
                return Err(Error::Canceled);
            }

            let mut handles = Vec::with_capacity(level.len());
            for stage_id in level {
                let stage = run
                    .spec
                    .stage(stage_id)
                    .cloned()
                    .ok_or_else(|| Error::Invariant(format!("unknown stage '{stage_id}'")))?;
                let scheduler = self.clone();
                let run = run.clone();
                let tx = tx.clone();
                handles.push(tokio::spawn(async move {
                    scheduler.run_stage(&run, stage, &tx).await
                }));
            }

            let mut level_error = None;
            for handle in handles {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        if level_error.is_none() {
                            level_error = Some(e);
                        }
                    }
                    Err(e) => {
                        if level_error.is_none() {
                            level_error = Some(Error::Invariant(format!(
                                "stage task panicked: {e}"
                            )));
                        }
                    }
                }
            }

            if let Some(e) = level_error {
                // Fail fast: collapse the rest of the pipeline.
                run.cancel.cancel();
                self.skip_pending(run, tx).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        run: &Arc<PipelineRun>,
        stage: Stage,
        tx: &mpsc::Sender<Progress>,
    ) -> Result<()> {
        loop {
            let intended: Vec<String> = (1..=stage.worker_count)
                .map(|i| pipeline::worker_pod_name(&run.spec.id, &stage.id, i))
                .collect();
            {
                let mut executions = run.executions.lock().await;
                let exec = executions
                    .get_mut(&stage.id)
                    .expect("stage execution exists");
                exec.status = StageStatus::Running;
                exec.started_at = Some(Utc::now());
                exec.pod_names = intended;
                self.emit(
                    tx,
                    Progress::stage_level(
                        &run.spec.id,
                        exec,
                        format!("stage '{}' running", stage.name),
                    ),
                );
            }

            let specs = pipeline::stage_worker_specs(&run.spec, &stage, &self.inner.worker_config);
            let total = stage.worker_count;

            // Terminal worker outcomes become stage results here; transport
            // faults and cancellation short-circuit below.
            let attempt: std::result::Result<u32, (Error, u32)> = if total == 1 {
                match self.inner.manager.run_worker(&specs[0], &run.cancel).await {
                    Ok(outcome) if outcome.succeeded() => Ok(1),
                    Ok(outcome) => {
                        let reason = outcome
                            .failure
                            .unwrap_or_else(|| "unknown failure".to_string());
                        Err((
                            Error::WorkerFailed {
                                worker: outcome.name,
                                reason,
                            },
                            0,
                        ))
                    }
                    Err(Error::Canceled) => return self.fail_canceled(run, &stage).await,
                    Err(e) => Err((e, 0)),
                }
            } else {
                match self.inner.manager.run_batch(&specs, &run.cancel).await {
                    Ok(batch) => {
                        let successes = batch.successful();
                        match batch.failure() {
                            None => Ok(successes),
                            Some(e) => Err((e, successes)),
                        }
                    }
                    Err(Error::Canceled) => return self.fail_canceled(run, &stage).await,
                    Err(e) => Err((e, 0)),
                }
            };

            match attempt {
                Ok(successes) => {
                    let mut executions = run.executions.lock().await;
                    let exec = executions
                        .get_mut(&stage.id)
                        .expect("stage execution exists");
                    let ended = Utc::now();
                    exec.status = StageStatus::Completed;
                    exec.ended_at = Some(ended);
                    exec.metrics = Some(StageMetrics {
                        duration: duration_since(exec.started_at, ended),
                        successful_workers: successes,
                        total_workers: total,
                    });
                    self.emit(
                        tx,
                        Progress::stage_level(
                            &run.spec.id,
                            exec,
                            format!("stage '{}' completed", stage.name),
                        ),
                    );
                    return Ok(());
                }
                Err((error, successes)) => {
                    let retry = {
                        let mut executions = run.executions.lock().await;
                        let exec = executions
                            .get_mut(&stage.id)
                            .expect("stage execution exists");
                        exec.last_error = Some(error.to_string());
                        match stage.retry {
                            Some(policy) if exec.retry_count < policy.max_attempts => {
                                exec.retry_count += 1;
                                exec.status = StageStatus::Retrying;
                                self.emit(
                                    tx,
                                    Progress::stage_level(
                                        &run.spec.id,
                                        exec,
                                        format!(
                                            "stage '{}' retrying (attempt {} of {})",
                                            stage.name,
                                            exec.retry_count + 1,
                                            policy.max_attempts + 1
                                        ),
                                    ),
                                );
                                Some(policy)
                            }
                            _ => {
                                let ended = Utc::now();
                                exec.status = StageStatus::Failed;
                                exec.ended_at = Some(ended);
                                exec.metrics = Some(StageMetrics {
                                    duration: duration_since(exec.started_at, ended),
                                    successful_workers: successes,
                                    total_workers: total,
                                });
                                self.emit(
                                    tx,
                                    Progress::stage_level(
                                        &run.spec.id,
                                        exec,
                                        format!("stage '{}' failed", stage.name),
                                    ),
                                );
                                None
                            }
                        }
                    };

                    match retry {
                        Some(policy) => {
                            if wait::sleep_with_cancel(&run.cancel, policy.delay).await.is_err() {
                                return Err(Error::Canceled);
                            }
                        }
                        None => return Err(error),
                    }
                }
            }
        }
    }

    async fn fail_canceled(&self, run: &Arc<PipelineRun>, stage: &Stage) -> Result<()> {
        let mut executions = run.executions.lock().await;
        if let Some(exec) = executions.get_mut(&stage.id) {
            exec.status = StageStatus::Failed;
            exec.ended_at = Some(Utc::now());
            exec.last_error = Some(Error::Canceled.to_string());
        }
        Err(Error::Canceled)
    }

    async fn skip_pending(&self, run: &Arc<PipelineRun>, tx: &mpsc::Sender<Progress>) {
        let mut executions = run.executions.lock().await;
        // Stable order keeps the event stream deterministic.
        let mut pending: Vec<&mut StageExecution> = executions
            .values_mut()
            .filter(|x| x.status == StageStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.stage_id.cmp(&b.stage_id));
        for exec in pending {
            exec.status = StageStatus::Skipped;
            exec.ended_at = Some(Utc::now());
            self.emit(
                tx,
                Progress::stage_level(
                    &run.spec.id,
                    exec,
                    format!("stage '{}' skipped", exec.stage_id),
                ),
            );
        }
    }

    /// Non-blocking emission for intermediate progress: a full channel
    /// drops the event with a warning, a closed channel is the disconnect
    /// watcher's concern.
    fn emit(&self, tx: &mpsc::Sender<Progress>, progress: Progress) {
        match tx.try_send(progress) {
            Ok(()) => {}
            Err(TrySendError::Full(p)) => {
                tracing::warn!(
                    pipeline = %p.pipeline_id,
                    stage = %p.stage_id,
                    "progress channel full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

fn duration_since(
    started: Option<chrono::DateTime<Utc>>,
    ended: chrono::DateTime<Utc>,
) -> std::time::Duration {
    started
        .and_then(|s| (ended - s).to_std().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipeline::RetryPolicy;
    use crate::testutil::FakeGateway;

    fn scheduler_for(gateway: Arc<FakeGateway>) -> PipelineScheduler {
        let manager = WorkerManager::new(gateway)
            .poll_interval(Duration::from_millis(5))
            .cleanup_timeout(Duration::from_millis(200));
        PipelineScheduler::new(manager, WorkerConfig::default())
    }

    fn stage(id: &str, deps: &[&str]) -> Stage {
        Stage {
            id: id.to_string(),
            name: id.to_string(),
            stage_type: "build".to_string(),
            image: "alpine:latest".to_string(),
            command: vec!["true".to_string()],
            args: Vec::new(),
            worker_count: 1,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            retry: None,
        }
    }

    fn spec(id: &str, stages: Vec<Stage>) -> PipelineSpec {
        PipelineSpec {
            id: id.to_string(),
            name: id.to_string(),
            stages,
            repository: "acme/app".to_string(),
            commit: "deadbeef".to_string(),
            triggered_by: "ci".to_string(),
            reason: "push".to_string(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Progress>) -> Vec<Progress> {
        let drain = async {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        };
        tokio::time::timeout(Duration::from_secs(10), drain)
            .await
            .expect("progress stream did not close")
    }

    fn statuses_of(events: &[Progress], stage_id: &str) -> Vec<StageStatus> {
        events
            .iter()
            .filter(|e| e.stage_id == stage_id)
            .map(|e| e.status)
            .collect()
    }

    #[tokio::test]
    async fn single_stage_pipeline_succeeds_with_ordered_events() {
        let gateway = Arc::new(FakeGateway::new());
        let scheduler = scheduler_for(gateway.clone());

        let rx = scheduler
            .execute(
                spec("p-single", vec![stage("build", &[])]),
                CancellationToken::new(),
            )
            .await
            .expect("execute");
        let events = collect(rx).await;

        assert!(events[0].is_pipeline_level());
        assert_eq!(events[0].status, StageStatus::Pending);
        let last = events.last().expect("terminal event");
        assert!(last.is_pipeline_level());
        assert_eq!(last.status, StageStatus::Completed);
        let terminal_count = events
            .iter()
            .filter(|e| {
                e.is_pipeline_level()
                    && matches!(e.status, StageStatus::Completed | StageStatus::Failed)
            })
            .count();
        assert_eq!(terminal_count, 1);

        assert_eq!(
            statuses_of(&events, "build"),
            vec![StageStatus::Running, StageStatus::Completed]
        );
        let completed = events
            .iter()
            .find(|e| e.stage_id == "build" && e.status == StageStatus::Completed)
            .expect("completed event");
        assert_eq!(completed.percent, 100);
        let metrics = completed.metrics.expect("metrics");
        assert_eq!(metrics.successful_workers, 1);
        assert_eq!(metrics.total_workers, 1);

        assert_eq!(gateway.live_pod_count().await, 0);
        assert!(!scheduler.is_executing("p-single").await);
    }

    #[tokio::test]
    async fn parallel_level_runs_before_dependent_stage() {
        let gateway = Arc::new(FakeGateway::new());
        let scheduler = scheduler_for(gateway.clone());

        let rx = scheduler
            .execute(
                spec(
                    "p-par",
                    vec![
                        stage("a", &[]),
                        stage("b", &[]),
                        stage("c", &[]),
                        stage("d", &["a", "b", "c"]),
                    ],
                ),
                CancellationToken::new(),
            )
            .await
            .expect("execute");
        let events = collect(rx).await;

        // d's terminal event comes after every first-level terminal.
        let terminal_index = |id: &str| {
            events
                .iter()
                .position(|e| e.stage_id == id && e.status == StageStatus::Completed)
                .unwrap_or_else(|| panic!("no completed event for {id}"))
        };
        let d = terminal_index("d");
        for id in ["a", "b", "c"] {
            assert!(terminal_index(id) < d, "{id} finished after d");
        }

        assert_eq!(gateway.created_names().await.len(), 4);
        assert_eq!(gateway.live_pod_count().await, 0);
    }

    #[tokio::test]
    async fn stage_failure_skips_dependents_and_fails_the_pipeline() {
        let gateway = Arc::new(FakeGateway::failing_names(&["otto-worker-p-skip-test-1"]));
        let scheduler = scheduler_for(gateway.clone());

        let rx = scheduler
            .execute(
                spec(
                    "p-skip",
                    vec![stage("test", &[]), stage("deploy", &["test"])],
                ),
                CancellationToken::new(),
            )
            .await
            .expect("execute");
        let events = collect(rx).await;

        assert_eq!(
            statuses_of(&events, "test"),
            vec![StageStatus::Running, StageStatus::Failed]
        );
        assert_eq!(statuses_of(&events, "deploy"), vec![StageStatus::Skipped]);

        let last = events.last().expect("terminal");
        assert!(last.is_pipeline_level());
        assert_eq!(last.status, StageStatus::Failed);
        assert!(last.message.contains("deploy"), "message: {}", last.message);
        assert!(last.error.is_some());

        assert_eq!(gateway.live_pod_count().await, 0);
    }

    #[tokio::test]
    async fn flaky_stage_retries_once_then_succeeds() {
        let gateway = Arc::new(FakeGateway::flaky("build", 1));
        let scheduler = scheduler_for(gateway.clone());

        let mut flaky = stage("build", &[]);
        flaky.retry = Some(RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(5),
        });

        let rx = scheduler
            .execute(spec("p-retry", vec![flaky]), CancellationToken::new())
            .await
            .expect("execute");
        let events = collect(rx).await;

        assert_eq!(
            statuses_of(&events, "build"),
            vec![
                StageStatus::Running,
                StageStatus::Retrying,
                StageStatus::Running,
                StageStatus::Completed,
            ]
        );
        assert_eq!(
            gateway
                .creation_attempts("otto-worker-p-retry-build-1")
                .await,
            2
        );
        assert_eq!(gateway.live_pod_count().await, 0);
    }

    #[tokio::test]
    async fn deterministic_failure_exhausts_retries_with_n_plus_one_pods() {
        let gateway = Arc::new(FakeGateway::failing_names(&["otto-worker-p-exhaust-build-1"]));
        let scheduler = scheduler_for(gateway.clone());

        let mut doomed = stage("build", &[]);
        doomed.retry = Some(RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(1),
        });

        let rx = scheduler
            .execute(spec("p-exhaust", vec![doomed]), CancellationToken::new())
            .await
            .expect("execute");
        let events = collect(rx).await;

        let last = events.last().expect("terminal");
        assert_eq!(last.status, StageStatus::Failed);
        assert_eq!(
            gateway
                .creation_attempts("otto-worker-p-exhaust-build-1")
                .await,
            3
        );
        assert_eq!(gateway.live_pod_count().await, 0);
    }

    #[tokio::test]
    async fn dropping_the_progress_stream_cancels_the_pipeline() {
        let gateway = Arc::new(FakeGateway::never_terminal());
        let scheduler = scheduler_for(gateway.clone());

        let rx = scheduler
            .execute(
                spec("p-cancel", vec![stage("sleepy", &[])]),
                CancellationToken::new(),
            )
            .await
            .expect("execute");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.is_executing("p-cancel").await);
        drop(rx);

        let wound_down = async {
            while scheduler.is_executing("p-cancel").await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wound_down)
            .await
            .expect("pipeline did not wind down after disconnect");
        assert_eq!(gateway.live_pod_count().await, 0);
    }

    #[tokio::test]
    async fn explicit_cancel_unwinds_in_flight_workers() {
        let gateway = Arc::new(FakeGateway::never_terminal());
        let scheduler = scheduler_for(gateway.clone());

        let rx = scheduler
            .execute(
                spec("p-explicit", vec![stage("sleepy", &[])]),
                CancellationToken::new(),
            )
            .await
            .expect("execute");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.cancel("p-explicit").await);

        let events = collect(rx).await;
        let last = events.last().expect("terminal");
        assert!(last.is_pipeline_level());
        assert_eq!(last.status, StageStatus::Failed);
        assert_eq!(gateway.live_pod_count().await, 0);
        assert!(!scheduler.is_executing("p-explicit").await);
    }

    #[tokio::test]
    async fn duplicate_pipeline_id_is_rejected_until_the_first_finishes() {
        let gateway = Arc::new(FakeGateway::never_terminal());
        let scheduler = scheduler_for(gateway.clone());

        let rx = scheduler
            .execute(
                spec("p-dup", vec![stage("sleepy", &[])]),
                CancellationToken::new(),
            )
            .await
            .expect("execute");

        let second = scheduler
            .execute(
                spec("p-dup", vec![stage("sleepy", &[])]),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(second, Err(Error::AlreadyExists(_))));

        scheduler.cancel("p-dup").await;
        collect(rx).await;

        // The id is reusable once the first execution has terminated.
        let rx = scheduler
            .execute(
                spec("p-dup", vec![stage("sleepy", &[])]),
                CancellationToken::new(),
            )
            .await
            .expect("re-execute after termination");
        scheduler.cancel("p-dup").await;
        collect(rx).await;
    }

    #[tokio::test]
    async fn cyclic_pipelines_are_rejected_at_admission() {
        let gateway = Arc::new(FakeGateway::new());
        let scheduler = scheduler_for(gateway.clone());

        let err = scheduler
            .execute(
                spec(
                    "p-cycle",
                    vec![stage("a", &["b"]), stage("b", &["a"])],
                ),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(err, Err(Error::Invariant(_))));
        assert!(gateway.created_names().await.is_empty());
        assert!(!scheduler.is_executing("p-cycle").await);
    }
}

//! Ingress log fabric: worker registration, per-session ordered
//! forwarding toward the handler, and periodic session cleanup.
//!
//! Each session owns a bounded entry channel. The ingest side blocks when
//! that channel fills; a per-session forwarder drains it, forwards with
//! retry through the egress sink, and answers `ACK`/`RETRY`/`DROP` on the
//! caller's buffered response channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use otto_common::wait;

use crate::egress::HandlerSink;
use crate::error::{Error, Result};
use crate::proto::handler::{HandlerLogEntry, PodMeta};
use crate::proto::otto::{LogStatus, LogStreamResponse, LoggingConfig, WorkerLogEntry};

/// Per-session entry queue depth. A full queue blocks the producing
/// session until drained.
pub const SESSION_CHANNEL_CAPACITY: usize = 1000;

/// Buffered response channel toward the streaming caller, so a slow
/// client never blocks ingest directly.
pub const RESPONSE_CHANNEL_CAPACITY: usize = 100;

/// Defaults handed back to a registering client.
pub const DEFAULT_RATE_LIMIT_PER_SECOND: u32 = 100;
pub const DEFAULT_CLIENT_BUFFER_SIZE: u32 = 50;
pub const DEFAULT_MAX_MESSAGE_BYTES: u32 = 1024;

pub fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        rate_limit_per_second: DEFAULT_RATE_LIMIT_PER_SECOND,
        client_buffer_size: DEFAULT_CLIENT_BUFFER_SIZE,
        max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        include_metadata: true,
    }
}

#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub max_sessions_per_worker: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub sweep_interval: Duration,
    pub stream_timeout: Duration,
    /// Namespace stamped into egress pod metadata.
    pub namespace: String,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_worker: 5,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5 * 60),
            stream_timeout: Duration::from_secs(30 * 60),
            namespace: "default".to_string(),
        }
    }
}

type ResponseSender = mpsc::Sender<std::result::Result<LogStreamResponse, tonic::Status>>;

struct SessionJob {
    entry: WorkerLogEntry,
    respond: ResponseSender,
}

/// One log-stream binding between a worker process and the engine.
pub struct Session {
    pub id: String,
    pub worker_id: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    tx: mpsc::Sender<SessionJob>,
    cancel: CancellationToken,
    active: AtomicBool,
    forwarded: AtomicU64,
    errors: AtomicU64,
    last_activity: Mutex<DateTime<Utc>>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
        self.cancel.cancel();
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    async fn touch(&self) {
        *self.last_activity.lock().await = Utc::now();
    }
}

/// Outcome of a registration attempt.
pub enum Registration {
    Accepted {
        session: Arc<Session>,
        config: LoggingConfig,
    },
    AlreadyRegistered {
        session_id: String,
    },
    ServerFull,
}

/// What the ingest loop should do with one inbound entry.
pub enum Submission {
    /// Queued on the session; the forwarder will respond.
    Queued,
    /// Rejected up front; respond with this immediately.
    Rejected(LogStreamResponse),
}

struct FabricInner {
    config: FabricConfig,
    sink: Arc<dyn HandlerSink>,
    sessions: RwLock<HashMap<String, Vec<Arc<Session>>>>,
    next_session: AtomicU64,
    dropped: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct LogFabric {
    inner: Arc<FabricInner>,
}

impl LogFabric {
    pub fn new(config: FabricConfig, sink: Arc<dyn HandlerSink>) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                config,
                sink,
                sessions: RwLock::new(HashMap::new()),
                next_session: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn dropped_entries(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Register a worker for log streaming. At most one active session per
    /// worker id; at most `max_sessions_per_worker` sessions total until
    /// the sweeper reclaims them.
    pub async fn register(&self, worker_id: &str, task_id: &str) -> Result<Registration> {
        if worker_id.is_empty() || task_id.is_empty() {
            return Err(Error::Input(
                "registration requires a worker id and a task id".to_string(),
            ));
        }

        let session = {
            let mut sessions = self.inner.sessions.write().await;
            let list = sessions.entry(worker_id.to_string()).or_default();
            if let Some(existing) = list.iter().find(|s| s.is_active()) {
                return Ok(Registration::AlreadyRegistered {
                    session_id: existing.id.clone(),
                });
            }
            if list.len() >= self.inner.config.max_sessions_per_worker {
                return Ok(Registration::ServerFull);
            }

            let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
            let sequence = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
            let session = Arc::new(Session {
                id: format!("session-{sequence}"),
                worker_id: worker_id.to_string(),
                task_id: task_id.to_string(),
                created_at: Utc::now(),
                tx,
                cancel: CancellationToken::new(),
                active: AtomicBool::new(true),
                forwarded: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                last_activity: Mutex::new(Utc::now()),
            });
            list.push(session.clone());

            let fabric = self.clone();
            let forwarder_session = session.clone();
            tokio::spawn(async move {
                fabric.run_session(forwarder_session, rx).await;
            });
            session
        };

        // Outside the registry lock: open the egress stream for this worker.
        if let Err(e) = self.inner.sink.start_stream(worker_id, task_id).await {
            tracing::warn!(worker = %worker_id, ?e, "could not open handler log stream at registration");
        }

        tracing::info!(
            worker = %worker_id,
            task = %task_id,
            session = %session.id,
            "registered worker log session"
        );
        Ok(Registration::Accepted {
            session,
            config: default_logging_config(),
        })
    }

    pub async fn find_active(&self, worker_id: &str) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .read()
            .await
            .get(worker_id)?
            .iter()
            .find(|s| s.is_active())
            .cloned()
    }

    /// Ingest one entry. Validation failures and missing sessions answer
    /// `DROP` immediately; everything else is queued behind the session's
    /// bounded channel for ordered forwarding.
    pub async fn submit(&self, mut entry: WorkerLogEntry, respond: ResponseSender) -> Submission {
        if entry.worker_id.is_empty() || entry.task_id.is_empty() || entry.message.is_empty() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return Submission::Rejected(drop_response(
                "log entry is missing worker id, task id or message",
            ));
        }

        if entry.timestamp.is_empty() {
            entry.timestamp = Utc::now().to_rfc3339();
        }
        if entry.level.is_empty() {
            entry.level = "INFO".to_string();
        }
        if entry.source.is_empty() {
            entry.source = "stdout".to_string();
        }

        let Some(session) = self.find_active(&entry.worker_id).await else {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return Submission::Rejected(drop_response("no active session for worker"));
        };
        session.touch().await;

        if session
            .tx
            .send(SessionJob { entry, respond })
            .await
            .is_err()
        {
            session.deactivate();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return Submission::Rejected(drop_response("session is no longer accepting entries"));
        }
        Submission::Queued
    }

    async fn run_session(&self, session: Arc<Session>, mut rx: mpsc::Receiver<SessionJob>) {
        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => break,
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    let response = self.forward_with_retry(&session, job.entry).await;
                    if job.respond.send(Ok(response)).await.is_err() {
                        session.deactivate();
                        break;
                    }
                }
            }
        }
        tracing::debug!(
            worker = %session.worker_id,
            session = %session.id,
            forwarded = session.forwarded(),
            "session forwarder stopped"
        );
    }

    async fn forward_with_retry(
        &self,
        session: &Session,
        entry: WorkerLogEntry,
    ) -> LogStreamResponse {
        let egress = to_handler_entry(entry, &self.inner.config.namespace, session);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.sink.forward(egress.clone()).await {
                Ok(()) => {
                    let sequence = session.forwarded.fetch_add(1, Ordering::Relaxed) + 1;
                    return LogStreamResponse {
                        status: LogStatus::Ack as i32,
                        sequence,
                        message: String::new(),
                    };
                }
                Err(e) => {
                    session.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        worker = %session.worker_id,
                        attempt,
                        ?e,
                        "failed to forward log entry"
                    );
                    if attempt >= self.inner.config.max_retries {
                        return retry_response("handler unavailable, re-send later");
                    }
                    if wait::sleep_with_cancel(&session.cancel, self.inner.config.retry_delay)
                        .await
                        .is_err()
                    {
                        return retry_response("session closed during retry");
                    }
                }
            }
        }
    }

    /// Start the periodic sweep that reclaims inactive or expired
    /// sessions. The source treats session age alone as grounds for
    /// removal, so a healthy session older than the stream timeout is
    /// dropped too.
    pub async fn spawn_sweeper(&self, cancel: CancellationToken) {
        let fabric = self.clone();
        let interval = self.inner.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => fabric.sweep(Utc::now()).await,
                }
            }
        });
        *self.inner.sweeper.lock().await = Some(handle);
    }

    pub async fn sweep(&self, now: DateTime<Utc>) {
        let cutoff = now
            - chrono::Duration::from_std(self.inner.config.stream_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30 * 60));

        let mut closed_workers = Vec::new();
        {
            let mut sessions = self.inner.sessions.write().await;
            sessions.retain(|worker_id, list| {
                list.retain(|session| {
                    let expired = session.created_at < cutoff;
                    let stale = expired || !session.is_active();
                    if stale {
                        session.deactivate();
                        tracing::info!(
                            worker = %worker_id,
                            session = %session.id,
                            expired,
                            "swept log session"
                        );
                    }
                    !stale
                });
                if list.is_empty() {
                    closed_workers.push(worker_id.clone());
                    false
                } else {
                    true
                }
            });
        }

        for worker in closed_workers {
            if let Err(e) = self.inner.sink.close_stream(&worker).await {
                tracing::warn!(%worker, ?e, "failed to close handler stream after sweep");
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .await
            .values()
            .map(Vec::len)
            .sum()
    }
}

fn to_handler_entry(entry: WorkerLogEntry, namespace: &str, session: &Session) -> HandlerLogEntry {
    HandlerLogEntry {
        worker_id: entry.worker_id,
        task_id: entry.task_id,
        timestamp: entry.timestamp,
        level: entry.level,
        source: entry.source,
        message: entry.message,
        metadata: entry.metadata,
        pod: Some(PodMeta {
            pod_name: session.worker_id.clone(),
            namespace: namespace.to_string(),
            created_at: session.created_at.to_rfc3339(),
        }),
    }
}

fn drop_response(message: &str) -> LogStreamResponse {
    LogStreamResponse {
        status: LogStatus::Drop as i32,
        sequence: 0,
        message: message.to_string(),
    }
}

fn retry_response(message: &str) -> LogStreamResponse {
    LogStreamResponse {
        status: LogStatus::Retry as i32,
        sequence: 0,
        message: message.to_string(),
    }
}

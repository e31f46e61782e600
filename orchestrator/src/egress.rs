//! Outbound log delivery to the Otto handler.
//!
//! One bidirectional stream per worker id. Entries go out on the send
//! side; a spawned reader consumes the handler's per-entry responses
//! until EOF or cancellation. `ACK` may carry a throttle that is applied
//! before the next send; `RETRY` and `DROP` only bump counters here, the
//! fabric's retry loop owns re-sending.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::transport::Channel;

use crate::error::{Error, Result};
use crate::proto::handler::{
    ForwardStatus, HandlerLogEntry, WorkerStatusNotification,
    handler_service_client::HandlerServiceClient,
};

#[derive(Debug, Clone)]
pub struct EgressConfig {
    /// Dial target, e.g. `http://otto-handler:50051`. A bare host:port is
    /// dialed as plaintext, which is the non-production posture.
    pub host: String,
    pub connect_timeout: Duration,
    pub stream_timeout: Duration,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            connect_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Seam between the log fabric and the handler. Production uses
/// [`GrpcHandlerClient`]; `grpc.mock_mode` and tests use
/// [`MockHandlerClient`].
#[async_trait]
pub trait HandlerSink: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn start_stream(&self, worker_id: &str, task_id: &str) -> Result<()>;
    async fn forward(&self, entry: HandlerLogEntry) -> Result<()>;
    async fn notify_status(&self, notification: WorkerStatusNotification) -> Result<()>;
    async fn close_stream(&self, worker_id: &str) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

#[derive(Clone)]
struct StreamHandle {
    tx: mpsc::Sender<HandlerLogEntry>,
    cancel: CancellationToken,
    forwarded: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    throttle_ms: Arc<AtomicU32>,
}

pub struct GrpcHandlerClient {
    config: EgressConfig,
    channel: Mutex<Option<Channel>>,
    streams: RwLock<HashMap<String, StreamHandle>>,
}

impl GrpcHandlerClient {
    pub fn new(config: EgressConfig) -> Self {
        Self {
            config,
            channel: Mutex::new(None),
            streams: RwLock::new(HashMap::new()),
        }
    }

    fn endpoint(&self) -> String {
        if self.config.host.starts_with("http://") || self.config.host.starts_with("https://") {
            self.config.host.clone()
        } else {
            format!("http://{}", self.config.host)
        }
    }

    async fn client(&self) -> Result<HandlerServiceClient<Channel>> {
        let channel = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Handler("egress client is not connected".to_string()))?;
        Ok(HandlerServiceClient::new(channel))
    }
}

#[async_trait]
impl HandlerSink for GrpcHandlerClient {
    async fn connect(&self) -> Result<()> {
        let endpoint = self.endpoint();
        let channel = Channel::from_shared(endpoint.clone())
            .map_err(|e| Error::Handler(format!("invalid handler endpoint '{endpoint}': {e}")))?
            .connect_timeout(self.config.connect_timeout)
            .connect()
            .await
            .map_err(|e| Error::Handler(format!("failed to dial handler at '{endpoint}': {e}")))?;
        *self.channel.lock().await = Some(channel);
        tracing::info!(%endpoint, "connected to handler");
        Ok(())
    }

    async fn start_stream(&self, worker_id: &str, task_id: &str) -> Result<()> {
        if self.streams.read().await.contains_key(worker_id) {
            return Ok(());
        }

        let mut client = self.client().await?;
        let (tx, rx) = mpsc::channel(100);
        let mut responses = client
            .forward_worker_logs(Request::new(ReceiverStream::new(rx)))
            .await
            .map_err(|e| Error::Handler(format!("failed to open handler log stream: {e}")))?
            .into_inner();

        let handle = StreamHandle {
            tx,
            cancel: CancellationToken::new(),
            forwarded: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            throttle_ms: Arc::new(AtomicU32::new(0)),
        };

        let worker = worker_id.to_string();
        let cancel = handle.cancel.clone();
        let errors = handle.errors.clone();
        let dropped = handle.dropped.clone();
        let throttle_ms = handle.throttle_ms.clone();
        let stream_timeout = self.config.stream_timeout;
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(stream_timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut deadline => {
                        tracing::warn!(worker = %worker, "handler log stream hit its timeout");
                        break;
                    }
                    message = responses.message() => match message {
                        Ok(Some(response)) => match response.status() {
                            ForwardStatus::Ack => {
                                if response.throttle_ms > 0 {
                                    throttle_ms.store(response.throttle_ms, Ordering::Relaxed);
                                }
                            }
                            ForwardStatus::Retry => {
                                errors.fetch_add(1, Ordering::Relaxed);
                            }
                            ForwardStatus::Drop => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            ForwardStatus::Unspecified => {}
                        },
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(worker = %worker, ?e, "handler response stream failed");
                            errors.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            }
            cancel.cancel();
        });

        self.streams
            .write()
            .await
            .insert(worker_id.to_string(), handle);
        tracing::debug!(worker = %worker_id, task = %task_id, "opened handler log stream");
        Ok(())
    }

    async fn forward(&self, entry: HandlerLogEntry) -> Result<()> {
        let handle = self
            .streams
            .read()
            .await
            .get(&entry.worker_id)
            .cloned()
            .ok_or_else(|| {
                Error::Handler(format!("no active stream for worker '{}'", entry.worker_id))
            })?;
        if handle.cancel.is_cancelled() {
            return Err(Error::Handler(format!(
                "handler log stream for worker '{}' is closed",
                entry.worker_id
            )));
        }

        // Server-requested pacing, applied before the next send.
        let throttle = handle.throttle_ms.swap(0, Ordering::Relaxed);
        if throttle > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(throttle))).await;
        }

        handle
            .tx
            .send(entry)
            .await
            .map_err(|_| Error::Handler("handler log stream closed mid-send".to_string()))?;
        handle.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn notify_status(&self, notification: WorkerStatusNotification) -> Result<()> {
        let mut client = self.client().await?;
        client
            .notify_worker_status(notification)
            .await
            .map_err(|e| Error::Handler(format!("status notification failed: {e}")))?;
        Ok(())
    }

    async fn close_stream(&self, worker_id: &str) -> Result<()> {
        if let Some(handle) = self.streams.write().await.remove(worker_id) {
            handle.cancel.cancel();
            let forwarded = handle.forwarded.load(Ordering::Relaxed);
            let errors = handle.errors.load(Ordering::Relaxed);
            // Dropping the last sender half-closes the outbound stream.
            drop(handle.tx);
            tracing::info!(
                worker = %worker_id,
                forwarded,
                errors,
                "closed handler log stream"
            );
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let workers: Vec<String> = self.streams.read().await.keys().cloned().collect();
        for worker in workers {
            self.close_stream(&worker).await?;
        }
        *self.channel.lock().await = None;
        tracing::info!("disconnected from handler");
        Ok(())
    }
}

/// Offline stand-in for the handler: records everything, simulates a
/// small forwarding latency, and can be told to fail the next N forwards.
pub struct MockHandlerClient {
    latency: Duration,
    entries: Mutex<Vec<HandlerLogEntry>>,
    notifications: Mutex<Vec<WorkerStatusNotification>>,
    streams: RwLock<HashMap<String, String>>,
    fail_next: AtomicU32,
}

impl MockHandlerClient {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(10),
            entries: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            streams: RwLock::new(HashMap::new()),
            fail_next: AtomicU32::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `n` forwards fail, to exercise retry paths.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::Relaxed);
    }

    pub async fn entries(&self) -> Vec<HandlerLogEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn notifications(&self) -> Vec<WorkerStatusNotification> {
        self.notifications.lock().await.clone()
    }

    pub async fn has_stream(&self, worker_id: &str) -> bool {
        self.streams.read().await.contains_key(worker_id)
    }
}

impl Default for MockHandlerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HandlerSink for MockHandlerClient {
    async fn connect(&self) -> Result<()> {
        tracing::debug!("mock handler: connect");
        Ok(())
    }

    async fn start_stream(&self, worker_id: &str, task_id: &str) -> Result<()> {
        self.streams
            .write()
            .await
            .insert(worker_id.to_string(), task_id.to_string());
        tracing::debug!(worker = %worker_id, task = %task_id, "mock handler: stream opened");
        Ok(())
    }

    async fn forward(&self, entry: HandlerLogEntry) -> Result<()> {
        if self
            .fail_next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Handler("mock handler: simulated failure".to_string()));
        }
        tokio::time::sleep(self.latency).await;
        tracing::debug!(worker = %entry.worker_id, message = %entry.message, "mock handler: forwarded");
        self.entries.lock().await.push(entry);
        Ok(())
    }

    async fn notify_status(&self, notification: WorkerStatusNotification) -> Result<()> {
        tracing::debug!(worker = %notification.worker_id, status = %notification.status, "mock handler: status");
        self.notifications.lock().await.push(notification);
        Ok(())
    }

    async fn close_stream(&self, worker_id: &str) -> Result<()> {
        self.streams.write().await.remove(worker_id);
        tracing::debug!(worker = %worker_id, "mock handler: stream closed");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.streams.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::pin::Pin;

    use futures::Stream;
    use tonic::transport::Server;
    use tonic::{Response, Status, Streaming};

    use super::*;
    use crate::proto::handler::{
        LogForwardResponse, WorkerStatusAck,
        handler_service_server::{HandlerService, HandlerServiceServer},
    };

    struct RecordingHandler {
        entries: Arc<Mutex<Vec<HandlerLogEntry>>>,
        throttle_ms: u32,
    }

    #[tonic::async_trait]
    impl HandlerService for RecordingHandler {
        type ForwardWorkerLogsStream =
            Pin<Box<dyn Stream<Item = std::result::Result<LogForwardResponse, Status>> + Send>>;

        async fn forward_worker_logs(
            &self,
            request: tonic::Request<Streaming<HandlerLogEntry>>,
        ) -> std::result::Result<Response<Self::ForwardWorkerLogsStream>, Status> {
            let mut inbound = request.into_inner();
            let entries = self.entries.clone();
            let throttle_ms = self.throttle_ms;
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                while let Ok(Some(entry)) = inbound.message().await {
                    entries.lock().await.push(entry);
                    let response = LogForwardResponse {
                        status: ForwardStatus::Ack as i32,
                        message: String::new(),
                        throttle_ms,
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
        }

        async fn notify_worker_status(
            &self,
            _request: tonic::Request<WorkerStatusNotification>,
        ) -> std::result::Result<Response<WorkerStatusAck>, Status> {
            Ok(Response::new(WorkerStatusAck {
                status: "ok".to_string(),
            }))
        }
    }

    fn free_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").to_string()
    }

    fn entry(worker: &str, message: &str) -> HandlerLogEntry {
        HandlerLogEntry {
            worker_id: worker.to_string(),
            task_id: "task-1".to_string(),
            message: message.to_string(),
            ..Default::default()
        }
    }

    async fn start_server(throttle_ms: u32) -> (String, Arc<Mutex<Vec<HandlerLogEntry>>>) {
        let addr = free_addr();
        let entries = Arc::new(Mutex::new(Vec::new()));
        let service = RecordingHandler {
            entries: entries.clone(),
            throttle_ms,
        };
        let server_addr: std::net::SocketAddr = addr.parse().expect("addr parse");
        tokio::spawn(async move {
            Server::builder()
                .add_service(HandlerServiceServer::new(service))
                .serve(server_addr)
                .await
                .expect("server");
        });
        (addr, entries)
    }

    async fn connect_with_retry(client: &GrpcHandlerClient) {
        for _ in 0..50 {
            if client.connect().await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("handler test server never came up");
    }

    #[tokio::test]
    async fn forwards_entries_over_a_real_stream() {
        let (addr, entries) = start_server(0).await;
        let client = GrpcHandlerClient::new(EgressConfig {
            host: addr,
            ..Default::default()
        });
        connect_with_retry(&client).await;

        client.start_stream("w-1", "task-1").await.expect("stream");
        for i in 0..3 {
            client
                .forward(entry("w-1", &format!("line {i}")))
                .await
                .expect("forward");
        }

        let arrived = async {
            loop {
                if entries.lock().await.len() == 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), arrived)
            .await
            .expect("entries arrived");

        client.close_stream("w-1").await.expect("close");
        let err = client.forward(entry("w-1", "late")).await;
        assert!(err.is_err(), "forward after close must fail");
    }

    #[tokio::test]
    async fn forward_without_stream_is_an_error() {
        let client = GrpcHandlerClient::new(EgressConfig::default());
        let err = client.forward(entry("w-none", "hello")).await;
        assert!(matches!(err, Err(Error::Handler(_))));
    }

    #[tokio::test]
    async fn mock_records_entries_and_simulated_failures() {
        let mock = MockHandlerClient::new().with_latency(Duration::from_millis(1));
        mock.connect().await.expect("connect");
        mock.start_stream("w-1", "t-1").await.expect("stream");

        mock.fail_next(1);
        let err = mock.forward(entry("w-1", "first")).await;
        assert!(err.is_err());

        mock.forward(entry("w-1", "second")).await.expect("forward");
        assert_eq!(mock.entry_count().await, 1);
        assert_eq!(mock.entries().await[0].message, "second");
    }
}

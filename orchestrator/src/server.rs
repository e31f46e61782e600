use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tonic::transport::Server;

use crate::api::{OrchestratorApi, WorkerLogApi};
use crate::config::Config;
use crate::egress::{EgressConfig, GrpcHandlerClient, HandlerSink, MockHandlerClient};
use crate::fabric::{FabricConfig, LogFabric};
use crate::gateway::KubeGateway;
use crate::proto::otto::orchestrator_service_server::OrchestratorServiceServer;
use crate::proto::otto::worker_log_service_server::WorkerLogServiceServer;
use crate::scheduler::PipelineScheduler;
use crate::worker::WorkerManager;

pub async fn run_server(config: Config) -> Result<()> {
    let gateway = Arc::new(KubeGateway::connect(&config.kubernetes.namespace).await?);
    let manager = WorkerManager::new(gateway);

    let sink: Arc<dyn HandlerSink> = if config.grpc.mock_mode {
        tracing::warn!("egress mock mode enabled, log entries will not reach the handler");
        Arc::new(MockHandlerClient::new())
    } else {
        if config.grpc.otto_handler_host.is_empty() {
            anyhow::bail!("grpc.otto_handler_host is required unless grpc.mock_mode is set");
        }
        Arc::new(GrpcHandlerClient::new(EgressConfig {
            host: config.grpc.otto_handler_host.clone(),
            ..Default::default()
        }))
    };
    sink.connect().await?;

    let cancel = otto_common::shutdown::shutdown_token();

    let fabric = LogFabric::new(
        FabricConfig {
            namespace: config.kubernetes.namespace.clone(),
            ..Default::default()
        },
        sink.clone(),
    );
    fabric.spawn_sweeper(cancel.clone()).await;

    let scheduler = PipelineScheduler::new(manager.clone(), config.worker.clone());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.grpc.port).parse()?;
    tracing::info!(%addr, namespace = %config.kubernetes.namespace, "starting orchestrator server");

    let api = OrchestratorApi::new(
        scheduler.clone(),
        manager,
        config.worker.clone(),
        cancel.clone(),
    );
    let logs = WorkerLogApi::new(fabric);

    otto_common::signal_ready();

    let serve_cancel = cancel.clone();
    Server::builder()
        .add_service(OrchestratorServiceServer::new(api))
        .add_service(WorkerLogServiceServer::new(logs))
        .serve_with_shutdown(addr, async move {
            serve_cancel.cancelled().await;
        })
        .await?;

    // Collapse every in-flight pipeline; workers clean themselves up on
    // their own bounded contexts.
    scheduler.cancel_all().await;
    if let Err(e) = sink.disconnect().await {
        tracing::warn!(?e, "handler disconnect failed during shutdown");
    }
    tracing::info!("server stopped gracefully");
    Ok(())
}

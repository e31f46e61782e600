use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use tonic::transport::Channel;

use otto_common::shutdown::shutdown_signal;

use crate::args::HealthArgs;
use crate::proto::otto::{
    WorkerStatusRequest, orchestrator_service_client::OrchestratorServiceClient,
};

#[derive(Clone)]
struct HealthState {
    grpc_target: Arc<String>,
}

/// Run the health check HTTP server that proxies probes to the gRPC
/// surface. A successful worker-status call means the server is up and
/// can reach the cluster API.
pub async fn run_health(args: HealthArgs) -> Result<()> {
    let http_addr: SocketAddr = format!("0.0.0.0:{}", args.http_port).parse()?;
    let state = HealthState {
        grpc_target: Arc::new(args.grpc_target.clone()),
    };

    tracing::info!(%http_addr, grpc_target = %args.grpc_target, "starting health check HTTP server");

    let app = Router::new()
        .route("/", get(http_health_handler))
        .route("/healthz", get(http_health_handler))
        .route("/readyz", get(http_health_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("health check server stopped gracefully");
    Ok(())
}

async fn http_health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match grpc_health_check(&state.grpc_target).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn grpc_health_check(grpc_target: &str) -> Result<()> {
    let channel = Channel::from_shared(grpc_target.to_string())?
        .connect()
        .await?;
    let mut client = OrchestratorServiceClient::new(channel);
    client
        .get_worker_status(WorkerStatusRequest {
            task_id: String::new(),
        })
        .await?;
    Ok(())
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    Server(ServerArgs),
    Health(HealthArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Path to the YAML configuration file. Environment variables with the
    /// OTTO prefix override individual keys.
    #[arg(long, env = "OTTO_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct HealthArgs {
    /// HTTP port to listen on for health checks
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// gRPC target address of the orchestrator to health check
    #[arg(long, env = "GRPC_TARGET", default_value = "http://127.0.0.1:9090")]
    pub grpc_target: String,
}

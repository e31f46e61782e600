use anyhow::Result;
use clap::Parser;

use otto_orchestrator::args::{Cli, Commands};
use otto_orchestrator::config::{Config, LoggingConfig};
use otto_orchestrator::{health, server};

#[tokio::main]
async fn main() -> Result<()> {
    otto_common::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => {
            let config = Config::load(args.config.as_deref())?;
            init_tracing(&config.logging);
            server::run_server(config).await
        }
        Commands::Health(args) => {
            tracing_subscriber::fmt::init();
            health::run_health(args).await
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let level = match logging.level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    if logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().json().with_max_level(level).init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }
}

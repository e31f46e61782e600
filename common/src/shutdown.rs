use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

/// Resolves when SIGINT (Ctrl+C) or SIGTERM (cluster-initiated stop) lands.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv()  => eprintln!("{}", "received SIGINT, shutting down".red()),
            _ = sigterm.recv() => eprintln!("{}", "received SIGTERM, shutting down".red()),
        }
    }

    #[cfg(not(unix))]
    {
        // Fallback: only Ctrl+C on non-Unix
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    }
}

/// Token that trips once a shutdown signal arrives. The returned token is
/// the root of the process-wide cancellation domain.
pub fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });
    cancel
}

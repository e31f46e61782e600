use anyhow::{Result, bail};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep that aborts early when the token fires. Every retry delay and
/// poll tick in the engine goes through this so no wait outlives its
/// cancellation domain.
pub async fn sleep_with_cancel(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => bail!("wait interrupted by cancellation"),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_when_not_cancelled() {
        let cancel = CancellationToken::new();
        sleep_with_cancel(&cancel, Duration::from_millis(5))
            .await
            .expect("sleep");
    }

    #[tokio::test]
    async fn aborts_on_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sleep_with_cancel(&cancel, Duration::from_secs(60)).await;
        assert!(err.is_err());
    }
}

use std::time::Duration;

/// Engine-wide error taxonomy. The RPC surface is the only layer that maps
/// these onto transport status codes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("failed to configure cluster client: {0}")]
    ClusterConfig(String),

    #[error("{op} '{pod}': {source}")]
    Gateway {
        op: &'static str,
        pod: String,
        #[source]
        source: kube::Error,
    },

    #[error("handler transport error: {0}")]
    Handler(String),

    #[error("worker '{worker}' failed: {reason}")]
    WorkerFailed { worker: String, reason: String },

    #[error("workers failed: {}", failed.join(", "))]
    BatchFailed { failed: Vec<String> },

    #[error("timed out after {timeout:?} while {op}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("operation canceled")]
    Canceled,

    #[error("pipeline '{0}' is already executing")]
    AlreadyExists(String),

    #[error("{0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, Error>;

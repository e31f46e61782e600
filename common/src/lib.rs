pub mod names;
pub mod shutdown;
pub mod wait;

/// Labels stamped onto every pod this system creates. The `managed-by`
/// label is the ownership marker all list/cleanup operations key on.
pub mod labels {
    pub const MANAGED_BY: &str = "managed-by";
    pub const MANAGED_BY_VALUE: &str = "otto-orchestrator";
    pub const APP: &str = "app";
    pub const WORKER_APP: &str = "otto-worker";
    pub const PIPELINE_ID: &str = "pipeline-id";
    pub const STAGE_ID: &str = "stage-id";
    pub const STAGE_TYPE: &str = "stage-type";
    pub const TASK_ID: &str = "task-id";
    pub const REPOSITORY: &str = "repository";
    pub const COMMIT: &str = "commit";
    pub const WORKER_INDEX: &str = "worker-index";
}

pub mod annotations {
    pub const CREATED_AT: &str = "otto.dev/created-at";
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

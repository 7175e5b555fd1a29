use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid job descriptor: {0}")]
    InvalidJob(String),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(u64),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Crontab error: {0}")]
    Crontab(String),

    #[error("Cron scheduler error: {0}")]
    Scheduler(String),

    #[error("Remote launch failed: {0}")]
    Launch(String),

    #[error("Job store error: {0}")]
    Store(String),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

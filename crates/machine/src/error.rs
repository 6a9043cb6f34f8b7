#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("machine start failed: {0}")]
    StartFailed(String),

    #[error("machine stop failed: {0}")]
    StopFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MachineError>;

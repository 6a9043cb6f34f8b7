use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("another controller holds {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("machine backend error: {0}")]
    Machine(#[from] machine::MachineError),

    #[error("image error: {0}")]
    Image(#[from] provision::ImageError),

    #[error("network error: {0}")]
    Network(#[from] provision::NetworkError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

use crate::command::CommandError;

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("address pool {prefix} exhausted")]
    PoolExhausted { prefix: String },

    #[error("device error: {0}")]
    Device(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid prefix {0:?}")]
    InvalidPrefix(String),

    #[error("invalid network config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

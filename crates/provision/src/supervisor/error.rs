use std::path::PathBuf;
use std::time::Duration;

use machine::MachineError;

use super::state::VmState;
use crate::image::ImageError;
use crate::network::NetworkError;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("vm {id} not found")]
    NotFound { id: String },

    #[error("vm {id} is {state}")]
    InvalidState { id: String, state: VmState },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("failed to start vm: {0}")]
    Start(#[source] MachineError),

    #[error("failed to shut down vm: {0}")]
    Shutdown(#[source] MachineError),

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("{operation} timed out after {timeout:?}")]
    TimedOut {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, VmError>;

impl VmError {
    /// Message safe to hand to API callers: names no host paths and carries
    /// no command output. The full error goes to the log.
    pub fn client_message(&self) -> String {
        match self {
            Self::NotFound { .. }
            | Self::InvalidState { .. }
            | Self::TimedOut { .. }
            | Self::Cancelled => self.to_string(),
            Self::Image(ImageError::InvalidReference(reference)) => {
                format!("invalid image reference: {reference:?}")
            }
            Self::Image(ImageError::Pull { reference, .. }) => {
                format!("failed to pull image {reference}")
            }
            Self::Image(_) => "failed to prepare vm disks".to_string(),
            Self::Io { .. } => "failed to prepare vm runtime files".to_string(),
            Self::Network(_) => "failed to set up vm networking".to_string(),
            Self::Start(_) => "vm failed to start".to_string(),
            Self::Shutdown(_) => "vm failed to shut down".to_string(),
            Self::Task(_) => "internal task failure".to_string(),
        }
    }

    /// Whether the caller sent something unusable.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::Image(ImageError::InvalidReference(_)))
    }
}

mod backend;
mod config;
mod error;
mod machine;
mod types;

pub use backend::MachineBackend;
pub use config::{MachineConfig, MachineResources};
pub use error::{MachineError, Result};
pub use machine::Machine;
pub use types::{Drive, NetworkInterface};

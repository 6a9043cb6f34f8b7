use async_trait::async_trait;

use crate::config::MachineConfig;
use crate::error::Result;
use crate::machine::Machine;

#[async_trait]
pub trait MachineBackend: Send + Sync {
    /// Human-readable name for this backend (e.g. "firecracker").
    fn name(&self) -> &str;
    /// Boot a machine from `config`.
    ///
    /// Returns once the backend considers the machine started. Dropping the
    /// returned future before it resolves must not leave a machine process
    /// behind.
    async fn start(&self, config: MachineConfig) -> Result<Box<dyn Machine>>;
}

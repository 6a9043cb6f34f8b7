use async_trait::async_trait;

use crate::error::Result;

/// Handle to a started machine, owned by whoever started it.
#[async_trait]
pub trait Machine: Send + Sync {
    fn id(&self) -> &str;
    /// OS process id of the machine monitor, when there is one.
    fn pid(&self) -> Option<u32>;
    /// Shut the machine down and release backend-side resources.
    ///
    /// Stopping an already exited machine succeeds.
    async fn stop(&mut self) -> Result<()>;
}

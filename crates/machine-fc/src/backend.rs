use std::path::PathBuf;

use async_trait::async_trait;
use machine::{Machine, MachineBackend, MachineConfig, MachineError};
use tracing::info;

use crate::config::FirecrackerConfig;
use crate::machine::FirecrackerMachine;
use crate::prerequisites::{check_prerequisites, resolve_binary};

pub struct FirecrackerBackend {
    config: FirecrackerConfig,
    binary: PathBuf,
}

impl FirecrackerBackend {
    /// Create a backend after checking host prerequisites.
    pub fn new(config: FirecrackerConfig) -> Result<Self, MachineError> {
        check_prerequisites(&config)?;
        let binary = resolve_binary(&config.binary_path).ok_or_else(|| {
            MachineError::BackendNotAvailable(format!(
                "firecracker binary not found: {}",
                config.binary_path.display()
            ))
        })?;
        info!(binary = %binary.display(), "firecracker backend ready");
        Ok(Self { config, binary })
    }

    #[cfg(test)]
    pub(crate) fn unchecked(config: FirecrackerConfig) -> Self {
        let binary = config.binary_path.clone();
        Self { config, binary }
    }
}

#[async_trait]
impl MachineBackend for FirecrackerBackend {
    fn name(&self) -> &str {
        "firecracker"
    }

    async fn start(&self, config: MachineConfig) -> machine::Result<Box<dyn Machine>> {
        config.validate()?;
        if !tokio::fs::try_exists(&config.kernel_image)
            .await
            .unwrap_or(false)
        {
            return Err(MachineError::InvalidConfig(format!(
                "kernel not found: {}",
                config.kernel_image.display()
            )));
        }
        let machine = FirecrackerMachine::start(&self.binary, &self.config, config).await?;
        Ok(Box::new(machine))
    }
}

use std::path::PathBuf;

use serde::Serialize;

use crate::types::{Drive, NetworkInterface};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MachineResources {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    /// Simultaneous multithreading inside the guest.
    pub smt: bool,
}

/// Everything a backend needs to boot one VM.
#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub id: String,
    /// Control socket the backend exposes for this VM.
    pub socket_path: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub kernel_image: PathBuf,
    pub boot_args: String,
    pub drives: Vec<Drive>,
    pub resources: MachineResources,
    pub network_interfaces: Vec<NetworkInterface>,
}

impl MachineConfig {
    /// The drive flagged as root device, if any.
    pub fn root_drive(&self) -> Option<&Drive> {
        self.drives.iter().find(|d| d.is_root_device)
    }

    /// Reject configurations no backend can boot.
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.is_empty() {
            return Err(crate::MachineError::InvalidConfig("empty id".into()));
        }
        let roots = self.drives.iter().filter(|d| d.is_root_device).count();
        if roots != 1 {
            return Err(crate::MachineError::InvalidConfig(format!(
                "expected exactly one root drive, found {roots}"
            )));
        }
        if self.resources.vcpu_count == 0 || self.resources.mem_size_mib == 0 {
            return Err(crate::MachineError::InvalidConfig(
                "vcpu_count and mem_size_mib must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

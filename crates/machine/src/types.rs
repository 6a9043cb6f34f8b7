use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

impl Drive {
    pub fn read_only_root(id: &str, path: PathBuf) -> Self {
        Self {
            drive_id: id.to_string(),
            path_on_host: path,
            is_root_device: true,
            is_read_only: true,
        }
    }

    pub fn read_only(id: &str, path: PathBuf) -> Self {
        Self {
            drive_id: id.to_string(),
            path_on_host: path,
            is_root_device: false,
            is_read_only: true,
        }
    }
}

/// Guest NIC backed by a host TAP device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use machine::{Machine, MachineConfig, MachineError};
use nix::sys::signal::Signal;
use tracing::{info, warn};

use crate::config::FirecrackerConfig;
use crate::process::signal_process_group;

/// Interval between API socket existence checks during startup.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Config file written next to the API socket: `<socket_dir>/<id>.json`.
pub fn config_file_path(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("json")
}

/// Build the Firecracker `--config-file` JSON for `config`.
pub fn build_config(config: &MachineConfig) -> serde_json::Value {
    let drives: Vec<serde_json::Value> = config
        .drives
        .iter()
        .map(|d| {
            serde_json::json!({
                "drive_id": d.drive_id,
                "path_on_host": d.path_on_host.display().to_string(),
                "is_root_device": d.is_root_device,
                "is_read_only": d.is_read_only,
            })
        })
        .collect();

    let interfaces: Vec<serde_json::Value> = config
        .network_interfaces
        .iter()
        .map(|n| {
            serde_json::json!({
                "iface_id": n.iface_id,
                "guest_mac": n.guest_mac,
                "host_dev_name": n.host_dev_name,
            })
        })
        .collect();

    serde_json::json!({
        "boot-source": {
            "kernel_image_path": config.kernel_image.display().to_string(),
            "boot_args": config.boot_args,
        },
        "drives": drives,
        "machine-config": {
            "vcpu_count": config.resources.vcpu_count,
            "mem_size_mib": config.resources.mem_size_mib,
            "smt": config.resources.smt,
        },
        "network-interfaces": interfaces,
    })
}

pub struct FirecrackerMachine {
    id: String,
    socket_path: PathBuf,
    config_path: PathBuf,
    shutdown_timeout: Duration,
    process: Option<tokio::process::Child>,
}

impl FirecrackerMachine {
    /// Spawn firecracker for `config` and wait until its API socket is up.
    ///
    /// The child is killed if this future is dropped before it resolves.
    pub(crate) async fn start(
        binary: &Path,
        fc_config: &FirecrackerConfig,
        config: MachineConfig,
    ) -> machine::Result<Self> {
        let config_path = config_file_path(&config.socket_path);
        let json = serde_json::to_string_pretty(&build_config(&config))
            .map_err(|e| MachineError::StartFailed(format!("serialize config: {e}")))?;

        if let Some(parent) = config.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Firecracker refuses to bind over an existing socket.
        remove_if_exists(&config.socket_path).await;
        tokio::fs::write(&config_path, json.as_bytes())
            .await
            .map_err(|e| MachineError::StartFailed(format!("write config: {e}")))?;

        let stdout = open_log(&config.stdout_log)?;
        let stderr = open_log(&config.stderr_log)?;

        let child = tokio::process::Command::new(binary)
            .arg("--api-sock")
            .arg(&config.socket_path)
            .arg("--config-file")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MachineError::StartFailed(format!("spawn firecracker: {e}")))?;

        let mut machine = Self {
            id: config.id,
            socket_path: config.socket_path,
            config_path,
            shutdown_timeout: fc_config.shutdown_timeout,
            process: Some(child),
        };

        if let Err(e) = machine.wait_api_ready(fc_config.api_ready_timeout).await {
            machine.kill().await;
            return Err(e);
        }

        info!(id = %machine.id, pid = ?machine.pid(), "firecracker started");
        Ok(machine)
    }

    async fn wait_api_ready(&mut self, timeout: Duration) -> machine::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(child) = self.process.as_mut()
                && let Some(status) = child.try_wait()?
            {
                return Err(MachineError::StartFailed(format!(
                    "firecracker exited during startup: {status}"
                )));
            }
            if tokio::fs::try_exists(&self.socket_path).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MachineError::StartFailed(format!(
                    "API socket {} not ready after {timeout:?}",
                    self.socket_path.display()
                )));
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    /// SIGKILL the process group, reap, and remove runtime files.
    async fn kill(&mut self) {
        if let Some(mut child) = self.process.take() {
            signal_process_group(&child, Signal::SIGKILL);
            let _ = child.wait().await;
        }
        self.remove_runtime_files().await;
    }

    async fn remove_runtime_files(&self) {
        remove_if_exists(&self.socket_path).await;
        remove_if_exists(&self.config_path).await;
    }
}

#[async_trait]
impl Machine for FirecrackerMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|c| c.id())
    }

    async fn stop(&mut self) -> machine::Result<()> {
        let Some(child) = self.process.as_mut() else {
            return Ok(());
        };

        if child.try_wait()?.is_none() {
            signal_process_group(child, Signal::SIGTERM);
            match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return Err(MachineError::StopFailed(format!("wait firecracker: {e}")));
                }
                Err(_) => {
                    warn!(id = %self.id, "graceful shutdown timed out, killing");
                    signal_process_group(child, Signal::SIGKILL);
                    child
                        .wait()
                        .await
                        .map_err(|e| MachineError::StopFailed(format!("reap firecracker: {e}")))?;
                }
            }
        }

        self.process = None;
        self.remove_runtime_files().await;
        info!(id = %self.id, "firecracker stopped");
        Ok(())
    }
}

fn open_log(path: &Path) -> machine::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| MachineError::StartFailed(format!("open log {}: {e}", path.display())))
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

#[cfg(test)]
mod tests {
    use machine::{Drive, MachineResources, NetworkInterface};

    use super::*;

    fn config() -> MachineConfig {
        MachineConfig {
            id: "abc".into(),
            socket_path: "/tmp/firecracker/abc.sock".into(),
            stdout_log: "logs/abc-out.log".into(),
            stderr_log: "logs/abc-err.log".into(),
            kernel_image: "/images/vmlinux.bin".into(),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".into(),
            drives: vec![
                Drive::read_only_root("rootfs", "/cache/rootfs".into()),
                Drive::read_only("ssh", "/cache/ssh_keys/k.img".into()),
            ],
            resources: MachineResources {
                vcpu_count: 2,
                mem_size_mib: 1024,
                smt: false,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".into(),
                host_dev_name: "fctap0".into(),
                guest_mac: "06:00:ac:10:00:02".into(),
            }],
        }
    }

    #[test]
    fn config_file_sits_next_to_socket() {
        assert_eq!(
            config_file_path(Path::new("/tmp/firecracker/abc.sock")),
            PathBuf::from("/tmp/firecracker/abc.json")
        );
    }

    #[test]
    fn build_config_shape() {
        let json = build_config(&config());

        assert_eq!(json["boot-source"]["kernel_image_path"], "/images/vmlinux.bin");
        assert_eq!(
            json["boot-source"]["boot_args"],
            "console=ttyS0 reboot=k panic=1 pci=off"
        );

        let drives = json["drives"].as_array().unwrap();
        assert_eq!(drives.len(), 2);
        assert_eq!(drives[0]["drive_id"], "rootfs");
        assert_eq!(drives[0]["is_root_device"], true);
        assert_eq!(drives[0]["is_read_only"], true);
        assert_eq!(drives[1]["drive_id"], "ssh");
        assert_eq!(drives[1]["is_root_device"], false);
        assert_eq!(drives[1]["is_read_only"], true);
        assert_eq!(drives[1]["path_on_host"], "/cache/ssh_keys/k.img");

        assert_eq!(json["machine-config"]["vcpu_count"], 2);
        assert_eq!(json["machine-config"]["mem_size_mib"], 1024);
        assert_eq!(json["machine-config"]["smt"], false);

        let nics = json["network-interfaces"].as_array().unwrap();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0]["iface_id"], "eth0");
        assert_eq!(nics[0]["host_dev_name"], "fctap0");
        assert_eq!(nics[0]["guest_mac"], "06:00:ac:10:00:02");
    }

    #[test]
    fn build_config_without_network() {
        let mut cfg = config();
        cfg.network_interfaces.clear();
        let json = build_config(&cfg);
        assert_eq!(json["network-interfaces"].as_array().unwrap().len(), 0);
    }
}

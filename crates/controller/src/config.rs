use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use machine_fc::FirecrackerConfig;
use provision::{
    CachePaths, Ipv4Prefix, LogPaths, MachineSettings, NetworkConfig, OverlayComposer,
    RuntimePaths, SupervisorConfig,
};
use serde::Deserialize;

use crate::error::{ControllerError, ControllerResult};

pub(crate) const DEFAULT_VCPU: u32 = 2;
pub(crate) const DEFAULT_MEMORY_MB: u32 = 1024;
const LOCK_FILE: &str = "controller.lock";

#[derive(Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Holds `blobs/`, `ssh_keys/`, `scratch/` and the controller lock.
    pub cache_dir: PathBuf,
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    pub rootfs: RootfsSection,
    pub firecracker: FirecrackerSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub machine: MachineSection,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootfsSection {
    /// ext4 image the canonical rootfs is built from.
    pub base_image: PathBuf,
    pub init_script: PathBuf,
    /// Where the canonical squashfs rootfs is published.
    pub output: PathBuf,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirecrackerSection {
    pub binary: PathBuf,
    pub kernel: PathBuf,
    #[serde(default = "default_api_ready_timeout")]
    pub api_ready_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSection {
    pub bridge: String,
    pub prefix: Ipv4Prefix,
    pub tap_prefix: String,
    pub tap_multi_queue: bool,
    pub nameservers: Vec<Ipv4Addr>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        let network = NetworkConfig::default();
        Self {
            bridge: network.bridge,
            prefix: network.prefix,
            tap_prefix: network.tap_prefix,
            tap_multi_queue: network.tap_multi_queue,
            nameservers: vec![Ipv4Addr::new(8, 8, 8, 8)],
        }
    }
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineSection {
    pub vcpu: u32,
    pub memory_mb: u32,
    pub smt: bool,
}

impl Default for MachineSection {
    fn default() -> Self {
        Self {
            vcpu: DEFAULT_VCPU,
            memory_mb: DEFAULT_MEMORY_MB,
            smt: false,
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from(provision::paths::DEFAULT_SOCKET_DIR)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_start_timeout() -> u64 {
    30
}

fn default_stop_timeout() -> u64 {
    15
}

fn default_api_ready_timeout() -> u64 {
    5
}

fn default_shutdown_timeout() -> u64 {
    5
}

/// Load and validate a controller config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> ControllerResult<ControllerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ControllerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: ControllerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| ControllerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    validate_paths(&config).await?;
    Ok(config)
}

async fn check_path_exists(path: &Path, label: &str) -> ControllerResult<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| ControllerError::Config(format!("check {label}: {e}")))?;
    if !exists {
        return Err(ControllerError::Config(format!(
            "{label} not found: {}",
            path.display()
        )));
    }
    Ok(())
}

async fn validate_paths(config: &ControllerConfig) -> ControllerResult<()> {
    check_path_exists(&config.rootfs.base_image, "rootfs base image").await?;
    check_path_exists(&config.rootfs.init_script, "init script").await?;
    check_path_exists(&config.firecracker.kernel, "kernel").await?;
    // Bare names are looked up on PATH by the backend.
    if is_path_like(&config.firecracker.binary) {
        check_path_exists(&config.firecracker.binary, "firecracker binary").await?;
    }
    Ok(())
}

fn is_path_like(path: &Path) -> bool {
    path.components().count() > 1 || path.is_absolute()
}

impl ControllerConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.cache_dir);
        resolve(&mut self.socket_dir);
        resolve(&mut self.log_dir);
        resolve(&mut self.rootfs.base_image);
        resolve(&mut self.rootfs.init_script);
        resolve(&mut self.rootfs.output);
        resolve(&mut self.firecracker.kernel);
        if is_path_like(&self.firecracker.binary) {
            resolve(&mut self.firecracker.binary);
        }
    }

    fn validate(&self) -> ControllerResult<()> {
        if self.machine.vcpu == 0 || self.machine.memory_mb == 0 {
            return Err(ControllerError::Config(
                "machine.vcpu and machine.memory_mb must be non-zero".into(),
            ));
        }
        if self.start_timeout_secs == 0 || self.stop_timeout_secs == 0 {
            return Err(ControllerError::Config(
                "start_timeout_secs and stop_timeout_secs must be non-zero".into(),
            ));
        }
        if self.network.nameservers.is_empty() {
            return Err(ControllerError::Config(
                "network.nameservers must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.cache_dir.join(LOCK_FILE)
    }

    pub fn cache_paths(&self) -> CachePaths {
        CachePaths::new(self.cache_dir.clone())
    }

    pub fn runtime_paths(&self) -> RuntimePaths {
        RuntimePaths::new(self.socket_dir.clone())
    }

    pub fn log_paths(&self) -> LogPaths {
        LogPaths::new(self.log_dir.clone())
    }

    pub fn overlay_composer(&self) -> OverlayComposer {
        OverlayComposer::new(self.network.nameservers.clone())
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            bridge: self.network.bridge.clone(),
            prefix: self.network.prefix,
            tap_prefix: self.network.tap_prefix.clone(),
            tap_multi_queue: self.network.tap_multi_queue,
        }
    }

    pub fn firecracker_config(&self) -> FirecrackerConfig {
        FirecrackerConfig {
            binary_path: self.firecracker.binary.clone(),
            api_ready_timeout: Duration::from_secs(self.firecracker.api_ready_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.firecracker.shutdown_timeout_secs),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            kernel_image: self.firecracker.kernel.clone(),
            rootfs: self.rootfs.output.clone(),
            init_script: self.rootfs.init_script.clone(),
            runtime: self.runtime_paths(),
            logs: self.log_paths(),
            machine: MachineSettings {
                vcpu_count: self.machine.vcpu,
                mem_size_mib: self.machine.memory_mb,
                smt: self.machine.smt,
            },
            start_timeout: Duration::from_secs(self.start_timeout_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
        }
    }
}

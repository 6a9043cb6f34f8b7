//! VM lifecycle: provisioning, boot, teardown and the registry of live VMs.
//!
//! `create_vm` acquires everything a VM needs (SSH key disk, rootfs, TAP,
//! address), boots it through a [`MachineBackend`] and records it. Whatever
//! was acquired is released again if any step fails; the entry itself stays
//! behind as `Failed` so callers can see what happened.

mod error;
mod registry;
mod state;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use machine::{
    Drive, Machine, MachineBackend, MachineConfig, MachineResources, NetworkInterface,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use error::{Result, VmError};
pub use registry::VmInstance;
pub use state::VmState;

use crate::image::ImageBuilder;
use crate::network::{GUEST_IFACE, Lease, NetworkManager, TapDevice, guest_boot_args, guest_mac};
use crate::paths::{LogPaths, RuntimePaths};
use crate::sshkey::SshKeyImageBuilder;
use registry::{VmRecord, VmRegistry};

/// Kernel command line shared by every VM; the `ip=` argument follows it.
pub const BASE_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off overlay_root=ram \
                                  ssh_disk=/dev/vdb init=/sbin/overlay-init";

const ROOT_DRIVE_ID: &str = "rootfs";
const SSH_DRIVE_ID: &str = "ssh";

/// Guest sizing applied to every VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineSettings {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub smt: bool,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            vcpu_count: 2,
            mem_size_mib: 1024,
            smt: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub kernel_image: PathBuf,
    /// Canonical rootfs, used when a request names no image.
    pub rootfs: PathBuf,
    /// Overlay init installed into container image builds.
    pub init_script: PathBuf,
    pub runtime: RuntimePaths,
    pub logs: LogPaths,
    pub machine: MachineSettings,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CreateVmRequest {
    pub ssh_public_key: String,
    /// Container image to boot instead of the canonical rootfs.
    pub image: Option<String>,
}

/// Devices acquired for a VM, kept so a failure can give them back.
#[derive(Default)]
struct Acquired {
    tap: Option<TapDevice>,
    lease: Option<Lease>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    backend: Arc<dyn MachineBackend>,
    images: ImageBuilder,
    ssh_keys: SshKeyImageBuilder,
    network: Arc<NetworkManager>,
    registry: VmRegistry,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        backend: Arc<dyn MachineBackend>,
        images: ImageBuilder,
        ssh_keys: SshKeyImageBuilder,
        network: Arc<NetworkManager>,
    ) -> Self {
        Self {
            config,
            backend,
            images,
            ssh_keys,
            network,
            registry: VmRegistry::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<VmInstance> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<VmInstance> {
        self.registry.list()
    }

    /// Provision and boot a VM.
    ///
    /// On failure the entry is kept as `Failed` with the error message and
    /// every device acquired for it is released.
    pub async fn create_vm(&self, request: CreateVmRequest) -> Result<VmInstance> {
        if self.cancel.is_cancelled() {
            return Err(VmError::Cancelled);
        }
        let id = self.registry.reserve(request.image.clone());
        info!(id = %id, image = ?request.image, "creating vm");

        let mut acquired = Acquired::default();
        match self.provision(&id, &request, &mut acquired).await {
            Ok(instance) => {
                info!(
                    id = %id,
                    ip = ?instance.ip_address,
                    pid = ?instance.pid,
                    "vm running"
                );
                Ok(instance)
            }
            Err(e) => {
                error!(id = %id, error = %e, "vm creation failed");
                self.fail(&id, &e, acquired).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        id: &str,
        request: &CreateVmRequest,
        acquired: &mut Acquired,
    ) -> Result<VmInstance> {
        let stdout_log = self.config.logs.stdout(id);
        let stderr_log = self.config.logs.stderr(id);
        create_log_files(&[&stdout_log, &stderr_log]).await?;

        let ssh_disk = {
            let builder = self.ssh_keys.clone();
            let key = request.ssh_public_key.clone().into_bytes();
            tokio::task::spawn_blocking(move || builder.build(&key))
                .await
                .map_err(|e| VmError::Task(e.to_string()))??
        };

        let rootfs = match &request.image {
            Some(reference) => {
                self.images
                    .build_from_container_image(reference, &self.config.init_script)
                    .await?
            }
            None => self.config.rootfs.clone(),
        };

        let tap = self.network.create_tap().await?;
        acquired.tap = Some(tap.clone());
        let lease = self.network.allocate_address()?;
        acquired.lease = Some(lease);
        let gateway = self.network.bridge_gateway_address().await?;

        let config = MachineConfig {
            id: id.to_string(),
            socket_path: self.config.runtime.socket(id),
            stdout_log,
            stderr_log,
            kernel_image: self.config.kernel_image.clone(),
            boot_args: format!(
                "{BASE_BOOT_ARGS} {}",
                guest_boot_args(&lease, gateway, id)
            ),
            drives: vec![
                Drive::read_only_root(ROOT_DRIVE_ID, rootfs),
                Drive::read_only(SSH_DRIVE_ID, ssh_disk),
            ],
            resources: MachineResources {
                vcpu_count: self.config.machine.vcpu_count,
                mem_size_mib: self.config.machine.mem_size_mib,
                smt: self.config.machine.smt,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: GUEST_IFACE.to_string(),
                host_dev_name: tap.name.clone(),
                guest_mac: guest_mac(lease.address),
            }],
        };

        self.registry.update(id, |r| {
            r.tap = acquired.tap.take();
            r.lease = acquired.lease.take();
            r.transition(VmState::Starting)
        })??;

        let timeout = self.config.start_timeout;
        let machine = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(VmError::Cancelled),
            res = tokio::time::timeout(timeout, self.backend.start(config)) => match res {
                Ok(started) => started.map_err(VmError::Start),
                Err(_) => Err(VmError::TimedOut { operation: "start", timeout }),
            },
        }?;

        let stored = self.registry.update(id, move |r| {
            r.machine = Some(machine);
            r.transition(VmState::Running).map(|()| r.snapshot())
        });
        match stored {
            Ok(result) => result,
            // Shutdown drained the registry while the machine was booting.
            Err(_) => Err(VmError::Cancelled),
        }
    }

    /// Mark `id` failed and give back everything acquired for it.
    async fn fail(&self, id: &str, cause: &VmError, mut acquired: Acquired) {
        let owned = self.registry.update(id, |r| {
            r.error = Some(cause.client_message());
            if let Err(e) = r.transition(VmState::Failed) {
                warn!(id = %id, error = %e, "unexpected state on failure");
                r.state = VmState::Failed;
            }
            (r.tap.take(), r.lease.take(), r.machine.take())
        });
        let machine = match owned {
            Ok((tap, lease, machine)) => {
                acquired.tap = acquired.tap.or(tap);
                acquired.lease = acquired.lease.or(lease);
                machine
            }
            Err(_) => None,
        };
        if let Some(mut machine) = machine
            && let Err(e) = machine.stop().await
        {
            warn!(id = %id, error = %e, "failed to stop machine after failure");
        }
        self.release(id, acquired.tap, acquired.lease).await;
    }

    async fn release(&self, id: &str, tap: Option<TapDevice>, lease: Option<Lease>) {
        if let Some(tap) = tap {
            self.network.delete_tap(&tap).await;
        }
        if let Some(lease) = lease {
            self.network.release_address(lease.address);
        }
        info!(id = %id, "vm resources released");
    }

    /// Stop VM `id` and forget it.
    ///
    /// A failed stop leaves the entry `Failed` with its machine handle, so
    /// the delete can be retried.
    pub async fn delete_vm(&self, id: &str) -> Result<()> {
        let machine = self.registry.update(id, |r| -> Result<Option<Box<dyn Machine>>> {
            if r.state.is_busy() {
                return Err(VmError::InvalidState {
                    id: r.id.clone(),
                    state: r.state,
                });
            }
            if r.machine.is_none() {
                return Ok(None);
            }
            r.transition(VmState::Stopping)?;
            Ok(r.machine.take())
        })??;

        let Some(mut machine) = machine else {
            if let Some(record) = self.registry.remove(id) {
                self.release(id, record.tap, record.lease).await;
            }
            info!(id = %id, "vm purged");
            return Ok(());
        };

        info!(id = %id, "stopping vm");
        let timeout = self.config.stop_timeout;
        let stopped = match tokio::time::timeout(timeout, machine.stop()).await {
            Ok(result) => result.map_err(VmError::Shutdown),
            Err(_) => Err(VmError::TimedOut {
                operation: "stop",
                timeout,
            }),
        };

        if let Err(e) = stopped {
            error!(id = %id, error = %e, "vm shutdown failed");
            let message = e.client_message();
            let mut handle = Some(machine);
            let kept = self.registry.update(id, |r| {
                r.machine = handle.take();
                r.error = Some(message);
                r.state = VmState::Failed;
            });
            // Shutdown drained the entry while we were stopping; nothing
            // else will ever own this machine.
            if kept.is_err()
                && let Some(mut machine) = handle
                && let Err(e) = machine.stop().await
            {
                warn!(id = %id, error = %e, "failed to stop orphaned machine");
            }
            return Err(e);
        }

        let record = self.registry.update(id, |r| r.transition(VmState::Stopped));
        if let Ok(Err(e)) = record {
            warn!(id = %id, error = %e, "unexpected state after stop");
        }
        if let Some(record) = self.registry.remove(id) {
            self.release(id, record.tap, record.lease).await;
        }
        info!(id = %id, "vm deleted");
        Ok(())
    }

    /// Cancel in-flight starts, stop every VM and clear the socket directory.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let records = self.registry.drain();
        info!(count = records.len(), "shutting down vms");

        let stop_timeout = self.config.stop_timeout;
        join_all(records.into_iter().map(|record| async move {
            let VmRecord {
                id,
                tap,
                lease,
                machine,
                ..
            } = record;
            if let Some(mut machine) = machine {
                match tokio::time::timeout(stop_timeout, machine.stop()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(id = %id, error = %e, "vm stop failed during shutdown"),
                    Err(_) => warn!(id = %id, "vm stop timed out during shutdown"),
                }
            }
            self.release(&id, tap, lease).await;
        }))
        .await;

        let runtime = self.config.runtime.clone();
        match tokio::task::spawn_blocking(move || runtime.reset()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to clear socket directory"),
            Err(e) => warn!(error = %e, "socket cleanup task failed"),
        }
        info!("supervisor stopped");
    }
}

async fn create_log_files(paths: &[&Path]) -> Result<()> {
    for path in paths {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| VmError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::File::create(path)
            .await
            .map_err(|source| VmError::Io {
                path: path.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageError;
    use crate::overlay::OverlayComposer;
    use crate::paths::CachePaths;
    use crate::network::NetworkConfig;
    use crate::testing::{FakeBackend, FakeHost, FakeSource};
    use std::net::Ipv4Addr;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIExample user@host";

    struct Harness {
        dir: tempfile::TempDir,
        host: Arc<FakeHost>,
        backend: FakeBackend,
        source: Arc<FakeSource>,
        supervisor: Arc<Supervisor>,
    }

    async fn harness_with(source: FakeSource, start_timeout: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new());
        let backend = FakeBackend::new();
        let source = Arc::new(source);
        let cache = CachePaths::new(dir.path().join("cache"));
        cache.create_all().unwrap();

        let init_script = dir.path().join("overlay-init");
        std::fs::write(&init_script, "#!/bin/sh\nexec /sbin/init\n").unwrap();

        let network = NetworkManager::new(host.clone(), NetworkConfig::default())
            .await
            .unwrap();
        let images = ImageBuilder::new(
            host.clone(),
            OverlayComposer::default(),
            cache.clone(),
            source.clone(),
        );
        let ssh_keys = SshKeyImageBuilder::new(host.clone(), cache);
        let config = SupervisorConfig {
            kernel_image: dir.path().join("vmlinux.bin"),
            rootfs: dir.path().join("rootfs.img"),
            init_script,
            runtime: RuntimePaths::new(dir.path().join("sockets")),
            logs: LogPaths::new(dir.path().join("logs")),
            machine: MachineSettings::default(),
            start_timeout,
            stop_timeout: Duration::from_secs(5),
        };
        let supervisor = Arc::new(Supervisor::new(
            config,
            Arc::new(backend.clone()),
            images,
            ssh_keys,
            Arc::new(network),
        ));
        Harness {
            dir,
            host,
            backend,
            source,
            supervisor,
        }
    }

    async fn harness() -> Harness {
        harness_with(FakeSource::new(), Duration::from_secs(5)).await
    }

    fn request() -> CreateVmRequest {
        CreateVmRequest {
            ssh_public_key: KEY.to_string(),
            image: None,
        }
    }

    async fn wait_for_state(supervisor: &Supervisor, state: VmState) -> VmInstance {
        for _ in 0..200 {
            if let Some(vm) = supervisor.list().into_iter().find(|vm| vm.state == state) {
                return vm;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no vm reached {state}");
    }

    #[tokio::test]
    async fn create_boots_vm_with_expected_config() {
        let h = harness().await;
        let vm = h.supervisor.create_vm(request()).await.unwrap();

        assert_eq!(vm.state, VmState::Running);
        assert_eq!(vm.ip_address, Some(Ipv4Addr::new(172, 16, 0, 2)));
        assert_eq!(vm.tap_device.as_deref(), Some("fctap0"));
        assert_eq!(vm.pid, Some(4242));

        let started = h.backend.started();
        assert_eq!(started.len(), 1);
        let config = &started[0];
        assert_eq!(config.id, vm.id);
        assert_eq!(
            config.boot_args,
            format!(
                "console=ttyS0 reboot=k panic=1 pci=off overlay_root=ram ssh_disk=/dev/vdb \
                 init=/sbin/overlay-init ip=172.16.0.2::172.16.0.1:255.255.255.0:{}:eth0:off",
                vm.id
            )
        );
        assert_eq!(config.socket_path, h.dir.path().join(format!("sockets/{}.sock", vm.id)));
        assert_eq!(config.resources.vcpu_count, 2);
        assert_eq!(config.resources.mem_size_mib, 1024);

        let root = config.root_drive().unwrap();
        assert_eq!(root.drive_id, "rootfs");
        assert_eq!(root.path_on_host, h.dir.path().join("rootfs.img"));
        assert!(root.is_read_only);
        let ssh = &config.drives[1];
        assert_eq!(ssh.drive_id, "ssh");
        assert!(ssh.is_read_only && !ssh.is_root_device);
        assert!(ssh.path_on_host.starts_with(h.dir.path().join("cache/ssh_keys")));

        let nic = &config.network_interfaces[0];
        assert_eq!(nic.iface_id, "eth0");
        assert_eq!(nic.host_dev_name, "fctap0");
        assert_eq!(nic.guest_mac, "06:00:ac:10:00:02");

        assert!(config.stdout_log.exists());
        assert!(config.stderr_log.exists());
        assert_eq!(h.supervisor.get(&vm.id), Some(vm));
    }

    #[tokio::test]
    async fn concurrent_creates_get_distinct_ids_and_addresses() {
        let h = harness().await;
        let (a, b) = tokio::join!(
            h.supervisor.create_vm(request()),
            h.supervisor.create_vm(request())
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.id, b.id);
        assert_ne!(a.ip_address, b.ip_address);
        assert_ne!(a.tap_device, b.tap_device);
        assert_eq!(h.supervisor.list().len(), 2);
    }

    #[tokio::test]
    async fn delete_leaves_other_vms_untouched() {
        let h = harness().await;
        let (a, b) = tokio::join!(
            h.supervisor.create_vm(request()),
            h.supervisor.create_vm(request())
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        let a_tap = a.tap_device.clone().unwrap();
        let b_tap = b.tap_device.clone().unwrap();

        h.supervisor.delete_vm(&a.id).await.unwrap();

        assert!(h.supervisor.get(&a.id).is_none());
        assert_eq!(h.supervisor.get(&b.id), Some(b.clone()));
        assert_eq!(h.backend.stops(), 1);
        assert!(h.host.link(&a_tap).is_none());
        assert!(h.host.link(&b_tap).is_some());

        // a's address is free again; b's is still held.
        let c = h.supervisor.create_vm(request()).await.unwrap();
        assert_eq!(c.ip_address, a.ip_address);
        assert_ne!(c.ip_address, b.ip_address);
    }

    #[tokio::test]
    async fn start_failure_releases_devices_and_keeps_failed_entry() {
        let h = harness().await;
        h.backend.set_fail_start(true);

        let err = h.supervisor.create_vm(request()).await.unwrap_err();
        assert!(matches!(err, VmError::Start(_)));

        let vms = h.supervisor.list();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].state, VmState::Failed);
        assert_eq!(vms[0].error.as_deref(), Some("vm failed to start"));
        assert_eq!(vms[0].ip_address, None);
        assert!(h.host.link("fctap0").is_none());

        h.backend.set_fail_start(false);
        let vm = h.supervisor.create_vm(request()).await.unwrap();
        assert_eq!(vm.ip_address, Some(Ipv4Addr::new(172, 16, 0, 2)));
    }

    #[tokio::test]
    async fn slow_start_times_out() {
        let h = harness_with(FakeSource::new(), Duration::from_millis(50)).await;
        h.backend.set_start_delay(Some(Duration::from_secs(5)));

        let err = h.supervisor.create_vm(request()).await.unwrap_err();
        assert!(matches!(err, VmError::TimedOut { operation: "start", .. }));
        assert_eq!(h.supervisor.list()[0].state, VmState::Failed);
        assert!(h.host.link("fctap0").is_none());
    }

    #[tokio::test]
    async fn ssh_disk_failure_fails_before_network() {
        let h = harness().await;
        h.host.fail_program("mkfs.ext4");

        let err = h.supervisor.create_vm(request()).await.unwrap_err();
        assert!(matches!(err, VmError::Image(ImageError::Format(_))));
        assert!(!h.host.commands().iter().any(|c| c.contains("tuntap")));
        let failed = &h.supervisor.list()[0];
        assert_eq!(failed.state, VmState::Failed);
        assert_eq!(failed.error.as_deref(), Some("failed to prepare vm disks"));
        assert!(h.backend.started().is_empty());
    }

    #[tokio::test]
    async fn tap_failure_is_reported_as_network_error() {
        let h = harness().await;
        h.host.fail_matching("tuntap");

        let err = h.supervisor.create_vm(request()).await.unwrap_err();
        assert!(matches!(err, VmError::Network(_)));
        assert_eq!(h.supervisor.list()[0].state, VmState::Failed);
    }

    #[tokio::test]
    async fn create_from_container_image_uses_cached_blob() {
        let layer = FakeSource::tar_layer(&[("etc/", ""), ("etc/os-release", "ID=alpine\n")]);
        let h = harness_with(
            FakeSource::new().with_image("alpine:3.19", vec![layer]),
            Duration::from_secs(5),
        )
        .await;

        let req = CreateVmRequest {
            ssh_public_key: KEY.to_string(),
            image: Some("alpine:3.19".to_string()),
        };
        let vm = h.supervisor.create_vm(req.clone()).await.unwrap();
        assert_eq!(vm.image.as_deref(), Some("alpine:3.19"));
        h.supervisor.create_vm(req).await.unwrap();

        assert_eq!(h.source.pulls(), 1);
        let started = h.backend.started();
        let blob = h.dir.path().join("cache/blobs/alpine-3.19");
        assert!(started.iter().all(|c| c.drives[0].path_on_host == blob));
    }

    #[tokio::test]
    async fn unknown_image_fails_create() {
        let h = harness().await;
        let err = h
            .supervisor
            .create_vm(CreateVmRequest {
                ssh_public_key: KEY.to_string(),
                image: Some("missing:latest".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::Image(ImageError::Pull { .. })));
    }

    #[tokio::test]
    async fn delete_stops_and_releases() {
        let h = harness().await;
        let vm = h.supervisor.create_vm(request()).await.unwrap();

        h.supervisor.delete_vm(&vm.id).await.unwrap();
        assert_eq!(h.backend.stops(), 1);
        assert!(h.supervisor.get(&vm.id).is_none());
        assert!(h.host.link("fctap0").is_none());

        let next = h.supervisor.create_vm(request()).await.unwrap();
        assert_eq!(next.ip_address, vm.ip_address);
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let h = harness().await;
        h.supervisor.create_vm(request()).await.unwrap();

        let err = h.supervisor.delete_vm("does-not-exist").await.unwrap_err();
        assert!(matches!(err, VmError::NotFound { .. }));
        assert_eq!(h.supervisor.list().len(), 1);
        assert_eq!(h.backend.stops(), 0);
    }

    #[tokio::test]
    async fn delete_while_starting_is_rejected() {
        let h = harness().await;
        h.backend.set_start_delay(Some(Duration::from_millis(300)));

        let supervisor = Arc::clone(&h.supervisor);
        let create = tokio::spawn(async move { supervisor.create_vm(request()).await });
        let starting = wait_for_state(&h.supervisor, VmState::Starting).await;

        let err = h.supervisor.delete_vm(&starting.id).await.unwrap_err();
        assert!(matches!(err, VmError::InvalidState { state: VmState::Starting, .. }));

        let vm = create.await.unwrap().unwrap();
        assert_eq!(vm.state, VmState::Running);
        h.supervisor.delete_vm(&vm.id).await.unwrap();
    }

    #[tokio::test]
    async fn failed_stop_keeps_machine_for_retry() {
        let h = harness().await;
        let vm = h.supervisor.create_vm(request()).await.unwrap();
        h.backend.set_fail_stop(true);

        let err = h.supervisor.delete_vm(&vm.id).await.unwrap_err();
        assert!(matches!(err, VmError::Shutdown(_)));
        let failed = h.supervisor.get(&vm.id).unwrap();
        assert_eq!(failed.state, VmState::Failed);
        assert_eq!(failed.pid, Some(4242));
        assert!(h.host.link("fctap0").is_some());

        h.backend.set_fail_stop(false);
        h.supervisor.delete_vm(&vm.id).await.unwrap();
        assert!(h.supervisor.get(&vm.id).is_none());
        assert!(h.host.link("fctap0").is_none());
        assert_eq!(h.backend.stops(), 1);
    }

    #[tokio::test]
    async fn failed_stop_after_entry_vanished_stops_machine() {
        let h = harness().await;
        let vm = h.supervisor.create_vm(request()).await.unwrap();

        tokio::time::pause();
        h.backend.set_fail_stop(true);
        h.backend.set_stop_delay(Some(Duration::from_millis(100)));
        let supervisor = Arc::clone(&h.supervisor);
        let id = vm.id.clone();
        let delete = tokio::spawn(async move { supervisor.delete_vm(&id).await });

        // Drop the entry mid-stop, as a concurrent shutdown drain would.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.supervisor.get(&vm.id).unwrap().state, VmState::Stopping);
        let _drained = h.supervisor.registry.remove(&vm.id);

        // The first stop fails at 100ms; the retry completes at 200ms.
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.backend.set_fail_stop(false);

        let err = delete.await.unwrap().unwrap_err();
        assert!(matches!(err, VmError::Shutdown(_)));
        assert_eq!(h.backend.stops(), 1);
        assert!(h.supervisor.get(&vm.id).is_none());
    }

    #[tokio::test]
    async fn delete_purges_failed_entry() {
        let h = harness().await;
        h.backend.set_fail_start(true);
        h.supervisor.create_vm(request()).await.unwrap_err();
        let id = h.supervisor.list()[0].id.clone();

        h.supervisor.delete_vm(&id).await.unwrap();
        assert!(h.supervisor.list().is_empty());
        assert_eq!(h.backend.stops(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_everything_and_cancels_starts() {
        let h = harness().await;
        h.supervisor.create_vm(request()).await.unwrap();
        h.supervisor.create_vm(request()).await.unwrap();
        std::fs::create_dir_all(h.dir.path().join("sockets")).unwrap();
        std::fs::write(h.dir.path().join("sockets/stale.sock"), "").unwrap();

        h.backend.set_start_delay(Some(Duration::from_secs(5)));
        let supervisor = Arc::clone(&h.supervisor);
        let pending = tokio::spawn(async move { supervisor.create_vm(request()).await });
        wait_for_state(&h.supervisor, VmState::Starting).await;

        h.supervisor.shutdown().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, VmError::Cancelled));

        assert_eq!(h.backend.stops(), 2);
        assert!(h.supervisor.list().is_empty());
        assert!(!h.host.link_names().iter().any(|n| n.starts_with("fctap")));
        assert_eq!(
            std::fs::read_dir(h.dir.path().join("sockets")).unwrap().count(),
            0
        );

        let err = h.supervisor.create_vm(request()).await.unwrap_err();
        assert!(matches!(err, VmError::Cancelled));
    }
}

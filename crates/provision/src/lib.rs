//! Host-side provisioning for Firecracker microVMs.
//!
//! Builds the squashfs root filesystems and per-key SSH disks VMs boot from,
//! attaches VMs to a shared bridge through TAP devices with addresses from one
//! IPv4 prefix, and tracks each VM through its lifecycle.

pub mod command;
pub mod image;
pub mod mount;
pub mod network;
pub mod overlay;
pub mod paths;
pub mod sshkey;
pub mod supervisor;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use command::{CommandError, CommandRunner, HostCommand, SystemRunner};
pub use image::{ImageBuilder, ImageError, ImageSource, PullError, RegistrySource};
pub use mount::{MountError, MountHandle, MountService};
pub use network::{
    Ipv4Prefix, Lease, NetworkConfig, NetworkError, NetworkManager, TapDevice,
};
pub use overlay::{ComposeError, OverlayComposer};
pub use paths::{CachePaths, LogPaths, RuntimePaths};
pub use sshkey::SshKeyImageBuilder;
pub use supervisor::{
    CreateVmRequest, MachineSettings, Supervisor, SupervisorConfig, VmError, VmInstance, VmState,
};

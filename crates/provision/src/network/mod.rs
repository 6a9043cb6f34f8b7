mod error;
mod guest;
mod ipam;
mod manager;

pub use error::{NetworkError, Result};
pub use guest::{GUEST_IFACE, guest_boot_args, guest_mac};
pub use ipam::{IpPool, Ipv4Prefix, Lease};
pub use manager::{Bridge, NetworkConfig, NetworkManager, TapDevice};

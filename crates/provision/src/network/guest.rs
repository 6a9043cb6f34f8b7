use std::net::Ipv4Addr;

use super::ipam::Lease;

/// Guest interface name inside the VM.
pub const GUEST_IFACE: &str = "eth0";

/// Kernel `ip=` argument configuring the guest NIC statically at boot.
pub fn guest_boot_args(lease: &Lease, gateway: Ipv4Addr, hostname: &str) -> String {
    format!(
        "ip={}::{gateway}:{}:{hostname}:{GUEST_IFACE}:off",
        lease.address,
        lease.prefix.netmask(),
    )
}

/// Locally administered MAC derived from the guest address.
///
/// Unique for as long as addresses are.
pub fn guest_mac(address: Ipv4Addr) -> String {
    let [a, b, c, d] = address.octets();
    format!("06:00:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}

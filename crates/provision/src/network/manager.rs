//! Host bridge, per-VM TAP devices and guest address allocation.
//!
//! ```text
//!   ┌────────┐  ┌────────┐
//!   │  VM 1  │  │  VM 2  │      guests: .2, .3, ...
//!   └───┬────┘  └───┬────┘
//!    fctap0      fctap1         TAP devices (persistent)
//!       └─────┬─────┘
//!       firecracker-br          bridge, holds the gateway (.1)
//! ```
//!
//! All VMs share one bridge and one IPv4 prefix. The bridge takes the first
//! host address of the prefix; guests get the lowest free address after it.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::command::{CommandError, CommandRunner, HostCommand, run_blocking};

use super::error::{NetworkError, Result};
use super::ipam::{IpPool, Ipv4Prefix, Lease};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Linux interface names are at most 15 bytes (IFNAMSIZ - 1).
const MAX_IFNAME_LEN: usize = 15;

/// Digits reserved for the TAP counter suffix.
const TAP_SUFFIX_DIGITS: usize = 5;

/// Suffixes cycle through `0..TAP_SUFFIX_SPACE` so names fit the digit budget.
const TAP_SUFFIX_SPACE: u32 = 100_000;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bridge every TAP device is enslaved to.
    pub bridge: String,
    /// Prefix guests (and the bridge) take addresses from.
    pub prefix: Ipv4Prefix,
    /// Name prefix for TAP devices; also identifies orphans at startup.
    pub tap_prefix: String,
    pub tap_multi_queue: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: "firecracker-br".to_string(),
            prefix: Ipv4Prefix::DEFAULT,
            tap_prefix: "fctap".to_string(),
            tap_multi_queue: false,
        }
    }
}

impl NetworkConfig {
    fn validate(&self) -> Result<()> {
        if self.bridge.is_empty() || self.bridge.len() > MAX_IFNAME_LEN {
            return Err(NetworkError::InvalidConfig(format!(
                "bridge name {:?} must be 1-{MAX_IFNAME_LEN} bytes",
                self.bridge
            )));
        }
        let max_prefix = MAX_IFNAME_LEN - TAP_SUFFIX_DIGITS;
        if self.tap_prefix.is_empty() || self.tap_prefix.len() > max_prefix {
            return Err(NetworkError::InvalidConfig(format!(
                "tap prefix {:?} must be 1-{max_prefix} bytes",
                self.tap_prefix
            )));
        }
        if self.prefix.hosts().nth(1).is_none() {
            return Err(NetworkError::InvalidConfig(format!(
                "prefix {} leaves no guest addresses",
                self.prefix
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    pub name: String,
    pub index: u32,
}

/// A persistent TAP device attached to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct TapDevice {
    pub name: String,
    pub index: u32,
}

// ---------------------------------------------------------------------------
// `ip` output parsing (pure functions)
// ---------------------------------------------------------------------------

/// Interface index from an `ip link show` line (`"5: fctap0: <...> ..."`).
fn parse_link_index(line: &str) -> Option<u32> {
    line.split(':').next()?.trim().parse().ok()
}

/// Interface names from `ip -o link show`, without any `@peer` suffix.
fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let name = line.split(": ").nth(1)?;
            let name = name.split('@').next().unwrap_or(name).trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

/// IPv4 addresses with prefix length from `ip -4 -o addr show`.
fn parse_ipv4_addrs(output: &str) -> Vec<(Ipv4Addr, u8)> {
    output
        .lines()
        .filter_map(|line| {
            let cidr = line
                .split_whitespace()
                .skip_while(|&w| w != "inet")
                .nth(1)?;
            let (addr, len) = cidr.split_once('/')?;
            Some((addr.parse().ok()?, len.parse().ok()?))
        })
        .collect()
}

/// Whether `name` looks like a TAP device this manager created.
fn is_managed_tap(name: &str, tap_prefix: &str) -> bool {
    name.strip_prefix(tap_prefix)
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

// ---------------------------------------------------------------------------
// Network operations
// ---------------------------------------------------------------------------

async fn ip(runner: &Arc<dyn CommandRunner>, args: &[&str]) -> std::result::Result<String, CommandError> {
    run_blocking(runner, HostCommand::new("ip").args(args)).await
}

async fn ip_ignore_errors(runner: &Arc<dyn CommandRunner>, args: &[&str]) {
    if let Err(e) = ip(runner, args).await {
        debug!(command = %e.command, detail = %e.detail, "command failed (ignored)");
    }
}

async fn link_index(runner: &Arc<dyn CommandRunner>, name: &str) -> std::result::Result<u32, String> {
    let out = ip(runner, &["-o", "link", "show", "dev", name])
        .await
        .map_err(|e| e.to_string())?;
    parse_link_index(&out).ok_or_else(|| format!("unexpected `ip link show` output: {out}"))
}

/// Look up bridge `name`, creating it if absent.
async fn ensure_bridge_exists(runner: &Arc<dyn CommandRunner>, name: &str) -> Result<Bridge> {
    if let Ok(out) = ip(runner, &["link", "show", "dev", name]).await {
        let index = parse_link_index(&out).ok_or_else(|| {
            NetworkError::Device(format!("unexpected `ip link show` output: {out}"))
        })?;
        debug!(bridge = %name, "bridge exists, reusing");
        return Ok(Bridge {
            name: name.to_string(),
            index,
        });
    }

    info!(bridge = %name, "creating bridge");
    let created = ip(runner, &["link", "add", "name", name, "type", "bridge"]).await;
    // Another process may have created it in the meantime.
    match link_index(runner, name).await {
        Ok(index) => Ok(Bridge {
            name: name.to_string(),
            index,
        }),
        Err(lookup) => Err(NetworkError::Device(match created {
            Err(e) => format!("create bridge {name}: {e}"),
            Ok(_) => format!("bridge {name} missing after create: {lookup}"),
        })),
    }
}

async fn interface_ipv4(runner: &Arc<dyn CommandRunner>, name: &str) -> Result<Vec<(Ipv4Addr, u8)>> {
    let out = ip(runner, &["-4", "-o", "addr", "show", "dev", name])
        .await
        .map_err(|e| NetworkError::NotFound(format!("interface {name}: {}", e.detail)))?;
    Ok(parse_ipv4_addrs(&out))
}

/// Delete TAP devices left behind by an earlier process.
async fn cleanup_orphan_taps(runner: &Arc<dyn CommandRunner>, tap_prefix: &str) -> Result<usize> {
    let out = ip(runner, &["-o", "link", "show"]).await?;
    let orphans: Vec<String> = parse_link_names(&out)
        .into_iter()
        .filter(|n| is_managed_tap(n, tap_prefix))
        .collect();
    for name in &orphans {
        info!(tap = %name, "removing orphaned tap device");
        ip_ignore_errors(runner, &["link", "del", name]).await;
    }
    Ok(orphans.len())
}

// ---------------------------------------------------------------------------
// TAP suffixes
// ---------------------------------------------------------------------------

/// Round-robin TAP suffixes, skipping ones whose device is still live.
#[derive(Debug, Default)]
struct TapSuffixes {
    next: u32,
    live: HashSet<u32>,
}

impl TapSuffixes {
    fn claim(&mut self) -> Option<u32> {
        for _ in 0..TAP_SUFFIX_SPACE {
            let n = self.next;
            self.next = (n + 1) % TAP_SUFFIX_SPACE;
            if self.live.insert(n) {
                return Some(n);
            }
        }
        None
    }

    fn release(&mut self, n: u32) {
        self.live.remove(&n);
    }
}

// ---------------------------------------------------------------------------
// NetworkManager
// ---------------------------------------------------------------------------

pub struct NetworkManager {
    runner: Arc<dyn CommandRunner>,
    config: NetworkConfig,
    pool: Mutex<IpPool>,
    /// Serializes bridge check-and-create.
    bridge_lock: tokio::sync::Mutex<()>,
    taps: Mutex<TapSuffixes>,
    gateway: Ipv4Addr,
}

impl NetworkManager {
    /// Bring up the bridge, clear orphaned TAP devices and reserve the
    /// gateway address.
    pub async fn new(runner: Arc<dyn CommandRunner>, config: NetworkConfig) -> Result<Self> {
        config.validate()?;

        let bridge = ensure_bridge_exists(&runner, &config.bridge).await?;
        let removed = cleanup_orphan_taps(&runner, &config.tap_prefix).await?;

        let mut pool = IpPool::new(config.prefix);
        let existing = interface_ipv4(&runner, &bridge.name)
            .await?
            .into_iter()
            .map(|(addr, _)| addr)
            .find(|addr| config.prefix.contains(*addr));
        let gateway = match existing {
            Some(addr) => {
                pool.reserve(addr);
                debug!(bridge = %bridge.name, gateway = %addr, "bridge already addressed");
                addr
            }
            None => {
                let addr = pool.allocate().ok_or_else(|| NetworkError::PoolExhausted {
                    prefix: config.prefix.to_string(),
                })?;
                let cidr = format!("{addr}/{}", config.prefix.prefix_len());
                ip(&runner, &["addr", "add", &cidr, "dev", &bridge.name])
                    .await
                    .map_err(|e| NetworkError::Device(format!("address bridge: {e}")))?;
                addr
            }
        };
        ip(&runner, &["link", "set", "dev", &bridge.name, "up"])
            .await
            .map_err(|e| NetworkError::Device(format!("bring bridge up: {e}")))?;

        info!(
            bridge = %bridge.name,
            prefix = %config.prefix,
            gateway = %gateway,
            orphans_removed = removed,
            "network ready"
        );
        Ok(Self {
            runner,
            config,
            pool: Mutex::new(pool),
            bridge_lock: tokio::sync::Mutex::new(()),
            taps: Mutex::new(TapSuffixes::default()),
            gateway,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Address assigned to the bridge at startup.
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    fn pool(&self) -> MutexGuard<'_, IpPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn taps(&self) -> MutexGuard<'_, TapSuffixes> {
        self.taps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tap_suffix(&self, name: &str) -> Option<u32> {
        name.strip_prefix(&self.config.tap_prefix)?.parse().ok()
    }

    /// Get or create bridge `name`. Concurrent callers never create twice.
    pub async fn ensure_bridge(&self, name: &str) -> Result<Bridge> {
        let _guard = self.bridge_lock.lock().await;
        ensure_bridge_exists(&self.runner, name).await
    }

    /// Take the lowest free guest address.
    pub fn allocate_address(&self) -> Result<Lease> {
        let mut pool = self.pool();
        let address = pool.allocate().ok_or_else(|| NetworkError::PoolExhausted {
            prefix: self.config.prefix.to_string(),
        })?;
        debug!(address = %address, in_use = pool.in_use(), "address allocated");
        Ok(Lease {
            address,
            prefix: self.config.prefix,
        })
    }

    /// Return an address to the pool.
    pub fn release_address(&self, address: Ipv4Addr) {
        if address == self.gateway {
            warn!(address = %address, "refusing to release gateway address");
            return;
        }
        if !self.pool().release(address) {
            warn!(address = %address, "released address was not allocated");
        }
    }

    /// Create a TAP device and attach it to the bridge.
    ///
    /// A half-made device is deleted before the error is returned.
    pub async fn create_tap(&self) -> Result<TapDevice> {
        let n = self
            .taps()
            .claim()
            .ok_or_else(|| NetworkError::Device("no free tap device names".to_string()))?;
        let name = format!("{}{n}", self.config.tap_prefix);
        match self.create_tap_inner(&name).await {
            Ok(tap) => {
                info!(tap = %tap.name, index = tap.index, "tap created");
                Ok(tap)
            }
            Err(e) => {
                warn!(tap = %name, error = %e, "tap creation failed, cleaning up");
                ip_ignore_errors(&self.runner, &["link", "del", &name]).await;
                self.taps().release(n);
                Err(NetworkError::Device(format!("{name}: {e}")))
            }
        }
    }

    async fn create_tap_inner(&self, name: &str) -> std::result::Result<TapDevice, String> {
        let mut add = vec!["tuntap", "add", "dev", name, "mode", "tap"];
        if self.config.tap_multi_queue {
            add.push("multi_queue");
        }
        ip(&self.runner, &add).await.map_err(|e| e.to_string())?;
        let index = link_index(&self.runner, name).await?;
        ip(
            &self.runner,
            &["link", "set", "dev", name, "master", &self.config.bridge],
        )
        .await
        .map_err(|e| e.to_string())?;
        ip(&self.runner, &["link", "set", "dev", name, "up"])
            .await
            .map_err(|e| e.to_string())?;
        Ok(TapDevice {
            name: name.to_string(),
            index,
        })
    }

    /// Delete a TAP device. Best-effort.
    pub async fn delete_tap(&self, tap: &TapDevice) {
        ip_ignore_errors(&self.runner, &["link", "del", &tap.name]).await;
        if let Some(n) = self.tap_suffix(&tap.name) {
            self.taps().release(n);
        }
        debug!(tap = %tap.name, "tap deleted");
    }

    /// The bridge's IPv4 address inside the guest prefix.
    pub async fn bridge_gateway_address(&self) -> Result<Ipv4Addr> {
        let bridge = &self.config.bridge;
        interface_ipv4(&self.runner, bridge)
            .await?
            .into_iter()
            .map(|(addr, _)| addr)
            .find(|addr| self.config.prefix.contains(*addr))
            .ok_or_else(|| {
                NetworkError::NotFound(format!(
                    "bridge {bridge} has no address in {}",
                    self.config.prefix
                ))
            })
    }

    /// First IPv4 address of interface `name`.
    pub async fn interface_address(&self, name: &str) -> Result<Ipv4Addr> {
        interface_ipv4(&self.runner, name)
            .await?
            .into_iter()
            .map(|(addr, _)| addr)
            .next()
            .ok_or_else(|| NetworkError::NotFound(format!("interface {name} has no IPv4 address")))
    }
}

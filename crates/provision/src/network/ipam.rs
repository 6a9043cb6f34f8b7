use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::NetworkError;

/// An IPv4 network in CIDR form, e.g. `172.16.0.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Prefix {
    network: Ipv4Addr,
    len: u8,
}

impl Ipv4Prefix {
    /// `172.16.0.0/24`.
    pub const DEFAULT: Self = Self {
        network: Ipv4Addr::new(172, 16, 0, 0),
        len: 24,
    };

    /// Build a prefix, clearing any host bits in `addr`.
    pub fn new(addr: Ipv4Addr, len: u8) -> Result<Self, NetworkError> {
        if len > 32 {
            return Err(NetworkError::InvalidPrefix(format!("{addr}/{len}")));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask_bits(len));
        Ok(Self { network, len })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_bits(self.len))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask_bits(self.len))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_bits(self.len) == u32::from(self.network)
    }

    /// Assignable host addresses in ascending order.
    ///
    /// Network and broadcast addresses are excluded, except for /31 and /32
    /// where every address is a host.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        let first = u32::from(self.network);
        let last = u32::from(self.broadcast());
        let (start, end) = if self.len >= 31 {
            (first, last)
        } else {
            (first + 1, last - 1)
        };
        (start..=end).map(Ipv4Addr::from)
    }
}

fn mask_bits(len: u8) -> u32 {
    match len {
        0 => 0,
        n => u32::MAX << (32 - u32::from(n.min(32))),
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.len)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetworkError::InvalidPrefix(s.to_string());
        let (addr, len) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let len: u8 = len.parse().map_err(|_| invalid())?;
        Self::new(addr, len)
    }
}

impl TryFrom<String> for Ipv4Prefix {
    type Error = NetworkError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Prefix> for String {
    fn from(p: Ipv4Prefix) -> Self {
        p.to_string()
    }
}

/// An address handed out from the pool, with the prefix it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub prefix: Ipv4Prefix,
}

impl Lease {
    /// `address/len`, the form `ip addr add` takes.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix.prefix_len())
    }
}

/// Tracks which host addresses of a prefix are in use.
#[derive(Debug)]
pub struct IpPool {
    prefix: Ipv4Prefix,
    allocated: BTreeSet<Ipv4Addr>,
}

impl IpPool {
    pub fn new(prefix: Ipv4Prefix) -> Self {
        Self {
            prefix,
            allocated: BTreeSet::new(),
        }
    }

    pub fn prefix(&self) -> Ipv4Prefix {
        self.prefix
    }

    /// Take the lowest free host address.
    pub fn allocate(&mut self) -> Option<Ipv4Addr> {
        let addr = self.prefix.hosts().find(|a| !self.allocated.contains(a))?;
        self.allocated.insert(addr);
        Some(addr)
    }

    /// Mark `addr` as used. Returns `false` if it is outside the host range
    /// or already taken.
    pub fn reserve(&mut self, addr: Ipv4Addr) -> bool {
        if !self.is_host(addr) {
            return false;
        }
        self.allocated.insert(addr)
    }

    /// Return `addr` to the pool. Returns `false` if it was not allocated.
    pub fn release(&mut self, addr: Ipv4Addr) -> bool {
        self.allocated.remove(&addr)
    }

    pub fn in_use(&self) -> usize {
        self.allocated.len()
    }

    fn is_host(&self, addr: Ipv4Addr) -> bool {
        self.prefix.contains(addr)
            && (self.prefix.prefix_len() >= 31
                || (addr != self.prefix.network() && addr != self.prefix.broadcast()))
    }
}

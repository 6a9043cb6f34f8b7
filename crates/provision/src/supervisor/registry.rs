use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use machine::Machine;
use serde::Serialize;
use uuid::Uuid;

use super::error::{Result, VmError};
use super::state::VmState;
use crate::network::{Lease, TapDevice};

/// Point-in-time view of a VM, safe to hand out of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInstance {
    pub id: String,
    pub state: VmState,
    pub ip_address: Option<Ipv4Addr>,
    pub tap_device: Option<String>,
    /// Container image reference, `None` for the canonical rootfs.
    pub image: Option<String>,
    pub pid: Option<u32>,
    pub error: Option<String>,
    #[serde(serialize_with = "serialize_iso")]
    pub created_at: DateTime<Utc>,
}

fn serialize_iso<S: serde::Serializer>(dt: &DateTime<Utc>, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Registry entry. Owns the devices and the machine handle of one VM.
pub(crate) struct VmRecord {
    pub id: String,
    pub state: VmState,
    pub image: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub tap: Option<TapDevice>,
    pub lease: Option<Lease>,
    pub machine: Option<Box<dyn Machine>>,
}

impl VmRecord {
    fn new(id: String, image: Option<String>) -> Self {
        Self {
            id,
            state: VmState::Created,
            image,
            error: None,
            created_at: Utc::now(),
            tap: None,
            lease: None,
            machine: None,
        }
    }

    pub fn transition(&mut self, next: VmState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(VmError::InvalidState {
                id: self.id.clone(),
                state: self.state,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn snapshot(&self) -> VmInstance {
        VmInstance {
            id: self.id.clone(),
            state: self.state,
            ip_address: self.lease.map(|l| l.address),
            tap_device: self.tap.as_ref().map(|t| t.name.clone()),
            image: self.image.clone(),
            pid: self.machine.as_ref().and_then(|m| m.pid()),
            error: self.error.clone(),
            created_at: self.created_at,
        }
    }
}

/// Every VM this process knows about, keyed by id.
///
/// One lock guards the map; it is never held across an await.
#[derive(Default)]
pub(crate) struct VmRegistry {
    vms: Mutex<HashMap<String, VmRecord>>,
}

impl VmRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, VmRecord>> {
        self.vms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a `Created` entry under a fresh, unused id.
    pub fn reserve(&self, image: Option<String>) -> String {
        let mut vms = self.lock();
        let id = loop {
            let id = Uuid::new_v4().to_string();
            if !vms.contains_key(&id) {
                break id;
            }
        };
        vms.insert(id.clone(), VmRecord::new(id.clone(), image));
        id
    }

    /// Run `f` on the entry for `id` under the lock.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut VmRecord) -> R) -> Result<R> {
        let mut vms = self.lock();
        let record = vms.get_mut(id).ok_or_else(|| VmError::NotFound { id: id.to_string() })?;
        Ok(f(record))
    }

    pub fn get(&self, id: &str) -> Option<VmInstance> {
        self.lock().get(id).map(VmRecord::snapshot)
    }

    /// All entries, oldest first.
    pub fn list(&self) -> Vec<VmInstance> {
        let mut all: Vec<_> = self.lock().values().map(VmRecord::snapshot).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn remove(&self, id: &str) -> Option<VmRecord> {
        self.lock().remove(id)
    }

    /// Take every entry out of the registry.
    pub fn drain(&self) -> Vec<VmRecord> {
        self.lock().drain().map(|(_, record)| record).collect()
    }
}

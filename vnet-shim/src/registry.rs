//! Process-wide registry of virtual interfaces.
//!
//! The registry hands out device names from a monotonic counter and maps
//! network ids to their interface so the virtual wire can deliver frames
//! by network id. Lookups are lock-free (ArcSwap); registration copies the
//! map, which only happens when an interface joins or leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::ArcSwap;
use smoltcp::wire::EthernetAddress;
use tracing::{debug, warn};

use crate::iface::VirtualInterface;

static GLOBAL: OnceLock<Arc<ShimRegistry>> = OnceLock::new();

/// Registry of live interfaces keyed by network id.
pub struct ShimRegistry {
    /// Next device number; never reused within the registry's lifetime.
    next_device: AtomicU64,
    interfaces: ArcSwap<HashMap<u64, Weak<VirtualInterface>>>,
}

impl ShimRegistry {
    pub fn new() -> Self {
        Self {
            next_device: AtomicU64::new(0),
            interfaces: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> Arc<ShimRegistry> {
        GLOBAL.get_or_init(|| Arc::new(ShimRegistry::new())).clone()
    }

    /// Allocate the next device name, `prefix` followed by the counter.
    pub fn next_device_name(&self, prefix: &str) -> String {
        let n = self.next_device.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}{n}")
    }

    /// Register an interface under its network id.
    ///
    /// Returns false if a live interface for the same network was replaced.
    pub fn register(&self, iface: &Arc<VirtualInterface>) -> bool {
        let nwid = iface.nwid();
        let weak = Arc::downgrade(iface);
        let previous = self.interfaces.rcu(|map| {
            let mut map = HashMap::clone(map);
            map.insert(nwid, weak.clone());
            map
        });
        let replaced_live = previous
            .get(&nwid)
            .is_some_and(|old| old.strong_count() > 0);
        if replaced_live {
            warn!(nwid = %format_args!("{nwid:016x}"), "Replaced live interface in registry");
        }
        debug!(nwid = %format_args!("{nwid:016x}"), device = %iface.device_name(), "Registered interface");
        !replaced_live
    }

    /// Remove `iface` from the registry.
    ///
    /// Only removes the entry if it still points at `iface`; works while
    /// `iface` is being dropped.
    pub fn unregister(&self, iface: &VirtualInterface) -> bool {
        let nwid = iface.nwid();
        let target: *const VirtualInterface = iface;
        let mut removed = false;
        self.interfaces.rcu(|map| {
            let mut map = HashMap::clone(map);
            removed = map
                .get(&nwid)
                .is_some_and(|w| std::ptr::eq(w.as_ptr(), target));
            if removed {
                map.remove(&nwid);
            }
            map
        });
        if removed {
            debug!(nwid = %format_args!("{nwid:016x}"), "Unregistered interface");
        }
        removed
    }

    /// Look up the live interface for a network.
    pub fn get(&self, nwid: u64) -> Option<Arc<VirtualInterface>> {
        self.interfaces.load().get(&nwid).and_then(Weak::upgrade)
    }

    /// Deliver one frame from the virtual wire to the interface of `nwid`.
    ///
    /// Returns false if no live interface is registered for the network.
    pub fn deliver(
        &self,
        nwid: u64,
        from: EthernetAddress,
        to: EthernetAddress,
        ethertype: u16,
        data: &[u8],
    ) -> bool {
        match self.get(nwid) {
            Some(iface) => {
                iface.put(from, to, ethertype, data);
                true
            }
            None => false,
        }
    }

    /// Network ids with a live interface, sorted.
    pub fn network_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .interfaces
            .load()
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .map(|(nwid, _)| *nwid)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of live interfaces.
    pub fn len(&self) -> usize {
        self.interfaces
            .load()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ShimRegistry {
    fn default() -> Self {
        Self::new()
    }
}

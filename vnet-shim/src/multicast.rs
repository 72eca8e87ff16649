//! Multicast group derivation and change tracking.
//!
//! Every bound address maps to the multicast group its peers use for
//! address resolution. The tracker recomputes that set on each scan and
//! reports what joined and what left since the previous scan.

use ipnet::IpNet;
use parking_lot::Mutex;
use smoltcp::wire::EthernetAddress;
use std::fmt;
use std::net::IpAddr;

/// A multicast group: a MAC address plus a 32-bit additional distinguishing
/// information field (ADI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MulticastGroup {
    mac: [u8; 6],
    adi: u32,
}

impl MulticastGroup {
    pub fn new(mac: [u8; 6], adi: u32) -> Self {
        Self { mac, adi }
    }

    /// Group used to resolve `addr` on the virtual wire.
    ///
    /// IPv4 uses the broadcast MAC with the address itself as ADI, so ARP
    /// for different addresses lands in different groups. IPv6 uses the
    /// solicited-node multicast MAC (33:33:ff + low 24 bits) with ADI 0.
    pub fn for_address_resolution(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::new([0xff; 6], u32::from(v4)),
            IpAddr::V6(v6) => {
                let o = v6.octets();
                Self::new([0x33, 0x33, 0xff, o[13], o[14], o[15]], 0)
            }
        }
    }

    pub fn mac(&self) -> EthernetAddress {
        EthernetAddress(self.mac)
    }

    pub fn adi(&self) -> u32 {
        self.adi
    }
}

impl fmt::Display for MulticastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:08x}", self.mac(), self.adi)
    }
}

/// Result of one multicast scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MulticastDelta {
    /// Groups present now that were not tracked before.
    pub added: Vec<MulticastGroup>,
    /// Groups tracked before that are no longer derived.
    pub removed: Vec<MulticastGroup>,
}

impl MulticastDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Tracks the multicast groups derived from an interface's addresses.
#[derive(Debug, Default)]
pub struct MulticastTracker {
    groups: Mutex<Vec<MulticastGroup>>,
}

impl MulticastTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute groups from `addrs` and diff against the tracked set.
    ///
    /// Afterwards the tracked set equals the new candidate set, and
    /// `added`/`removed` are exactly `new \ old` and `old \ new`.
    pub fn scan(&self, addrs: &[IpNet]) -> MulticastDelta {
        let mut candidates: Vec<MulticastGroup> = addrs
            .iter()
            .map(|a| MulticastGroup::for_address_resolution(a.addr()))
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        let mut tracked = self.groups.lock();
        let added = candidates
            .iter()
            .filter(|g| tracked.binary_search(g).is_err())
            .copied()
            .collect();
        let removed = tracked
            .iter()
            .filter(|g| candidates.binary_search(g).is_err())
            .copied()
            .collect();
        *tracked = candidates;

        MulticastDelta { added, removed }
    }

    /// Currently tracked groups, sorted.
    pub fn groups(&self) -> Vec<MulticastGroup> {
        self.groups.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn nets(list: &[&str]) -> Vec<IpNet> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_ipv4_group() {
        let g = MulticastGroup::for_address_resolution("10.0.0.1".parse().unwrap());
        assert_eq!(g.mac(), EthernetAddress::BROADCAST);
        assert_eq!(g.adi(), 0x0a00_0001);
    }

    #[test]
    fn test_ipv6_group() {
        let g = MulticastGroup::for_address_resolution("fd00::12:3456".parse().unwrap());
        assert_eq!(g.mac(), EthernetAddress([0x33, 0x33, 0xff, 0x12, 0x34, 0x56]));
        assert_eq!(g.adi(), 0);
    }

    #[test]
    fn test_scan_reports_exact_symmetric_difference() {
        let tracker = MulticastTracker::new();
        let first = tracker.scan(&nets(&["10.0.0.1/24", "10.0.0.2/24"]));
        assert_eq!(first.added.len(), 2);
        assert!(first.removed.is_empty());

        let old: BTreeSet<_> = tracker.groups().into_iter().collect();
        let delta = tracker.scan(&nets(&["10.0.0.2/24", "fd00::7/64"]));
        let new: BTreeSet<_> = tracker.groups().into_iter().collect();

        let added: BTreeSet<_> = delta.added.iter().copied().collect();
        let removed: BTreeSet<_> = delta.removed.iter().copied().collect();
        assert_eq!(added, new.difference(&old).copied().collect());
        assert_eq!(removed, old.difference(&new).copied().collect());
        assert!(added.is_disjoint(&removed));
    }

    #[test]
    fn test_duplicate_candidates_collapse() {
        // Same address under two prefix lengths derives the same group twice.
        let tracker = MulticastTracker::new();
        let delta = tracker.scan(&nets(&["10.0.0.1/24", "10.0.0.1/16"]));
        assert_eq!(delta.added.len(), 1);
        assert_eq!(tracker.groups().len(), 1);

        // IPv6 addresses sharing the low 24 bits collide on purpose.
        let delta = tracker.scan(&nets(&["fd00::aa:bbcc/64", "fd01::aa:bbcc/64"]));
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(tracker.groups().len(), 1);
    }

    #[test]
    fn test_rescan_without_change_is_empty() {
        let tracker = MulticastTracker::new();
        let addrs = nets(&["10.0.0.1/24"]);
        assert!(!tracker.scan(&addrs).is_empty());
        assert!(tracker.scan(&addrs).is_empty());
        assert!(tracker.scan(&[]).removed.len() == 1);
    }
}

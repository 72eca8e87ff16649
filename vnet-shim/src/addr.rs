//! Sorted, de-duplicated set of addresses bound to one virtual network.

use ipnet::IpNet;
use parking_lot::Mutex;

/// Addresses bound to a virtual network interface.
///
/// Kept sorted by `IpNet`'s total order (family, then address bytes,
/// then prefix length) with no duplicates.
#[derive(Debug, Default)]
pub struct AddressSet {
    addrs: Mutex<Vec<IpNet>>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an address. Returns false if it was already present.
    pub fn insert(&self, addr: IpNet) -> bool {
        let mut addrs = self.addrs.lock();
        match addrs.binary_search(&addr) {
            Ok(_) => false,
            Err(pos) => {
                addrs.insert(pos, addr);
                true
            }
        }
    }

    /// Remove an address. Returns false if it was not present.
    pub fn remove(&self, addr: &IpNet) -> bool {
        let mut addrs = self.addrs.lock();
        match addrs.binary_search(addr) {
            Ok(pos) => {
                addrs.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, addr: &IpNet) -> bool {
        self.addrs.lock().binary_search(addr).is_ok()
    }

    /// Copy of the current addresses, in order.
    pub fn snapshot(&self) -> Vec<IpNet> {
        self.addrs.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.addrs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_insert_keeps_sorted_and_unique() {
        let set = AddressSet::new();
        assert!(set.insert(net("10.0.0.9/24")));
        assert!(set.insert(net("fd00::1/64")));
        assert!(set.insert(net("10.0.0.1/24")));
        assert!(!set.insert(net("10.0.0.1/24")));

        let addrs = set.snapshot();
        assert_eq!(
            addrs,
            vec![net("10.0.0.1/24"), net("10.0.0.9/24"), net("fd00::1/64")]
        );
        assert!(addrs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_remove_absent_leaves_set_unchanged() {
        let set = AddressSet::new();
        set.insert(net("192.168.1.1/24"));
        assert!(!set.remove(&net("192.168.1.2/24")));
        assert_eq!(set.snapshot(), vec![net("192.168.1.1/24")]);

        assert!(set.remove(&net("192.168.1.1/24")));
        assert!(set.is_empty());
    }

    #[test]
    fn test_interleaved_add_remove() {
        let set = AddressSet::new();
        let candidates = [
            "10.1.0.4/16", "10.1.0.2/16", "fe80::2/64", "10.1.0.4/16", "fe80::1/64",
            "10.1.0.3/16",
        ];
        for (i, c) in candidates.iter().enumerate() {
            set.insert(net(c));
            if i % 3 == 2 {
                set.remove(&net("10.1.0.2/16"));
            }
        }
        let addrs = set.snapshot();
        assert!(addrs.windows(2).all(|w| w[0] < w[1]));
        assert!(!set.contains(&net("10.1.0.2/16")));
        assert_eq!(set.len(), 4);
    }
}

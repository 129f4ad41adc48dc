//! Forwarding database: overlay subnet → underlay UDP endpoint.
//!
//! The table is a linear scan over a small vector. Entries come and go at
//! cluster-churn rate while lookups run at packet rate, so the table lives
//! behind a read-write lock: the reactor takes the write half, the egress
//! worker takes the read half. A trie buys nothing at the table sizes a
//! cluster produces (at most one entry per host) and the scan keeps the
//! lookup branch-predictable.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::RwLock;

use ipnet::Ipv4Net;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FdbError {
    /// No present entry's subnet contains the queried address. The caller
    /// drops the packet; this is not a fault.
    #[error("no fdb entry contains {0}")]
    MissingEntry(Ipv4Addr),

    /// Removal named a subnet that is not in the table.
    #[error("subnet not present in fdb: {0}")]
    NotFound(Ipv4Net),

    /// An entry for the same subnet already exists. The control plane
    /// issues non-overlapping subnets, so hitting this means two sources
    /// disagree about ownership.
    #[error("fdb entry for {0} already exists")]
    EntryExists(Ipv4Net),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    overlay_subnet: Ipv4Net,
    underlay_endpoint: SocketAddrV4,
}

/// Concurrent-safe forwarding table.
///
/// Owned by the tunnel network; mutated exclusively by the lease-event
/// reactor.
#[derive(Debug, Default)]
pub struct ForwardingDb {
    entries: RwLock<Vec<Entry>>,
}

impl ForwardingDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subnet → endpoint mapping.
    pub fn add(&self, overlay_subnet: Ipv4Net, underlay_endpoint: SocketAddrV4) -> Result<(), FdbError> {
        let subnet = overlay_subnet.trunc();
        let mut entries = self.entries.write().expect("fdb lock poisoned");
        if entries.iter().any(|e| e.overlay_subnet == subnet) {
            return Err(FdbError::EntryExists(subnet));
        }
        entries.push(Entry {
            overlay_subnet: subnet,
            underlay_endpoint,
        });
        Ok(())
    }

    /// Remove the entry whose subnet equals `overlay_subnet`.
    ///
    /// Swap-with-last keeps removal O(1) after the scan; lookup order for
    /// non-overlapping control-plane subnets is unaffected.
    pub fn remove(&self, overlay_subnet: Ipv4Net) -> Result<(), FdbError> {
        let subnet = overlay_subnet.trunc();
        let mut entries = self.entries.write().expect("fdb lock poisoned");
        match entries.iter().position(|e| e.overlay_subnet == subnet) {
            Some(idx) => {
                entries.swap_remove(idx);
                Ok(())
            }
            None => Err(FdbError::NotFound(subnet)),
        }
    }

    /// Resolve an overlay address to the first entry whose subnet contains
    /// it (insertion order).
    pub fn find_underlay_endpoint(&self, overlay_ip: Ipv4Addr) -> Result<SocketAddrV4, FdbError> {
        let entries = self.entries.read().expect("fdb lock poisoned");
        entries
            .iter()
            .find(|e| e.overlay_subnet.contains(&overlay_ip))
            .map(|e| e.underlay_endpoint)
            .ok_or(FdbError::MissingEntry(overlay_ip))
    }

    /// Number of entries currently present.
    pub fn len(&self) -> usize {
        self.entries.read().expect("fdb lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().expect("test subnet")
    }

    fn ep(s: &str) -> SocketAddrV4 {
        s.parse().expect("test endpoint")
    }

    #[test]
    fn finds_the_entry_containing_the_address() {
        let db = ForwardingDb::new();
        db.add(net("10.10.1.0/24"), ep("192.168.1.1:7654")).unwrap();
        db.add(net("10.10.2.0/24"), ep("192.168.2.2:7654")).unwrap();
        db.add(net("10.10.3.0/24"), ep("192.168.3.3:7654")).unwrap();

        let found = db
            .find_underlay_endpoint(Ipv4Addr::new(10, 10, 2, 25))
            .unwrap();
        assert_eq!(found, ep("192.168.2.2:7654"));
    }

    #[test]
    fn lookup_after_removal_reports_missing_entry() {
        let db = ForwardingDb::new();
        db.add(net("10.10.1.0/24"), ep("192.168.1.1:7654")).unwrap();
        db.add(net("10.10.2.0/24"), ep("192.168.2.2:7654")).unwrap();
        db.add(net("10.10.3.0/24"), ep("192.168.3.3:7654")).unwrap();

        db.remove(net("10.10.2.0/24")).unwrap();

        let err = db
            .find_underlay_endpoint(Ipv4Addr::new(10, 10, 2, 25))
            .unwrap_err();
        assert_eq!(err, FdbError::MissingEntry(Ipv4Addr::new(10, 10, 2, 25)));
    }

    #[test]
    fn removing_an_absent_subnet_leaves_the_table_intact() {
        let db = ForwardingDb::new();
        db.add(net("10.10.1.0/24"), ep("192.168.1.1:7654")).unwrap();

        let err = db.remove(net("10.10.9.0/24")).unwrap_err();
        assert_eq!(err, FdbError::NotFound(net("10.10.9.0/24")));

        assert_eq!(
            db.find_underlay_endpoint(Ipv4Addr::new(10, 10, 1, 5)).unwrap(),
            ep("192.168.1.1:7654")
        );
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn duplicate_subnet_is_rejected() {
        let db = ForwardingDb::new();
        db.add(net("10.10.1.0/24"), ep("192.168.1.1:7654")).unwrap();
        // A host-part difference still names the same subnet.
        let err = db.add(net("10.10.1.9/24"), ep("192.168.9.9:7654")).unwrap_err();
        assert_eq!(err, FdbError::EntryExists(net("10.10.1.0/24")));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn lookup_honors_insertion_order_for_overlapping_subnets() {
        // The control plane never issues overlapping subnets, but if it
        // did, the first inserted entry wins.
        let db = ForwardingDb::new();
        db.add(net("10.10.0.0/16"), ep("192.168.0.1:7654")).unwrap();
        db.add(net("10.10.1.0/24"), ep("192.168.1.1:7654")).unwrap();

        assert_eq!(
            db.find_underlay_endpoint(Ipv4Addr::new(10, 10, 1, 5)).unwrap(),
            ep("192.168.0.1:7654")
        );
    }

    /// Run with the thread sanitizer or `--test-threads` high to shake out
    /// lock misuse: 100 concurrent adders plus a remover deleting
    /// everything except the `.7.0/24` column.
    #[test]
    fn concurrent_add_and_remove_stay_consistent() {
        use std::sync::mpsc;

        let db = ForwardingDb::new();
        const PRESERVE: u8 = 7;
        let (remove_tx, remove_rx) = mpsc::channel::<Ipv4Net>();

        std::thread::scope(|scope| {
            for i in 0..10u8 {
                for j in 0..10u8 {
                    let db = &db;
                    let remove_tx = remove_tx.clone();
                    scope.spawn(move || {
                        let subnet = net(&format!("10.{i}.{j}.0/24"));
                        let endpoint = ep(&format!("192.168.{i}.{j}:7654"));
                        db.add(subnet, endpoint).unwrap();
                        if j != PRESERVE {
                            remove_tx.send(subnet).unwrap();
                        }
                    });
                }
            }
            drop(remove_tx);

            let db = &db;
            scope.spawn(move || {
                for subnet in remove_rx {
                    db.remove(subnet).unwrap();
                }
            });
        });

        for i in 0..10u8 {
            let found = db
                .find_underlay_endpoint(format!("10.{i}.{PRESERVE}.42").parse().unwrap())
                .unwrap();
            assert_eq!(
                found,
                ep(&format!("192.168.{i}.{PRESERVE}:7654")),
                "column {i}.{PRESERVE} should have survived the remover"
            );
        }
        assert_eq!(db.len(), 10);
    }
}

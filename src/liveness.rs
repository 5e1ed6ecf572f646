//! Per-member liveness aggregation.
//!
//! Member nodes check in far more often than the store can absorb: the
//! aggregator collapses that stream into one record per (network, member),
//! keeping only the most recent report by arrival order. Every flush tick
//! the whole map is swapped out for a fresh one — never copied — so reports
//! arriving during a flush land cleanly in the next window.
//!
//! Reports are lossy by design. `last_seen` is stamped at call time, not at
//! flush time; a flush that stalls does not age the reports it carries.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::record::{MemberId, NetworkId};

/// The most recent "I am online" report from one member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeOnlineRecord {
    /// Wall-clock ms at the time the report arrived.
    pub last_seen: i64,
    /// Physical endpoint the report came from, when known.
    pub physical_address: Option<SocketAddr>,
    /// "os/arch" string as reported by the node.
    pub os_arch: String,
    /// Client version string, when reported.
    pub version: String,
}

#[derive(Default)]
pub struct LivenessMap {
    inner: Mutex<HashMap<(NetworkId, MemberId), NodeOnlineRecord>>,
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl LivenessMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a liveness report, overwriting any previous one for the pair.
    ///
    /// A report without a physical address keeps the previously observed
    /// address: transports sometimes deliver a check-in before they know the
    /// path it arrived on.
    pub fn record(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        physical_address: Option<SocketAddr>,
        os_arch: &str,
    ) {
        let mut map = self.inner.lock();
        let entry = map.entry((network_id, member_id)).or_default();
        entry.last_seen = now_ms();
        if physical_address.is_some() {
            entry.physical_address = physical_address;
        }
        entry.os_arch = os_arch.to_string();
    }

    /// Swap the current map out for a fresh empty one and return it.
    pub fn swap(&self) -> HashMap<(NetworkId, MemberId), NodeOnlineRecord> {
        let mut map = self.inner.lock();
        std::mem::take(&mut *map)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nw(n: u64) -> NetworkId {
        NetworkId(n)
    }

    fn mem(m: u64) -> MemberId {
        MemberId(m)
    }

    fn addr(s: &str) -> Option<SocketAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn test_record_collapses_to_latest() {
        let map = LivenessMap::new();
        for _ in 0..5 {
            map.record(nw(1), mem(2), addr("1.2.3.4:9993"), "linux/x86_64");
        }
        map.record(nw(1), mem(2), addr("5.6.7.8:9993"), "linux/x86_64");

        assert_eq!(map.len(), 1);
        let drained = map.swap();
        let rec = &drained[&(nw(1), mem(2))];
        assert_eq!(rec.physical_address, addr("5.6.7.8:9993"));
        assert_eq!(rec.os_arch, "linux/x86_64");
        assert!(rec.last_seen > 0);
    }

    #[test]
    fn test_missing_address_keeps_previous() {
        let map = LivenessMap::new();
        map.record(nw(1), mem(2), addr("1.2.3.4:9993"), "linux/x86_64");
        map.record(nw(1), mem(2), None, "linux/aarch64");

        let drained = map.swap();
        let rec = &drained[&(nw(1), mem(2))];
        assert_eq!(rec.physical_address, addr("1.2.3.4:9993"));
        assert_eq!(rec.os_arch, "linux/aarch64");
    }

    #[test]
    fn test_swap_leaves_empty_map() {
        let map = LivenessMap::new();
        map.record(nw(1), mem(1), None, "unknown/unknown");
        map.record(nw(1), mem(2), None, "unknown/unknown");
        map.record(nw(2), mem(1), None, "unknown/unknown");

        let drained = map.swap();
        assert_eq!(drained.len(), 3);
        assert!(map.is_empty());

        // Reports after the swap land in the fresh map.
        map.record(nw(3), mem(3), None, "unknown/unknown");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_distinct_pairs_stay_distinct() {
        let map = LivenessMap::new();
        map.record(nw(1), mem(1), None, "a/b");
        map.record(nw(1), mem(2), None, "a/b");
        map.record(nw(2), mem(1), None, "a/b");
        assert_eq!(map.len(), 3);
    }
}

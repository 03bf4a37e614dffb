//! Master registry — tracks peer master servers heard on the fabric.
//!
//! AnnounceMaster datagrams upsert entries; a periodic sweep removes peers
//! not heard within the max age.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// A peer master server, as seen from one of our UDP listeners.
#[derive(Debug, Clone)]
pub struct MasterEntry {
    /// Address the announcement came from. Link-local addresses carry
    /// their scope id, so replies go out the right interface.
    pub addr: SocketAddr,
    /// Name of the interface the announcement was heard on.
    pub iface: String,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

/// The master table — shared between the UDP listeners and the sync tasks.
pub type MasterTable = Arc<DashMap<SocketAddr, MasterEntry>>;

pub fn new_master_table() -> MasterTable {
    Arc::new(DashMap::new())
}

/// Record an announcement from `addr`, creating or refreshing its entry.
pub fn observe(table: &MasterTable, addr: SocketAddr, iface: &str) {
    let now = Instant::now();
    let mut new = false;
    table
        .entry(addr)
        .and_modify(|m| m.last_seen = now)
        .or_insert_with(|| {
            new = true;
            MasterEntry {
                addr,
                iface: iface.to_string(),
                first_seen: now,
                last_seen: now,
            }
        });
    if new {
        tracing::info!(%addr, iface, "new master");
    }
}

/// Pick the master to talk to: the most recently heard one wins.
pub fn preferred(table: &MasterTable) -> Option<MasterEntry> {
    table
        .iter()
        .max_by_key(|e| e.last_seen)
        .map(|e| e.value().clone())
}

/// Remove entries not refreshed within `max_age`.
pub fn purge_aged(table: &MasterTable, max_age: Duration) {
    table.retain(|addr, m| {
        let keep = m.last_seen.elapsed() < max_age;
        if !keep {
            tracing::info!(%addr, "master seems to be gone, removing");
        }
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("[fe80::1]:{port}").parse().unwrap()
    }

    #[test]
    fn observe_and_prefer_most_recent() {
        let table = new_master_table();
        observe(&table, addr(1), "mesh0");
        std::thread::sleep(Duration::from_millis(5));
        observe(&table, addr(2), "mesh0");
        assert_eq!(preferred(&table).unwrap().addr, addr(2));

        // hearing the first one again makes it preferred
        std::thread::sleep(Duration::from_millis(5));
        observe(&table, addr(1), "mesh0");
        assert_eq!(preferred(&table).unwrap().addr, addr(1));
    }

    #[test]
    fn observe_keeps_first_seen() {
        let table = new_master_table();
        observe(&table, addr(1), "mesh0");
        let first = table.get(&addr(1)).unwrap().first_seen;
        std::thread::sleep(Duration::from_millis(5));
        observe(&table, addr(1), "mesh0");
        let entry = table.get(&addr(1)).unwrap();
        assert_eq!(entry.first_seen, first);
        assert!(entry.last_seen > first);
    }

    #[test]
    fn purge_removes_stale_entries() {
        let table = new_master_table();
        observe(&table, addr(1), "mesh0");
        std::thread::sleep(Duration::from_millis(10));
        observe(&table, addr(2), "mesh0");
        purge_aged(&table, Duration::from_millis(8));
        assert!(!table.contains_key(&addr(1)));
        assert!(table.contains_key(&addr(2)));
    }

    #[test]
    fn empty_table_has_no_preferred_master() {
        let table = new_master_table();
        assert!(preferred(&table).is_none());
    }
}

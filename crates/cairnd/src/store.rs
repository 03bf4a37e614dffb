//! In-memory content store of the daemon.
//!
//! Records are keyed by (origin, payload type). Every put refreshes the
//! entry's invalidation deadline; a periodic sweep removes entries past it.
//! The `is_local` flag latches — once a record was pushed by a local
//! client, syncing the same record in from a master never clears it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use cairn_core::wire::{Data, PACKETTYPE_ALL};
use cairn_core::HardwareAddr;

struct StoreEntry {
    invalid_after: Instant,
    local: bool,
    data: Data,
}

/// The daemon's record store. Cheap to clone.
#[derive(Clone)]
pub struct ContentStore {
    entries: Arc<DashMap<(HardwareAddr, u8), StoreEntry>>,
    ttl: Duration,
    updates: broadcast::Sender<Data>,
}

impl ContentStore {
    pub fn new(ttl: Duration) -> ContentStore {
        let (updates, _) = broadcast::channel(64);
        ContentStore {
            entries: Arc::new(DashMap::new()),
            ttl,
            updates,
        }
    }

    /// Insert or refresh a record. Publishes the record on the update
    /// topic when its payload actually changed.
    pub fn put(&self, data: Data, is_local: bool) {
        let key = (data.source, data.header.kind);
        let mut changed = true;
        self.entries
            .entry(key)
            .and_modify(|e| {
                changed = e.data != data;
                e.invalid_after = Instant::now() + self.ttl;
                // false -> true only, never back
                e.local |= is_local;
                e.data = data.clone();
            })
            .or_insert_with(|| StoreEntry {
                invalid_after: Instant::now() + self.ttl,
                local: is_local,
                data: data.clone(),
            });
        if changed {
            // nobody listening is fine
            let _ = self.updates.send(data);
        }
    }

    /// Stream matching records into `out`. `PACKETTYPE_ALL` matches every
    /// type. Blocks on the channel bound, so a stalled consumer slows the
    /// producer instead of ballooning memory.
    pub async fn send_all(&self, type_filter: u8, local_only: bool, out: mpsc::Sender<Data>) {
        let matching: Vec<Data> = self
            .entries
            .iter()
            .filter(|e| type_filter == PACKETTYPE_ALL || e.data.header.kind == type_filter)
            .filter(|e| !local_only || e.local)
            .map(|e| e.data.clone())
            .collect();
        for data in matching {
            if out.send(data).await.is_err() {
                return;
            }
        }
        // channel closes when `out` drops here
    }

    /// Remove entries past their deadline. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.invalid_after > now);
        before - self.entries.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Data> {
        self.updates.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn is_local(&self, source: HardwareAddr, kind: u8) -> Option<bool> {
        self.entries.get(&(source, kind)).map(|e| e.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(source: [u8; 6], kind: u8, payload: &[u8]) -> Data {
        Data::new(
            HardwareAddr(source),
            kind,
            0,
            Bytes::copy_from_slice(payload),
        )
    }

    async fn collect_all(store: &ContentStore, filter: u8, local_only: bool) -> Vec<Data> {
        let (tx, mut rx) = mpsc::channel(100);
        store.send_all(filter, local_only, tx).await;
        let mut out = Vec::new();
        while let Some(d) = rx.recv().await {
            out.push(d);
        }
        out
    }

    #[tokio::test]
    async fn put_and_filter() {
        let store = ContentStore::new(Duration::from_secs(60));
        store.put(record([1; 6], 158, b"a"), true);
        store.put(record([2; 6], 158, b"b"), false);
        store.put(record([1; 6], 159, b"c"), false);

        assert_eq!(collect_all(&store, PACKETTYPE_ALL, false).await.len(), 3);
        assert_eq!(collect_all(&store, 158, false).await.len(), 2);
        assert_eq!(collect_all(&store, PACKETTYPE_ALL, true).await.len(), 1);
    }

    #[tokio::test]
    async fn newer_record_overwrites() {
        let store = ContentStore::new(Duration::from_secs(60));
        store.put(record([1; 6], 158, b"old"), false);
        store.put(record([1; 6], 158, b"new"), false);
        let all = collect_all(&store, 158, false).await;
        assert_eq!(all.len(), 1);
        assert_eq!(&all[0].payload[..], b"new");
    }

    #[tokio::test]
    async fn local_flag_latches() {
        let store = ContentStore::new(Duration::from_secs(60));
        let source = HardwareAddr([1; 6]);
        store.put(record([1; 6], 158, b"a"), false);
        assert_eq!(store.is_local(source, 158), Some(false));
        store.put(record([1; 6], 158, b"a"), true);
        assert_eq!(store.is_local(source, 158), Some(true));
        store.put(record([1; 6], 158, b"b"), false);
        assert_eq!(store.is_local(source, 158), Some(true));
    }

    #[tokio::test]
    async fn update_topic_fires_only_on_change() {
        let store = ContentStore::new(Duration::from_secs(60));
        let mut updates = store.subscribe();
        store.put(record([1; 6], 158, b"a"), false);
        assert_eq!(&updates.recv().await.unwrap().payload[..], b"a");
        // same payload again: TTL refresh, no notification
        store.put(record([1; 6], 158, b"a"), false);
        store.put(record([1; 6], 158, b"b"), false);
        assert_eq!(&updates.recv().await.unwrap().payload[..], b"b");
    }

    #[tokio::test]
    async fn purge_drops_expired_entries() {
        let store = ContentStore::new(Duration::from_millis(20));
        store.put(record([1; 6], 158, b"a"), false);
        assert_eq!(store.purge_expired(), 0);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }
}

//! Transactional bucket store.
//!
//! Values are opaque byte strings prefixed by fixed-size metadata
//! (created / updated / invalid-after); typed decoding is the consumer's
//! business and happens lazily. The concrete engine is abstracted behind
//! read/write transactions over ordered buckets; the in-memory engine
//! shipped here keeps each bucket in a BTreeMap under one store-wide
//! lock. Writes publish notifications on the store's event topic after
//! the transaction commits, purges publish one notification per removed
//! key.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("item not found")]
    NotFound,

    #[error("stored value is corrupt: {0}")]
    Corrupt(&'static str),

    #[error("cannot decode stored record: {0}")]
    Decode(#[from] serde_json::Error),
}

// ── Buckets ───────────────────────────────────────────────────────────────────

/// Identity of a bucket inside a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Bucket {
    NodeInfo,
    Statistics,
    VisData,
    /// Alias map: interface MAC -> canonical node MAC.
    NodeId,
    /// Flags keyed by canonical MAC of nodes recently seen as gateways.
    Gateways,
    /// Mesh-wide client count samples.
    MeshClients,
    /// Mesh-wide node count samples.
    MeshNodes,
    /// Per-node wifi client samples, named by the node's MAC string.
    NodeClients(String),
}

impl Bucket {
    pub fn name(&self) -> String {
        match self {
            Bucket::NodeInfo => "NodeInfo".into(),
            Bucket::Statistics => "Statistics".into(),
            Bucket::VisData => "VisData".into(),
            Bucket::NodeId => "NodeID".into(),
            Bucket::Gateways => "Gateways".into(),
            Bucket::MeshClients => "MeshClients".into(),
            Bucket::MeshNodes => "MeshNodes".into(),
            Bucket::NodeClients(mac) => mac.clone(),
        }
    }
}

// ── Metadata ──────────────────────────────────────────────────────────────────

/// Timestamp in unix milliseconds. Zero means "never"/unset.
pub type Stamp = i64;

/// Metadata stored in front of every bucket value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// First insert of this key in this bucket.
    pub created: Stamp,
    /// Last overwrite. Monotonic; imports never move it backwards.
    pub updated: Stamp,
    /// Purge deadline. Zero = persistent, never purged.
    pub invalid: Stamp,
}

const META_SIZE: usize = 24;

pub fn now_stamp() -> Stamp {
    chrono::Utc::now().timestamp_millis()
}

impl Meta {
    pub fn is_valid_at(&self, now: Stamp) -> bool {
        self.invalid == 0 || now < self.invalid
    }

    fn encode(&self, content: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(META_SIZE + content.len());
        out.extend_from_slice(&self.created.to_be_bytes());
        out.extend_from_slice(&self.updated.to_be_bytes());
        out.extend_from_slice(&self.invalid.to_be_bytes());
        out.extend_from_slice(content);
        out
    }

    fn decode(raw: &[u8]) -> Result<(Meta, &[u8]), StoreError> {
        if raw.len() < META_SIZE {
            return Err(StoreError::Corrupt("value shorter than metadata"));
        }
        let stamp = |range: std::ops::Range<usize>| {
            i64::from_be_bytes(raw[range].try_into().expect("eight bytes"))
        };
        Ok((
            Meta {
                created: stamp(0..8),
                updated: stamp(8..16),
                invalid: stamp(16..24),
            },
            &raw[META_SIZE..],
        ))
    }
}

// ── Notifications ─────────────────────────────────────────────────────────────

/// Event published on a store's topic. Subscribers own a bounded queue
/// and must drain it; slow subscribers lose the oldest events rather
/// than blocking publishers.
#[derive(Debug, Clone)]
pub enum Notification {
    Update { bucket: Bucket, key: Vec<u8> },
    Purge { bucket: Bucket, key: Vec<u8> },
    Quit,
}

// ── The store ─────────────────────────────────────────────────────────────────

type Buckets = HashMap<Bucket, BTreeMap<Vec<u8>, Vec<u8>>>;

/// One bucket store instance. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    buckets: Arc<RwLock<Buckets>>,
    events: broadcast::Sender<Notification>,
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

impl Db {
    pub fn new() -> Db {
        let (events, _) = broadcast::channel(256);
        Db {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    pub fn notify(&self, n: Notification) {
        let _ = self.events.send(n);
    }

    /// Broadcast the quit event to every subscriber.
    pub fn close(&self) {
        self.notify(Notification::Quit);
    }

    /// Run a read transaction.
    pub fn view<R>(&self, f: impl FnOnce(&ReadTx<'_>) -> R) -> R {
        let guard = self.buckets.read();
        f(&ReadTx { buckets: &guard })
    }

    /// Run a write transaction. Notifications queued by the transaction
    /// are published after the write lock is released.
    pub fn update<R>(&self, f: impl FnOnce(&mut WriteTx<'_>) -> R) -> R {
        let mut pending = Vec::new();
        let result = {
            let mut guard = self.buckets.write();
            let mut tx = WriteTx {
                buckets: &mut guard,
                pending: &mut pending,
            };
            f(&mut tx)
        };
        for n in pending {
            let _ = self.events.send(n);
        }
        result
    }

    /// Spawn a task that periodically deletes entries past their
    /// invalidation deadline, publishing a purge notification per key.
    pub fn spawn_purger(&self, bucket: Bucket, interval: Duration) {
        let db = self.clone();
        let mut quit = self.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    event = quit.recv() => {
                        match event {
                            Ok(Notification::Quit) | Err(broadcast::error::RecvError::Closed) => return,
                            _ => continue,
                        }
                    }
                    _ = ticker.tick() => {
                        let purged = db.purge_expired(&bucket);
                        if purged > 0 {
                            tracing::debug!(bucket = %bucket.name(), purged, "purged expired entries");
                        }
                    }
                }
            }
        });
    }

    /// One purge pass over `bucket`. Returns the number of removed keys.
    pub fn purge_expired(&self, bucket: &Bucket) -> usize {
        let now = now_stamp();
        self.update(|tx| {
            let mut expired = Vec::new();
            tx.for_each(bucket, |key, meta, _| {
                if !meta.is_valid_at(now) {
                    expired.push(key.to_vec());
                }
                true
            });
            for key in &expired {
                tx.delete(bucket, key);
                tx.pending.push(Notification::Purge {
                    bucket: bucket.clone(),
                    key: key.clone(),
                });
            }
            expired.len()
        })
    }
}

// ── Transactions ──────────────────────────────────────────────────────────────

pub struct ReadTx<'a> {
    buckets: &'a Buckets,
}

impl ReadTx<'_> {
    pub fn get(&self, bucket: &Bucket, key: &[u8]) -> Option<(Meta, Vec<u8>)> {
        let raw = self.buckets.get(bucket)?.get(key)?;
        let (meta, content) = Meta::decode(raw).ok()?;
        Some((meta, content.to_vec()))
    }

    pub fn exists(&self, bucket: &Bucket, key: &[u8]) -> bool {
        self.buckets
            .get(bucket)
            .is_some_and(|b| b.contains_key(key))
    }

    /// Forward cursor over a bucket. The callback returns false to stop.
    /// Values that fail metadata decoding are skipped.
    pub fn for_each(&self, bucket: &Bucket, mut f: impl FnMut(&[u8], Meta, &[u8]) -> bool) {
        let Some(b) = self.buckets.get(bucket) else {
            return;
        };
        for (key, raw) in b.iter() {
            let Ok((meta, content)) = Meta::decode(raw) else {
                continue;
            };
            if !f(key, meta, content) {
                return;
            }
        }
    }

    /// Like `for_each`, from the last key to the first.
    pub fn for_each_reverse(&self, bucket: &Bucket, mut f: impl FnMut(&[u8], Meta, &[u8]) -> bool) {
        let Some(b) = self.buckets.get(bucket) else {
            return;
        };
        for (key, raw) in b.iter().rev() {
            let Ok((meta, content)) = Meta::decode(raw) else {
                continue;
            };
            if !f(key, meta, content) {
                return;
            }
        }
    }

    /// Names of the per-node sample buckets in this store.
    pub fn node_bucket_names(&self) -> Vec<String> {
        self.buckets
            .keys()
            .filter_map(|b| match b {
                Bucket::NodeClients(mac) => Some(mac.clone()),
                _ => None,
            })
            .collect()
    }
}

pub struct WriteTx<'a> {
    buckets: &'a mut Buckets,
    pending: &'a mut Vec<Notification>,
}

impl WriteTx<'_> {
    pub fn get(&self, bucket: &Bucket, key: &[u8]) -> Option<(Meta, Vec<u8>)> {
        let raw = self.buckets.get(bucket)?.get(key)?;
        let (meta, content) = Meta::decode(raw).ok()?;
        Some((meta, content.to_vec()))
    }

    pub fn exists(&self, bucket: &Bucket, key: &[u8]) -> bool {
        self.buckets
            .get(bucket)
            .is_some_and(|b| b.contains_key(key))
    }

    pub fn for_each(&self, bucket: &Bucket, mut f: impl FnMut(&[u8], Meta, &[u8]) -> bool) {
        let Some(b) = self.buckets.get(bucket) else {
            return;
        };
        for (key, raw) in b.iter() {
            let Ok((meta, content)) = Meta::decode(raw) else {
                continue;
            };
            if !f(key, meta, content) {
                return;
            }
        }
    }

    pub fn for_each_reverse(&self, bucket: &Bucket, mut f: impl FnMut(&[u8], Meta, &[u8]) -> bool) {
        let Some(b) = self.buckets.get(bucket) else {
            return;
        };
        for (key, raw) in b.iter().rev() {
            let Ok((meta, content)) = Meta::decode(raw) else {
                continue;
            };
            if !f(key, meta, content) {
                return;
            }
        }
    }

    /// Insert or overwrite, updating metadata: `created` is preserved from
    /// an existing entry, `updated` is set to now, `invalid` to now + ttl
    /// (or never, for persistent entries). Publishes an update
    /// notification after commit.
    pub fn put(&mut self, bucket: &Bucket, key: &[u8], content: &[u8], ttl: Option<Duration>) {
        let now = now_stamp();
        let created = self
            .get(bucket, key)
            .map(|(m, _)| m.created)
            .filter(|&c| c != 0)
            .unwrap_or(now);
        let meta = Meta {
            created,
            updated: now,
            invalid: ttl.map(|t| now + t.as_millis() as i64).unwrap_or(0),
        };
        self.put_with_meta(bucket, key, content, meta);
    }

    /// Insert with trusted metadata (import path). `created` still never
    /// moves forward past an existing entry's, and `updated` never moves
    /// backwards.
    pub fn put_with_meta(&mut self, bucket: &Bucket, key: &[u8], content: &[u8], mut meta: Meta) {
        if let Some((old, _)) = self.get(bucket, key) {
            if old.created != 0 && (meta.created == 0 || old.created < meta.created) {
                meta.created = old.created;
            }
            if old.updated > meta.updated {
                meta.updated = old.updated;
            }
        }
        if meta.created == 0 {
            meta.created = meta.updated;
        }
        self.buckets
            .entry(bucket.clone())
            .or_default()
            .insert(key.to_vec(), meta.encode(content));
        self.pending.push(Notification::Update {
            bucket: bucket.clone(),
            key: key.to_vec(),
        });
    }

    /// Remove a key. No notification; purge sweeps publish their own.
    pub fn delete(&mut self, bucket: &Bucket, key: &[u8]) -> bool {
        self.buckets
            .get_mut(bucket)
            .and_then(|b| b.remove(key))
            .is_some()
    }
}

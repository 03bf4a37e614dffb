//! The mesh-node database facade.
//!
//! Ties together the two bucket stores ("main" for mesh data, "logs" for
//! time series), the alias map, the gateway flags, and the export caches.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use cairn_core::HardwareAddr;

use crate::export::cache::Cache;
use crate::items::{NodeInfoItem, StatisticsItem, VisDataItem};
use crate::store::{Bucket, Db, Meta, Notification, ReadTx, StoreError, WriteTx};
use crate::vis::VisV1;

/// Tunables of the database.
#[derive(Debug, Clone)]
pub struct Settings {
    /// A node counts as offline once nothing was heard for this long.
    pub offline_after: Duration,
    /// Lifetime of NodeInfo/Statistics records.
    pub node_purge: Duration,
    pub node_purge_interval: Duration,
    /// Lifetime of vis records, the alias map, and the gateway flags.
    pub vis_purge: Duration,
    pub vis_purge_interval: Duration,
}

/// Byte-buffer caches for the export documents. Invalidation is driven
/// by store notifications; each buffer is rebuilt on the next access.
#[derive(Default)]
pub struct ExportCaches {
    pub nodes: Cache,
    pub nodes_old: Cache,
    pub graph: Cache,
    pub nodeinfo: Cache,
    pub statistics: Cache,
    pub visdata: Cache,
    pub aliases: Cache,
}

pub struct NodeDb {
    pub main: Db,
    pub logs: Db,
    pub settings: Settings,
    pub caches: ExportCaches,
}

impl NodeDb {
    /// Build the database and start its maintenance tasks (bucket
    /// purgers and the cache invalidator).
    pub fn new(settings: Settings) -> Arc<NodeDb> {
        let db = Arc::new(NodeDb {
            main: Db::new(),
            logs: Db::new(),
            settings,
            caches: ExportCaches::default(),
        });

        db.main
            .spawn_purger(Bucket::NodeInfo, db.settings.node_purge_interval);
        db.main
            .spawn_purger(Bucket::Statistics, db.settings.node_purge_interval);
        db.main
            .spawn_purger(Bucket::Gateways, db.settings.node_purge_interval);
        db.main
            .spawn_purger(Bucket::VisData, db.settings.vis_purge_interval);
        db.main
            .spawn_purger(Bucket::NodeId, db.settings.vis_purge_interval);
        db.clone().spawn_cache_invalidator();
        db
    }

    /// Shut down maintenance tasks and subscribers.
    pub fn close(&self) {
        self.main.close();
        self.logs.close();
    }

    // ── Update paths ─────────────────────────────────────────────────────────

    /// Store a NodeInfo record. Imports from a trusted source may carry
    /// preset metadata and may be persistent (no invalidation).
    pub fn update_node_info(&self, item: &NodeInfoItem, persistent: bool, preset: Option<Meta>) {
        let ttl = (!persistent).then_some(self.settings.node_purge);
        self.main.update(|tx| {
            match preset {
                Some(mut meta) => {
                    if let Some(ttl) = ttl {
                        meta.invalid = meta.updated + ttl.as_millis() as i64;
                    }
                    tx.put_with_meta(&Bucket::NodeInfo, &item.key(), &item.to_bytes(), meta);
                }
                None => tx.put(&Bucket::NodeInfo, &item.key(), &item.to_bytes(), ttl),
            }
        });
    }

    /// Store a Statistics record. A reported gateway gets flagged under
    /// its canonical address with the (short) vis lifetime.
    pub fn update_statistics(&self, item: &StatisticsItem) {
        self.main.update(|tx| {
            tx.put(
                &Bucket::Statistics,
                &item.key(),
                &item.to_bytes(),
                Some(self.settings.node_purge),
            );
            if let Some(gateway) = item.data.gateway {
                let canonical = resolve_alias_in(tx, gateway);
                tx.put(
                    &Bucket::Gateways,
                    canonical.as_bytes(),
                    &[],
                    Some(self.settings.vis_purge),
                );
            }
        });
    }

    /// Store a vis record and repopulate the alias map: the record's
    /// source and every interface MAC point at the canonical (first
    /// interface) address, with the vis lifetime.
    pub fn update_vis(&self, vis: &VisV1) {
        let item = VisDataItem { vis: vis.clone() };
        let canonical = vis.canonical();
        self.main.update(|tx| {
            tx.put(
                &Bucket::VisData,
                &item.key(),
                &item.to_bytes(),
                Some(self.settings.vis_purge),
            );
            tx.put(
                &Bucket::NodeId,
                vis.mac.as_bytes(),
                canonical.as_bytes(),
                Some(self.settings.vis_purge),
            );
            for iface in &vis.ifaces {
                tx.put(
                    &Bucket::NodeId,
                    iface.as_bytes(),
                    canonical.as_bytes(),
                    Some(self.settings.vis_purge),
                );
            }
        });
    }

    // ── Lookups ──────────────────────────────────────────────────────────────

    /// Resolve an interface MAC to its node's canonical address.
    /// Unknown addresses resolve to themselves.
    pub fn resolve_alias(&self, addr: HardwareAddr) -> HardwareAddr {
        self.main.view(|tx| resolve_alias_read(tx, addr))
    }

    /// True when the (canonical) address was recently reported as a
    /// gateway by any statistics record.
    pub fn is_gateway(&self, canonical: HardwareAddr) -> bool {
        self.main
            .view(|tx| tx.exists(&Bucket::Gateways, canonical.as_bytes()))
    }

    // ── Import ───────────────────────────────────────────────────────────────

    /// Read a version-1 nodes.json document into the database, taking
    /// first/last-seen stamps from the file.
    pub fn import_nodes(&self, reader: impl Read, persistent: bool) -> Result<usize, StoreError> {
        crate::export::nodes::import_nodes(self, reader, persistent)
    }

    // ── Cache invalidation ───────────────────────────────────────────────────

    fn spawn_cache_invalidator(self: Arc<Self>) {
        let mut events = self.main.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(e) => e,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // missed events: assume everything is stale
                        self.caches.invalidate_all();
                        continue;
                    }
                    Err(_) => return,
                };
                let bucket = match &event {
                    Notification::Update { bucket, .. } | Notification::Purge { bucket, .. } => {
                        bucket
                    }
                    Notification::Quit => return,
                };
                match bucket {
                    Bucket::NodeInfo => {
                        self.caches.nodeinfo.invalidate();
                        self.caches.nodes.invalidate();
                        self.caches.nodes_old.invalidate();
                    }
                    Bucket::Statistics => {
                        self.caches.statistics.invalidate();
                        self.caches.nodes.invalidate();
                        self.caches.nodes_old.invalidate();
                    }
                    Bucket::VisData => {
                        self.caches.visdata.invalidate();
                        self.caches.graph.invalidate();
                        self.caches.nodes.invalidate();
                        self.caches.nodes_old.invalidate();
                    }
                    Bucket::NodeId => {
                        self.caches.aliases.invalidate();
                        self.caches.graph.invalidate();
                    }
                    Bucket::Gateways => {
                        self.caches.nodes.invalidate();
                        self.caches.nodes_old.invalidate();
                        self.caches.graph.invalidate();
                    }
                    _ => {}
                }
            }
        });
    }
}

impl ExportCaches {
    pub fn invalidate_all(&self) {
        self.nodes.invalidate();
        self.nodes_old.invalidate();
        self.graph.invalidate();
        self.nodeinfo.invalidate();
        self.statistics.invalidate();
        self.visdata.invalidate();
        self.aliases.invalidate();
    }
}

pub(crate) fn resolve_alias_read(tx: &ReadTx<'_>, addr: HardwareAddr) -> HardwareAddr {
    tx.get(&Bucket::NodeId, addr.as_bytes())
        .and_then(|(_, canonical)| HardwareAddr::from_bytes(&canonical))
        .unwrap_or(addr)
}

pub(crate) fn resolve_alias_in(tx: &WriteTx<'_>, addr: HardwareAddr) -> HardwareAddr {
    tx.get(&Bucket::NodeId, addr.as_bytes())
        .and_then(|(_, canonical)| HardwareAddr::from_bytes(&canonical))
        .unwrap_or(addr)
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        offline_after: Duration::from_secs(300),
        node_purge: Duration::from_secs(3600),
        node_purge_interval: Duration::from_secs(3600),
        vis_purge: Duration::from_secs(300),
        vis_purge_interval: Duration::from_secs(300),
    }
}

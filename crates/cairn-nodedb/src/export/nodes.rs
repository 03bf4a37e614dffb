//! The nodes.json document: one entry per mesh node, keyed by node id.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cairn_core::HardwareAddr;

use super::JsonTime;
use crate::items::{NodeInfoItem, StatisticsItem};
use crate::nodedb::{resolve_alias_read, NodeDb};
use crate::store::{now_stamp, Bucket, Meta, ReadTx, Stamp, StoreError};

#[derive(Debug, Serialize, Deserialize)]
pub struct NodesJson {
    pub timestamp: JsonTime,
    pub nodes: BTreeMap<String, NodesJsonData>,
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodesJsonData {
    pub nodeinfo: crate::gluon::NodeInfoData,
    #[serde(default)]
    pub flags: NodesJsonFlags,
    pub firstseen: JsonTime,
    pub lastseen: JsonTime,
    #[serde(default)]
    pub statistics: NodesJsonStatistics,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NodesJsonFlags {
    pub online: bool,
    #[serde(default)]
    pub gateway: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NodesJsonStatistics {
    #[serde(default)]
    pub clients: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<HardwareAddr>,
    #[serde(default)]
    pub uptime: f64,
    #[serde(default)]
    pub loadavg: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub rootfs_usage: f64,
}

/// Generate (or fetch from cache) the nodes.json bytes.
pub fn generate_nodes(db: &NodeDb) -> Arc<Vec<u8>> {
    db.caches.nodes.get(|| {
        let doc = build_nodes(db);
        serde_json::to_vec(&doc).unwrap_or_default()
    })
}

/// Build the nodes.json document without touching the cache.
pub fn build_nodes(db: &NodeDb) -> NodesJson {
    let now = now_stamp();
    let offline_after = db.settings.offline_after.as_millis() as i64;
    let mut nodes = BTreeMap::new();

    db.main.view(|tx| {
        tx.for_each(&Bucket::NodeInfo, |key, meta, content| {
            let item = match NodeInfoItem::from_bytes(content) {
                Ok(i) => i,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot generate node info entry, skipping");
                    return true;
                }
            };
            let Some(node_id) = item.data.node_id else {
                tracing::debug!(source = %item.source, "node info without node id, skipping");
                return true;
            };
            let data = node_entry(tx, key, meta, item, now, offline_after);
            nodes.insert(node_id.to_string(), data);
            true
        });
    });

    NodesJson {
        timestamp: JsonTime(now),
        nodes,
        version: 1,
    }
}

fn node_entry(
    tx: &ReadTx<'_>,
    key: &[u8],
    meta: Meta,
    item: NodeInfoItem,
    now: Stamp,
    offline_after: Stamp,
) -> NodesJsonData {
    // earliest stamp across the node's records is "first seen",
    // the latest is "last seen"
    let mut firstseen = meta.created;
    let mut lastseen = meta.updated;
    let mut statistics = NodesJsonStatistics::default();

    if let Some((smeta, content)) = tx.get(&Bucket::Statistics, key) {
        if smeta.created < firstseen {
            firstseen = smeta.created;
        }
        if smeta.updated > lastseen {
            lastseen = smeta.updated;
        }
        if let Ok(stats) = StatisticsItem::from_bytes(&content) {
            let data = stats.data;
            if let Some(memory) = data.memory {
                // a bit simple-minded, but compatible with the
                // established map backends
                statistics.memory_usage = if memory.total != 0 {
                    1.0 - (memory.free as f64 / memory.total as f64)
                } else {
                    1.0
                };
            }
            statistics.uptime = data.uptime;
            if let Some(clients) = data.clients {
                statistics.clients = clients.total;
            }
            statistics.gateway = data.gateway;
            statistics.loadavg = data.loadavg;
            statistics.rootfs_usage = data.rootfs_usage;
        }
    }

    if let Some((vmeta, _)) = tx.get(&Bucket::VisData, key) {
        if vmeta.created < firstseen {
            firstseen = vmeta.created;
        }
        if vmeta.updated > lastseen {
            lastseen = vmeta.updated;
        }
    }

    let canonical = resolve_alias_read(
        tx,
        HardwareAddr::from_bytes(key).unwrap_or(item.source),
    );
    let gateway = tx.exists(&Bucket::Gateways, canonical.as_bytes());

    NodesJsonData {
        nodeinfo: item.data,
        flags: NodesJsonFlags {
            online: now - lastseen < offline_after,
            gateway,
        },
        firstseen: JsonTime(firstseen),
        lastseen: JsonTime(lastseen),
        statistics,
    }
}

/// Read a version-1 nodes.json document into the database. First/last
/// seen stamps come from the file; `persistent` disables invalidation.
pub fn import_nodes(
    db: &NodeDb,
    reader: impl Read,
    persistent: bool,
) -> Result<usize, StoreError> {
    let doc: NodesJson = serde_json::from_reader(reader)?;
    if doc.version != 1 {
        return Err(StoreError::Corrupt("unknown nodes.json version"));
    }
    let mut imported = 0;
    for (id, node) in doc.nodes {
        let Some(source) = node.nodeinfo.node_id else {
            tracing::warn!(%id, "import: node without node id, skipping");
            continue;
        };
        let item = NodeInfoItem {
            source,
            data: node.nodeinfo,
        };
        db.update_node_info(
            &item,
            persistent,
            Some(Meta {
                created: node.firstseen.0,
                updated: node.lastseen.0,
                invalid: 0,
            }),
        );
        imported += 1;
    }
    Ok(imported)
}

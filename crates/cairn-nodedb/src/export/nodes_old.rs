//! The legacy nodes.json layout: a flat node list with numeric link
//! references and stringly link qualities. Kept for the older map
//! frontends.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cairn_core::HardwareAddr;

use super::JsonTime;
use crate::items::{NodeInfoItem, StatisticsItem, VisDataItem};
use crate::nodedb::{resolve_alias_read, NodeDb};
use crate::store::{now_stamp, Bucket, ReadTx};

#[derive(Debug, Serialize, Deserialize)]
pub struct NodesOldJson {
    pub meta: NodesOldJsonMeta,
    pub nodes: Vec<NodesOldJsonData>,
    pub links: Vec<NodesOldJsonLink>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodesOldJsonMeta {
    pub timestamp: JsonTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gluon_release: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NodesOldJsonData {
    pub id: Option<HardwareAddr>,
    pub name: Option<String>,
    pub lastseen: i64,
    pub uptime: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<[f64; 2]>,
    pub clientcount: i64,
    pub batman_version: Option<String>,
    pub batman_gwmode: Option<String>,
    pub group: Option<String>,
    pub flags: NodesOldJsonFlags,
    pub autoupdater_state: bool,
    pub autoupdater_branch: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub hardware: String,
    pub firmware: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub gluon_base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<HardwareAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<IpAddr>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NodesOldJsonFlags {
    pub online: bool,
    pub gateway: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodesOldJsonLink {
    pub id: String,
    pub source: usize,
    pub quality: String,
    pub target: usize,
    #[serde(rename = "type")]
    pub link_type: Option<String>,
}

/// Generate (or fetch from cache) the legacy nodes.json bytes.
pub fn generate_nodes_old(db: &NodeDb) -> Arc<Vec<u8>> {
    db.caches.nodes_old.get(|| {
        let doc = build_nodes_old(db);
        serde_json::to_vec(&doc).unwrap_or_default()
    })
}

/// Build the legacy document without touching the cache.
pub fn build_nodes_old(db: &NodeDb) -> NodesOldJson {
    let now = now_stamp();
    let offline_after = db.settings.offline_after.as_millis() as i64;
    let mut nodes: Vec<NodesOldJsonData> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();

    db.main.view(|tx| {
        tx.for_each(&Bucket::NodeInfo, |key, meta, content| {
            let Ok(item) = NodeInfoItem::from_bytes(content) else {
                return true;
            };
            let mac = resolve_alias_read(
                tx,
                HardwareAddr::from_bytes(key).unwrap_or(item.source),
            );
            let data = old_entry(tx, key, meta.updated, mac, item, now, offline_after);
            index.insert(mac.to_string(), nodes.len());
            nodes.push(data);
            true
        });

        // second pass: links from the vis neighbor tables
        let mut links: BTreeMap<usize, BTreeMap<usize, NodesOldJsonLink>> = BTreeMap::new();
        tx.for_each(&Bucket::VisData, |_, _, content| {
            let Ok(item) = VisDataItem::from_bytes(content) else {
                return true;
            };
            let vis = item.vis;
            let mac = resolve_alias_read(tx, vis.canonical());
            let Some(&source) = index.get(&mac.to_string()) else {
                return true;
            };
            for entry in &vis.entries {
                if entry.qual == 0 {
                    continue;
                }
                let emac = resolve_alias_read(tx, entry.mac);
                let Some(&target) = index.get(&emac.to_string()) else {
                    continue;
                };
                let quality = 255.0 / entry.qual as f64;
                // a link may already exist in either direction; the
                // second sighting appends its quality to the first
                let slot = if links.get(&target).is_some_and(|m| m.contains_key(&source)) {
                    Some((target, source))
                } else if links.get(&source).is_some_and(|m| m.contains_key(&target)) {
                    Some((source, target))
                } else {
                    None
                };
                match slot {
                    Some((a, b)) => {
                        let link = links
                            .get_mut(&a)
                            .and_then(|m| m.get_mut(&b))
                            .expect("checked above");
                        link.quality = format!("{}, {:.3}", link.quality, quality);
                    }
                    None => {
                        links.entry(source).or_default().insert(
                            target,
                            NodesOldJsonLink {
                                id: format!("{mac}-{emac}"),
                                source,
                                target,
                                quality: format!("{quality:.3}"),
                                link_type: None,
                            },
                        );
                    }
                }
            }
            true
        });

        let linksjs: Vec<NodesOldJsonLink> = links
            .into_values()
            .flat_map(BTreeMap::into_values)
            .collect();

        NodesOldJson {
            meta: NodesOldJsonMeta {
                timestamp: JsonTime(now),
                gluon_release: Some("0.6.3".into()),
            },
            nodes,
            links: linksjs,
        }
    })
}

fn old_entry(
    tx: &ReadTx<'_>,
    key: &[u8],
    nodeinfo_updated: i64,
    mac: HardwareAddr,
    item: NodeInfoItem,
    now: i64,
    offline_after: i64,
) -> NodesOldJsonData {
    let info = item.data;
    let mut data = NodesOldJsonData {
        id: Some(mac),
        name: info.hostname,
        ..Default::default()
    };
    if let Some(location) = info.location {
        data.geo = Some([location.latitude, location.longitude]);
    }
    if let Some(software) = info.software {
        if let Some(firmware) = software.firmware {
            data.firmware = Some(firmware.release);
            data.gluon_base = firmware.base;
        }
        if let Some(batman) = software.batman_adv {
            data.batman_version = Some(batman.version);
        }
        if let Some(autoupdater) = software.autoupdater {
            data.autoupdater_state = autoupdater.enabled;
            data.autoupdater_branch = autoupdater.branch;
        }
    }
    if let Some(hardware) = info.hardware {
        data.hardware = hardware.model;
    }
    if let Some(network) = info.network {
        data.addresses = network.addresses;
    }

    let mut lastseen = nodeinfo_updated;
    if let Some((smeta, content)) = tx.get(&Bucket::Statistics, key) {
        if smeta.updated > lastseen {
            lastseen = smeta.updated;
        }
        if let Ok(stats) = StatisticsItem::from_bytes(&content) {
            data.uptime = stats.data.uptime;
            if let Some(clients) = stats.data.clients {
                data.clientcount = clients.total;
            }
            if let Some(gateway) = stats.data.gateway {
                data.gateway = Some(resolve_alias_read(tx, gateway));
            }
        }
    }
    if let Some((vmeta, _)) = tx.get(&Bucket::VisData, key) {
        if vmeta.updated > lastseen {
            lastseen = vmeta.updated;
        }
    }

    data.lastseen = JsonTime(lastseen).unix_seconds();
    data.flags.gateway = tx.exists(&Bucket::Gateways, key);
    data.flags.online = now - lastseen < offline_after;
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gluon::{Clients, NodeInfoData, StatisticsData};
    use crate::nodedb::test_settings;
    use crate::vis::{VisEntry, VisV1};

    fn addr(last: u8) -> HardwareAddr {
        HardwareAddr([0x02, 0, 0, 0, 0, last])
    }

    fn put_node(db: &NodeDb, last: u8, hostname: &str) {
        db.update_node_info(
            &NodeInfoItem {
                source: addr(last),
                data: NodeInfoData {
                    node_id: Some(addr(last)),
                    hostname: Some(hostname.into()),
                    ..Default::default()
                },
            },
            false,
            None,
        );
    }

    fn vis(source: u8, neighbors: &[(u8, u8)]) -> VisV1 {
        VisV1 {
            mac: addr(source),
            iface_n: 1,
            entries_n: neighbors.len() as u8,
            ifaces: vec![addr(source)],
            entries: neighbors
                .iter()
                .map(|&(mac, qual)| VisEntry {
                    mac: addr(mac),
                    if_index: 0,
                    qual,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn legacy_document_flattens_nodes_and_links() {
        let db = NodeDb::new(test_settings());
        put_node(&db, 1, "one");
        put_node(&db, 2, "two");
        db.update_statistics(&StatisticsItem {
            source: addr(1),
            data: StatisticsData {
                clients: Some(Clients { wifi: 1, total: 4 }),
                uptime: 42.0,
                ..Default::default()
            },
        });
        db.update_vis(&vis(1, &[(2, 255)]));
        db.update_vis(&vis(2, &[(1, 51)]));

        let doc = build_nodes_old(&db);
        assert_eq!(doc.nodes.len(), 2);
        let one = doc
            .nodes
            .iter()
            .find(|n| n.name.as_deref() == Some("one"))
            .unwrap();
        assert_eq!(one.clientcount, 4);
        assert_eq!(one.uptime, 42.0);
        assert!(one.lastseen > 0);
        assert!(one.flags.online);

        // both directions collapse into one link with both qualities
        assert_eq!(doc.links.len(), 1);
        assert_eq!(doc.links[0].quality, "1.000, 5.000");
    }

    #[tokio::test]
    async fn one_sided_link_has_single_quality() {
        let db = NodeDb::new(test_settings());
        put_node(&db, 1, "one");
        put_node(&db, 2, "two");
        db.update_vis(&vis(1, &[(2, 127)]));
        let doc = build_nodes_old(&db);
        assert_eq!(doc.links.len(), 1);
        assert_eq!(doc.links[0].quality, "2.008");
    }
}

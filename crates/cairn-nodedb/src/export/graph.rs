//! The graph.json document: the mesh link graph for visualization.
//!
//! Nodes are indexed in the order first encountered; links reference
//! them by list position. Especially unfortunate design, but the map
//! frontends depend on it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cairn_core::HardwareAddr;

use crate::items::VisDataItem;
use crate::nodedb::{resolve_alias_read, NodeDb};
use crate::store::Bucket;

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphJson {
    #[serde(default)]
    pub version: u32,
    pub batadv: GraphJsonBatadv,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphJsonBatadv {
    pub directed: bool,
    pub graph: Vec<serde_json::Value>,
    pub nodes: Vec<GraphJsonNode>,
    pub links: Vec<GraphJsonLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphJsonNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<HardwareAddr>,
    pub id: HardwareAddr,
    pub number: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GraphJsonLink {
    pub source: usize,
    pub vpn: bool,
    pub bidirect: bool,
    pub target: usize,
    pub tq: f64,
}

/// Generate (or fetch from cache) the graph.json bytes.
pub fn generate_graph(db: &NodeDb) -> Arc<Vec<u8>> {
    db.caches.graph.get(|| {
        let doc = build_graph(db);
        serde_json::to_vec(&doc).unwrap_or_default()
    })
}

/// Build the graph.json document without touching the cache.
pub fn build_graph(db: &NodeDb) -> GraphJson {
    // node list position by canonical MAC string
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    let mut nodes: Vec<GraphJsonNode> = Vec::new();
    // half-built links indexed by (source MAC, target MAC)
    let mut links: BTreeMap<String, BTreeMap<String, GraphJsonLink>> = BTreeMap::new();

    db.main.view(|tx| {
        tx.for_each(&Bucket::VisData, |_, _, content| {
            let item = match VisDataItem::from_bytes(content) {
                Ok(i) => i,
                // skip unparseable items
                Err(_) => return true,
            };
            let vis = item.vis;
            let mac = resolve_alias_read(tx, vis.canonical());
            let is_gateway = tx.exists(&Bucket::Gateways, mac.as_bytes());
            let mac_str = mac.to_string();

            match index.get(&mac_str) {
                None => {
                    index.insert(mac_str.clone(), nodes.len());
                    nodes.push(GraphJsonNode {
                        id: mac,
                        node_id: Some(mac),
                        number: nodes.len(),
                    });
                }
                Some(&seen) => {
                    // record node_id, since we only get that here
                    nodes[seen].node_id = Some(mac);
                }
            }

            for entry in &vis.entries {
                if entry.qual == 0 {
                    // translation-table entry, no link
                    continue;
                }
                let emac = resolve_alias_read(tx, entry.mac);
                let emac_str = emac.to_string();
                if !index.contains_key(&emac_str) {
                    // linked node has to exist even without own vis data
                    index.insert(emac_str.clone(), nodes.len());
                    nodes.push(GraphJsonNode {
                        id: emac,
                        node_id: None,
                        number: nodes.len(),
                    });
                }

                let tq = 255.0 / entry.qual as f64;

                // cross check: an entry for the reverse direction marks
                // the link bidirectional and averages the quality
                if let Some(reverse) = links.get_mut(&emac_str).and_then(|m| m.get_mut(&mac_str)) {
                    if is_gateway {
                        reverse.vpn = true;
                    }
                    reverse.bidirect = true;
                    reverse.tq = (reverse.tq + tq) / 2.0;
                    continue;
                }

                links.entry(mac_str.clone()).or_default().insert(
                    emac_str,
                    GraphJsonLink {
                        source: 0,
                        target: 0,
                        tq,
                        bidirect: false,
                        vpn: is_gateway,
                    },
                );
            }
            true
        });
    });

    // resolve the endpoint indices now that the node list is final
    let mut linksjs = Vec::new();
    for (source, targets) in links {
        let Some(&source_index) = index.get(&source) else {
            continue;
        };
        for (target, mut link) in targets {
            let Some(&target_index) = index.get(&target) else {
                continue;
            };
            link.source = source_index;
            link.target = target_index;
            linksjs.push(link);
        }
    }

    GraphJson {
        version: 1,
        batadv: GraphJsonBatadv {
            directed: false,
            graph: Vec::new(),
            nodes,
            links: linksjs,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodedb::test_settings;
    use crate::vis::{VisEntry, VisV1};

    fn addr(last: u8) -> HardwareAddr {
        HardwareAddr([0x02, 0, 0, 0, 0, last])
    }

    fn vis(source: u8, ifaces: &[u8], neighbors: &[(u8, u8)]) -> VisV1 {
        VisV1 {
            mac: addr(source),
            iface_n: ifaces.len() as u8,
            entries_n: neighbors.len() as u8,
            ifaces: ifaces.iter().map(|&i| addr(i)).collect(),
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
    async fn bidirectional_links_fold_and_average() {
        let db = NodeDb::new(test_settings());
        // X reports Y with qual 255 (tq 1.0), Y reports X with qual 51 (tq 5.0)
        db.update_vis(&vis(0x01, &[0x01], &[(0x02, 255)]));
        db.update_vis(&vis(0x02, &[0x02], &[(0x01, 51)]));

        let doc = build_graph(&db);
        assert_eq!(doc.batadv.nodes.len(), 2);
        assert_eq!(doc.batadv.links.len(), 1);
        let link = doc.batadv.links[0];
        assert!(link.bidirect);
        assert!((link.tq - 3.0).abs() < 1e-9);
        // endpoint indices point into the node list
        assert_eq!(
            doc.batadv.nodes[link.source].id.to_string(),
            addr(0x01).to_string()
        );
        assert_eq!(
            doc.batadv.nodes[link.target].id.to_string(),
            addr(0x02).to_string()
        );
    }

    #[tokio::test]
    async fn one_sided_link_stays_directed() {
        let db = NodeDb::new(test_settings());
        db.update_vis(&vis(0x01, &[0x01], &[(0x02, 127)]));
        let doc = build_graph(&db);
        assert_eq!(doc.batadv.links.len(), 1);
        assert!(!doc.batadv.links[0].bidirect);
        // the neighbor exists as an id-only node
        assert_eq!(doc.batadv.nodes.len(), 2);
        assert!(doc.batadv.nodes[1].node_id.is_none());
    }

    #[tokio::test]
    async fn translation_table_entries_are_ignored() {
        let db = NodeDb::new(test_settings());
        db.update_vis(&vis(0x01, &[0x01], &[(0x02, 0), (0x03, 100)]));
        let doc = build_graph(&db);
        assert_eq!(doc.batadv.links.len(), 1);
    }

    #[tokio::test]
    async fn alias_resolution_applies_to_both_endpoints() {
        let db = NodeDb::new(test_settings());
        // node A has interfaces 0x0a (canonical) and 0x0b
        db.update_vis(&vis(0x0b, &[0x0a, 0x0b], &[]));
        // node B links to A's secondary interface
        db.update_vis(&vis(0x02, &[0x02], &[(0x0b, 100)]));
        let doc = build_graph(&db);
        let link = doc.batadv.links[0];
        assert_eq!(
            doc.batadv.nodes[link.target].id.to_string(),
            addr(0x0a).to_string()
        );
    }

    #[tokio::test]
    async fn gateway_links_carry_vpn_flag() {
        let db = NodeDb::new(test_settings());
        db.update_vis(&vis(0x01, &[0x01], &[(0x02, 100)]));
        db.main.update(|tx| {
            tx.put(&Bucket::Gateways, addr(0x01).as_bytes(), &[], None);
        });
        let doc = build_graph(&db);
        assert!(doc.batadv.links[0].vpn);
    }
}

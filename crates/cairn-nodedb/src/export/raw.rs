//! Raw bucket exports: each entry as a `{metadata, record}` object so
//! another instance can re-import the data unchanged.

use std::sync::Arc;

use serde::Serialize;

use cairn_core::HardwareAddr;

use crate::export::cache::Cache;
use crate::items::{NodeInfoItem, StatisticsItem, VisDataItem};
use crate::nodedb::NodeDb;
use crate::store::{Bucket, Meta};

#[derive(Serialize)]
struct Transfer<T: Serialize> {
    metadata: Meta,
    record: T,
}

fn export_bucket<T, F>(db: &NodeDb, cache: &Cache, bucket: Bucket, decode: F) -> Arc<Vec<u8>>
where
    T: Serialize,
    F: Fn(&[u8]) -> Option<T>,
{
    cache.get(|| {
        let mut entries = Vec::new();
        db.main.view(|tx| {
            tx.for_each(&bucket, |_, meta, content| {
                if let Some(record) = decode(content) {
                    entries.push(Transfer {
                        metadata: meta,
                        record,
                    });
                }
                true
            });
        });
        serde_json::to_vec(&entries).unwrap_or_default()
    })
}

pub fn export_node_info(db: &NodeDb) -> Arc<Vec<u8>> {
    export_bucket(db, &db.caches.nodeinfo, Bucket::NodeInfo, |raw| {
        NodeInfoItem::from_bytes(raw).ok()
    })
}

pub fn export_statistics(db: &NodeDb) -> Arc<Vec<u8>> {
    export_bucket(db, &db.caches.statistics, Bucket::Statistics, |raw| {
        StatisticsItem::from_bytes(raw).ok()
    })
}

pub fn export_vis_data(db: &NodeDb) -> Arc<Vec<u8>> {
    export_bucket(db, &db.caches.visdata, Bucket::VisData, |raw| {
        VisDataItem::from_bytes(raw).ok()
    })
}

/// Aliases dump as one `{"<alias>": "<canonical>"}` object per mapping.
pub fn export_aliases(db: &NodeDb) -> Arc<Vec<u8>> {
    db.caches.aliases.get(|| {
        let mut entries: Vec<std::collections::BTreeMap<String, String>> = Vec::new();
        db.main.view(|tx| {
            tx.for_each(&Bucket::NodeId, |key, _, content| {
                let (Some(alias), Some(canonical)) = (
                    HardwareAddr::from_bytes(key),
                    HardwareAddr::from_bytes(content),
                ) else {
                    return true;
                };
                entries.push(
                    [(alias.to_string(), canonical.to_string())]
                        .into_iter()
                        .collect(),
                );
                true
            });
        });
        serde_json::to_vec(&entries).unwrap_or_default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gluon::NodeInfoData;
    use crate::nodedb::test_settings;
    use crate::vis::VisV1;

    fn addr(last: u8) -> HardwareAddr {
        HardwareAddr([0x02, 0, 0, 0, 0, last])
    }

    #[tokio::test]
    async fn raw_export_carries_metadata_and_record() {
        let db = NodeDb::new(test_settings());
        db.update_node_info(
            &NodeInfoItem {
                source: addr(1),
                data: NodeInfoData {
                    hostname: Some("one".into()),
                    ..Default::default()
                },
            },
            false,
            None,
        );
        let bytes = export_node_info(&db);
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let entry = &parsed.as_array().unwrap()[0];
        assert!(entry["metadata"]["created"].as_i64().unwrap() > 0);
        assert_eq!(entry["record"]["data"]["hostname"], "one");
    }

    #[tokio::test]
    async fn alias_export_lists_mappings() {
        let db = NodeDb::new(test_settings());
        db.update_vis(&VisV1 {
            mac: addr(0x53),
            iface_n: 1,
            entries_n: 0,
            ifaces: vec![addr(0x0a)],
            entries: vec![],
        });
        let bytes = export_aliases(&db);
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let list = parsed.as_array().unwrap();
        // the source mapping and the canonical self-mapping
        assert_eq!(list.len(), 2);
        assert!(list
            .iter()
            .any(|m| m.get(&addr(0x53).to_string()).is_some()));
        assert!(list
            .iter()
            .any(|m| m[&addr(0x0a).to_string()] == addr(0x0a).to_string()));
    }
}

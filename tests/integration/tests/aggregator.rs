//! End-to-end: aggregator pulling from a live daemon.

use std::time::Duration;

use bytes::Bytes;
use cairn_core::wire::{Data, Mode};
use cairn_core::HardwareAddr;
use cairn_integration::{test_daemon, wait_for};
use cairn_nodedb::export::nodes::build_nodes;
use cairn_nodedb::gluon;
use cairn_nodedb::nodedb::{NodeDb, Settings};
use cairn_nodedb::update::spawn_updaters;
use cairn_nodedb::vis;

fn addr(last: u8) -> HardwareAddr {
    HardwareAddr([0x02, 0, 0, 0, 0, last])
}

fn settings() -> Settings {
    Settings {
        offline_after: Duration::from_secs(300),
        node_purge: Duration::from_secs(3600),
        node_purge_interval: Duration::from_secs(3600),
        vis_purge: Duration::from_secs(300),
        vis_purge_interval: Duration::from_secs(300),
    }
}

#[tokio::test]
async fn aggregator_pulls_and_exports_nodes() {
    let (_server, client) = test_daemon(Mode::Master).await;

    // seed the daemon like a node's firmware would
    let info = gluon::NodeInfoData {
        node_id: Some(addr(1)),
        hostname: Some("node-one".into()),
        ..Default::default()
    };
    let stats = gluon::StatisticsData {
        node_id: Some(addr(1)),
        clients: Some(gluon::Clients { wifi: 3, total: 8 }),
        uptime: 123.0,
        ..Default::default()
    };
    let vis_payload = vis::encode_payload(addr(1), &[addr(1)], &[]);
    client
        .push(vec![
            Data::new(
                addr(1),
                gluon::NODEINFO_PACKETTYPE,
                0,
                Bytes::from(gluon::gzip_json(&info)),
            ),
            Data::new(
                addr(1),
                gluon::STATISTICS_PACKETTYPE,
                0,
                Bytes::from(gluon::gzip_json(&stats)),
            ),
            Data::new(
                addr(1),
                vis::PACKETTYPE,
                vis::PACKETVERSION,
                Bytes::from(vis_payload),
            ),
        ])
        .await
        .expect("push");

    let db = NodeDb::new(settings());
    // fast cycles so the test doesn't wait out the startup jitter
    let _updaters = spawn_updaters(
        db.clone(),
        client.clone(),
        Duration::from_millis(200),
        Duration::from_millis(100),
    );

    let entry = wait_for(
        || {
            let doc = build_nodes(&db);
            doc.nodes.get(&addr(1).to_string()).map(|e| {
                (
                    e.nodeinfo.hostname.clone(),
                    e.statistics.clients,
                    e.flags.online,
                )
            })
        },
        Duration::from_secs(5),
    )
    .await
    .expect("node never appeared in the export");

    assert_eq!(entry.0.as_deref(), Some("node-one"));
    assert_eq!(entry.1, 8);
    assert!(entry.2);

    // the vis pull stores the record and populates the alias map
    wait_for(
        || {
            db.main
                .view(|tx| tx.exists(&cairn_nodedb::Bucket::VisData, addr(1).as_bytes()))
                .then_some(())
        },
        Duration::from_secs(5),
    )
    .await
    .expect("vis record never arrived");
    assert_eq!(db.resolve_alias(addr(1)), addr(1));
}

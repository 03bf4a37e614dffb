//! End-to-end: daemon and clients over loopback TCP.

use std::time::Duration;

use bytes::Bytes;
use cairn_core::wire::{Data, Mode};
use cairn_core::HardwareAddr;
use cairn_integration::{test_daemon, wait_for};

fn record(source: [u8; 6], kind: u8, payload: &[u8]) -> Data {
    Data::new(
        HardwareAddr(source),
        kind,
        0,
        Bytes::copy_from_slice(payload),
    )
}

#[tokio::test]
async fn push_then_get_round_trips() {
    let (_server, client) = test_daemon(Mode::Master).await;

    client
        .push(vec![
            record([2, 0, 0, 0, 0, 1], 64, b"hello mesh"),
            record([2, 0, 0, 0, 0, 2], 65, b"other type"),
        ])
        .await
        .expect("push");

    // the transaction commits asynchronously
    let mut got = None;
    for _ in 0..50 {
        let records = client.request_all(64).await.expect("request");
        if !records.is_empty() {
            got = Some(records);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let records = got.expect("pushed record never appeared");
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0].payload[..], b"hello mesh");
    assert_eq!(records[0].source, HardwareAddr([2, 0, 0, 0, 0, 1]));
}

#[tokio::test]
async fn get_unknown_type_returns_empty() {
    let (_server, client) = test_daemon(Mode::Master).await;
    let records = client.request_all(99).await.expect("request");
    assert!(records.is_empty());
}

#[tokio::test]
async fn slave_without_master_reports_error() {
    let (_server, client) = test_daemon(Mode::Slave).await;
    let err = client.request_all(64).await.unwrap_err();
    assert!(matches!(err, cairn_core::client::ClientError::Status));
}

#[tokio::test]
async fn mode_switch_changes_behavior() {
    let (server, client) = test_daemon(Mode::Slave).await;
    assert_eq!(server.mode(), Mode::Slave);

    client.mode_switch(Mode::Master as u8).await.expect("switch");
    wait_for(
        || (server.mode() == Mode::Master).then_some(()),
        Duration::from_secs(2),
    )
    .await
    .expect("mode never switched");

    // a master answers from its (empty) own store instead of erroring
    let records = client.request_all(64).await.expect("request");
    assert!(records.is_empty());
}

#[tokio::test]
async fn anonymous_push_without_interface_is_dropped() {
    let (_server, client) = test_daemon(Mode::Master).await;
    // unset source and no bound interface: the daemon has no address
    // to substitute, so nothing may be stored
    client
        .push(vec![record([0; 6], 64, b"anonymous")])
        .await
        .expect("push");
    tokio::time::sleep(Duration::from_millis(300)).await;
    let records = client.request_all(64).await.expect("request");
    assert!(records.is_empty());
}

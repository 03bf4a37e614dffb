//! Updater tasks: pull the three payload shapes from the local daemon.
//!
//! One persistent task per payload kind. A cycle opens a fresh stream
//! connection, requests the kind, applies every record to the database,
//! and sleeps. Failures sleep the (shorter) retry interval instead.
//! Startup is jittered so the three pulls don't align.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use cairn_core::client::Client;
use cairn_core::wire::Data;

use crate::items::{NodeInfoItem, StatisticsItem};
use crate::nodedb::NodeDb;
use crate::store::Notification;
use crate::{gluon, vis};

/// Published on the success topic after each completed update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEvent {
    NodeInfo,
    Statistics,
    VisData,
}

/// Handle to the updater machinery: the success topic.
#[derive(Clone)]
pub struct Updaters {
    events: broadcast::Sender<UpdateEvent>,
}

impl Updaters {
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }
}

/// Spawn the three updater tasks against `client`. They stop when the
/// database broadcasts its quit notification.
pub fn spawn_updaters(
    db: Arc<NodeDb>,
    client: Client,
    update_wait: Duration,
    retry_wait: Duration,
) -> Updaters {
    let (events, _) = broadcast::channel(16);
    for kind in [
        UpdateEvent::VisData,
        UpdateEvent::NodeInfo,
        UpdateEvent::Statistics,
    ] {
        spawn_one(db.clone(), client.clone(), kind, update_wait, retry_wait, events.clone());
    }
    Updaters { events }
}

fn packet_type(kind: UpdateEvent) -> u8 {
    match kind {
        UpdateEvent::NodeInfo => gluon::NODEINFO_PACKETTYPE,
        UpdateEvent::Statistics => gluon::STATISTICS_PACKETTYPE,
        UpdateEvent::VisData => vis::PACKETTYPE,
    }
}

fn spawn_one(
    db: Arc<NodeDb>,
    client: Client,
    kind: UpdateEvent,
    update_wait: Duration,
    retry_wait: Duration,
    events: broadcast::Sender<UpdateEvent>,
) {
    let mut quit = db.main.subscribe();
    tokio::spawn(async move {
        let requested_type = packet_type(kind);
        // spread the startup pulls over the update interval
        let jitter = update_wait.mul_f64(rand::random::<f64>());
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = wait_quit(&mut quit) => return,
        }
        loop {
            tracing::info!(requested_type, "updating data from daemon");
            let wait = match run_cycle(&db, &client, kind, requested_type).await {
                Ok(records) => {
                    tracing::info!(requested_type, records, "update succeeded");
                    let _ = events.send(kind);
                    update_wait
                }
                Err(e) => {
                    tracing::warn!(requested_type, error = %e, "error fetching data");
                    retry_wait
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = wait_quit(&mut quit) => return,
            }
        }
    });
}

async fn wait_quit(quit: &mut broadcast::Receiver<Notification>) {
    loop {
        match quit.recv().await {
            Ok(Notification::Quit) | Err(broadcast::error::RecvError::Closed) => return,
            _ => {}
        }
    }
}

async fn run_cycle(
    db: &NodeDb,
    client: &Client,
    kind: UpdateEvent,
    requested_type: u8,
) -> Result<usize, cairn_core::client::ClientError> {
    let mut records = 0usize;
    client
        .request(requested_type, |data| {
            if apply_record(db, kind, &data) {
                records += 1;
            }
            Ok(())
        })
        .await?;
    Ok(records)
}

/// Apply one record to the database. Parse failures skip the record and
/// keep the cycle going.
fn apply_record(db: &NodeDb, kind: UpdateEvent, data: &Data) -> bool {
    match kind {
        UpdateEvent::NodeInfo => match gluon::read_node_info(data) {
            Ok(info) => {
                db.update_node_info(
                    &NodeInfoItem {
                        source: data.source,
                        data: info,
                    },
                    false,
                    None,
                );
                true
            }
            Err(e) => {
                tracing::warn!(source = %data.source, error = %e, "skipping unparseable nodeinfo");
                false
            }
        },
        UpdateEvent::Statistics => match gluon::read_statistics(data) {
            Ok(stats) => {
                db.update_statistics(&StatisticsItem {
                    source: data.source,
                    data: stats,
                });
                true
            }
            Err(e) => {
                tracing::warn!(source = %data.source, error = %e, "skipping unparseable statistics");
                false
            }
        },
        UpdateEvent::VisData => match vis::VisV1::read(data) {
            Ok(vis) => {
                db.update_vis(&vis);
                true
            }
            Err(e) => {
                tracing::warn!(source = %data.source, error = %e, "skipping unparseable vis record");
                false
            }
        },
    }
}

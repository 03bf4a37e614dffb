//! Periodic JSON file output: write nodes.json / graph.json into a
//! directory whenever the relevant data changed, atomically via
//! write-to-temp-then-rename.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::nodedb::NodeDb;
use crate::update::{UpdateEvent, Updaters};

/// Spawn the file generator for `dir`. Re-generates nodes.json on
/// nodeinfo/statistics updates and graph.json on vis updates; while a
/// write runs, at most one follow-up is queued.
pub fn spawn_json_generator(db: Arc<NodeDb>, updaters: &Updaters, dir: PathBuf) {
    let nodes_trigger = spawn_writer(db.clone(), dir.clone(), "nodes.json", |db| {
        super::nodes::generate_nodes(db)
    });
    let graph_trigger = spawn_writer(db.clone(), dir, "graph.json", |db| {
        super::graph::generate_graph(db)
    });

    let mut events = updaters.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(UpdateEvent::NodeInfo) | Ok(UpdateEvent::Statistics) => {
                    let _ = nodes_trigger.try_send(());
                }
                Ok(UpdateEvent::VisData) => {
                    let _ = graph_trigger.try_send(());
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let _ = nodes_trigger.try_send(());
                    let _ = graph_trigger.try_send(());
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn spawn_writer(
    db: Arc<NodeDb>,
    dir: PathBuf,
    name: &'static str,
    generate: fn(&NodeDb) -> Arc<Vec<u8>>,
) -> mpsc::Sender<()> {
    // capacity 1: one running write plus at most one queued follow-up
    let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        while trigger_rx.recv().await.is_some() {
            let db = db.clone();
            let dir = dir.clone();
            let result =
                tokio::task::spawn_blocking(move || write_atomically(&dir, name, &generate(&db)))
                    .await;
            match result {
                Ok(Ok(())) => tracing::debug!(name, "json file written"),
                Ok(Err(e)) => tracing::warn!(name, error = %e, "cannot write json file"),
                Err(e) => tracing::warn!(name, error = %e, "json writer panicked"),
            }
        }
    });
    trigger_tx
}

fn write_atomically(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = dir.join(format!("{name}.new"));
    let target = dir.join(name);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, &target)
}

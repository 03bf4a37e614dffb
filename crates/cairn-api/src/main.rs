//! cairn-backend — mesh aggregator and HTTP exporter.
//!
//! Pulls the three payload shapes from a local cairnd, keeps the
//! mesh-node database, and serves the JSON documents over HTTP and/or
//! into a directory of files.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use cairn_api::{serve, ApiState};
use cairn_core::client::{Client, Endpoint};
use cairn_core::config::CairnConfig;
use cairn_nodedb::export::generate::spawn_json_generator;
use cairn_nodedb::logdb::spawn_logger;
use cairn_nodedb::update::spawn_updaters;
use cairn_nodedb::{NodeDb, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = CairnConfig::load().context("loading configuration")?;
    let aggregator = config.aggregator;
    tracing::info!(
        network = %aggregator.network,
        address = %aggregator.address,
        "cairn-backend starting"
    );

    let db = NodeDb::new(Settings {
        offline_after: aggregator.offline_after,
        node_purge: aggregator.node_purge,
        node_purge_interval: aggregator.node_purge_interval,
        vis_purge: aggregator.vis_purge,
        vis_purge_interval: aggregator.vis_purge_interval,
    });

    if !aggregator.import_nodes.is_empty() {
        let file = std::fs::File::open(&aggregator.import_nodes)
            .with_context(|| format!("opening {}", aggregator.import_nodes))?;
        match db.import_nodes(file, aggregator.import_persistent) {
            Ok(imported) => tracing::info!(imported, "imported nodes from file"),
            Err(e) => tracing::warn!(error = %e, "error reading initial database, continuing"),
        }
    }

    let endpoint = Endpoint::parse(&aggregator.network, &aggregator.address)?;
    // the update interval doubles as the socket deadline
    let client = Client::new(endpoint, aggregator.update_wait);
    let updaters = spawn_updaters(
        db.clone(),
        client,
        aggregator.update_wait,
        aggregator.retry_wait,
    );
    spawn_logger(db.clone(), &updaters);

    if !aggregator.json_dir.is_empty() {
        spawn_json_generator(
            db.clone(),
            &updaters,
            PathBuf::from(&aggregator.json_dir),
        );
    }

    let http = config.http.listen;
    if http.is_empty() {
        if aggregator.json_dir.is_empty() {
            tracing::warn!("no json directory and no http server: this will be a very boring run");
        }
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    } else {
        let state = ApiState { db: Arc::clone(&db) };
        tokio::select! {
            result = serve(state, &http) => result?,
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    db.close();
    Ok(())
}

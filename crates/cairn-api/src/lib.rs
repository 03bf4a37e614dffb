//! HTTP endpoints over the mesh-node database — exposes the JSON
//! documents the map frontends consume, raw exports for re-import, and
//! the count-log admin verbs.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;

use cairn_core::HardwareAddr;
use cairn_nodedb::export::{graph, nodes, nodes_old, raw, JsonTime};
use cairn_nodedb::store::now_stamp;
use cairn_nodedb::{Bucket, NodeDb};

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<NodeDb>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/json/nodes.json", get(handle_nodes))
        .route("/json/graph.json", get(handle_graph))
        .route("/json/old/nodes.json", get(handle_nodes_old))
        .route("/json/export/nodeinfo.json", get(handle_export_nodeinfo))
        .route("/json/export/statistics.json", get(handle_export_statistics))
        .route("/json/export/visdata.json", get(handle_export_visdata))
        .route("/json/export/aliases.json", get(handle_export_aliases))
        .route("/json/log/:file", get(handle_log_file))
        .route(
            "/log/:id",
            axum::routing::post(handle_log_post),
        )
        .route(
            "/log/:id/:timestamp",
            axum::routing::delete(handle_log_delete),
        )
        .with_state(state)
}

/// Serve the router on `addr` until the process ends.
pub async fn serve(state: ApiState, addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn json_bytes(bytes: Arc<Vec<u8>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        bytes.as_ref().clone(),
    )
        .into_response()
}

// ── Documents ─────────────────────────────────────────────────────────────────

async fn handle_nodes(State(state): State<ApiState>) -> Response {
    json_bytes(nodes::generate_nodes(&state.db))
}

async fn handle_graph(State(state): State<ApiState>) -> Response {
    json_bytes(graph::generate_graph(&state.db))
}

async fn handle_nodes_old(State(state): State<ApiState>) -> Response {
    json_bytes(nodes_old::generate_nodes_old(&state.db))
}

async fn handle_export_nodeinfo(State(state): State<ApiState>) -> Response {
    json_bytes(raw::export_node_info(&state.db))
}

async fn handle_export_statistics(State(state): State<ApiState>) -> Response {
    json_bytes(raw::export_statistics(&state.db))
}

async fn handle_export_visdata(State(state): State<ApiState>) -> Response {
    json_bytes(raw::export_vis_data(&state.db))
}

async fn handle_export_aliases(State(state): State<ApiState>) -> Response {
    json_bytes(raw::export_aliases(&state.db))
}

// ── Count logs ────────────────────────────────────────────────────────────────

/// Map a log id to its bucket: the mesh-wide keys or a node MAC, which
/// is resolved through the alias map.
fn log_bucket(db: &NodeDb, id: &str) -> Option<Bucket> {
    match id {
        "clients" => Some(Bucket::MeshClients),
        "nodes" => Some(Bucket::MeshNodes),
        mac => {
            let addr: HardwareAddr = mac.parse().ok()?;
            Some(Bucket::NodeClients(db.resolve_alias(addr).to_string()))
        }
    }
}

#[derive(serde::Serialize)]
struct LogDataDoc {
    key: String,
    samples: Vec<LogPoint>,
}

#[derive(serde::Serialize)]
struct LogPoint {
    time: JsonTime,
    count: i64,
}

fn log_data_doc(db: &NodeDb, id: &str, bucket: &Bucket) -> LogDataDoc {
    LogDataDoc {
        key: id.to_string(),
        samples: db
            .log_data(bucket)
            .into_iter()
            .map(|c| LogPoint {
                time: JsonTime(c.timestamp),
                count: c.count,
            })
            .collect(),
    }
}

/// The /json/log/ file namespace: `nodes.json` lists the logged node
/// keys, `data-{id}.json` dumps one key's samples, and
/// `samples-{id}-{duration}-{samples}.json` returns rolled-up buckets.
async fn handle_log_file(
    State(state): State<ApiState>,
    Path(file): Path<String>,
) -> Response {
    let db = &state.db;
    if file == "nodes.json" {
        return Json(serde_json::json!({ "nodes": db.log_node_keys() })).into_response();
    }
    let Some(stem) = file.strip_suffix(".json") else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Some(id) = stem.strip_prefix("data-") {
        let Some(bucket) = log_bucket(db, id) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        return Json(log_data_doc(db, id, &bucket)).into_response();
    }

    if let Some(rest) = stem.strip_prefix("samples-") {
        // id may contain separators itself, so take the two trailing
        // fields from the right
        let mut fields = rest.rsplitn(3, '-');
        let (Some(samples), Some(duration), Some(id)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let Ok(samples) = samples.parse::<usize>() else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let Ok(duration) = humantime::parse_duration(duration) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        if samples == 0 || duration.is_zero() {
            return StatusCode::BAD_REQUEST.into_response();
        }
        let Some(bucket) = log_bucket(db, id) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let start = round_to(now_stamp(), duration.as_millis() as i64 / samples as i64);
        let rolled = db.log_samples(&bucket, start, duration, samples);
        return (
            [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
            Json(serde_json::json!({ "key": id, "samples": rolled })),
        )
            .into_response();
    }

    StatusCode::NOT_FOUND.into_response()
}

fn round_to(stamp: i64, step: i64) -> i64 {
    if step <= 0 {
        return stamp;
    }
    (stamp + step / 2) / step * step
}

#[derive(Deserialize)]
struct LogPost {
    #[serde(default)]
    time: Option<JsonTime>,
    count: i64,
}

async fn handle_log_post(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<LogPost>,
) -> Response {
    let Some(bucket) = log_bucket(&state.db, &id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let timestamp = body.time.map(|t| t.0).unwrap_or_else(now_stamp);
    state.db.log_count(&bucket, timestamp, body.count);
    (
        StatusCode::CREATED,
        Json(log_data_doc(&state.db, &id, &bucket)),
    )
        .into_response()
}

async fn handle_log_delete(
    State(state): State<ApiState>,
    Path((id, timestamp)): Path<(String, i64)>,
) -> Response {
    let Some(bucket) = log_bucket(&state.db, &id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if !state.db.delete_log_sample(&bucket, timestamp) {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(log_data_doc(&state.db, &id, &bucket)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_matches_half_up() {
        assert_eq!(round_to(1_499, 1_000), 1_000);
        assert_eq!(round_to(1_500, 1_000), 2_000);
        assert_eq!(round_to(10, 0), 10);
    }
}

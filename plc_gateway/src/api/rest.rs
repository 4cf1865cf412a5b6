//! JSON REST surface under `/api/v1`.
//!
//! Tag mutations hit the store synchronously; matching OPC UA node
//! operations are enqueued best-effort and never block the response.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::info;

use crate::errors::GatewayResult;
use crate::opcua::bridge::{NodeCommand, NodeSpec};
use crate::runtime::{epoch_seconds, GatewayContext};
use crate::tags::store::TagPatch;
use crate::tags::structures::{Tag, TagValue};

pub fn create_api_routes() -> Router<GatewayContext> {
    Router::new()
        .route("/api/v1/tags", get(list_tags).post(create_tags))
        .route("/api/v1/tags/import", put(import_tags))
        .route(
            "/api/v1/tags/:tag_id",
            get(get_tag).patch(patch_tag).delete(delete_tag),
        )
        .route("/api/v1/hmi/data", get(hmi_data))
        .route("/api/v1/hmi/health", get(hmi_health))
        .route("/api/v1/hmi/config", get(hmi_config))
        .route("/api/v1/hmi/ready", get(hmi_ready))
        .route("/api/v1/hmi/stop", post(hmi_stop))
}

/// Bind and serve the REST API until shutdown is signalled. The response
/// to `/hmi/stop` is flushed before the listener closes.
pub async fn serve(ctx: GatewayContext) -> GatewayResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.settings.http_port));
    let app = create_api_routes().with_state(ctx.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("REST API listening on http://{}/api/v1", addr);
    let shutdown = ctx.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await?;
    Ok(())
}

async fn list_tags(State(state): State<GatewayContext>) -> impl IntoResponse {
    Json(json!({ "tags": state.store.list_tags() }))
}

async fn create_tags(
    State(state): State<GatewayContext>,
    Json(payload): Json<JsonValue>,
) -> impl IntoResponse {
    let items: Vec<JsonValue> = match payload.get("tags").and_then(|v| v.as_array()) {
        Some(batch) => batch.clone(),
        None => vec![payload.clone()],
    };

    let mut created = Vec::new();
    for item in &items {
        match tag_from_payload(item) {
            Ok((tag, initial_value)) => {
                let spec = NodeSpec::from(&tag);
                let tag_id = tag.tag_id.clone();
                state.store.add_tag(tag, initial_value);
                state.nodes.send(NodeCommand::Create(spec));
                created.push(tag_id);
            }
            Err(message) => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": message })));
            }
        }
    }
    (StatusCode::CREATED, Json(json!({ "created": created })))
}

async fn get_tag(
    State(state): State<GatewayContext>,
    Path(tag_id): Path<String>,
) -> impl IntoResponse {
    let Some(tag) = state.store.get_tag(&tag_id) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })));
    };
    let raw = state.store.get_raw_value(&tag.tag_id);
    let value = state.store.get_value(&tag.tag_id);
    // A decimal-typed stored value keeps its textual form (trailing zeros
    // included); anything else serializes as a plain JSON value.
    let out_value = match (&raw, &value) {
        (Some(TagValue::Decimal(_)), Some(TagValue::Decimal(d))) => json!(d.to_string()),
        (_, Some(v)) => v.to_json(),
        _ => JsonValue::Null,
    };

    let mut body = serde_json::to_value(&tag).unwrap_or_else(|_| json!({}));
    body["value"] = out_value;
    (StatusCode::OK, Json(json!({ "tag": body })))
}

async fn patch_tag(
    State(state): State<GatewayContext>,
    Path(tag_id): Path<String>,
    Json(payload): Json<JsonValue>,
) -> impl IntoResponse {
    let Some(fields) = payload.as_object().filter(|o| !o.is_empty()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "empty payload" })));
    };
    let patch = patch_from_payload(fields);
    let has_value = fields.contains_key("value");
    if patch.is_empty() && !has_value {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "no updatable fields provided" })),
        );
    }
    if state.store.get_tag(&tag_id).is_none() {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })));
    }

    if !patch.is_empty() {
        state.store.update_tag(&tag_id, patch);
    }

    if has_value {
        let Some(value) = fields.get("value").and_then(TagValue::from_json) else {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "unsupported value type" })),
            );
        };
        state.store.set_value(&tag_id, value.clone());
        state.nodes.send(NodeCommand::UpdateValue {
            tag_id: tag_id.clone(),
            value,
        });
    }

    (StatusCode::OK, Json(json!({ "updated": tag_id })))
}

async fn delete_tag(
    State(state): State<GatewayContext>,
    Path(tag_id): Path<String>,
) -> impl IntoResponse {
    if state.store.get_tag(&tag_id).is_none() {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })));
    }
    state.store.remove_tag(&tag_id);
    state.nodes.send(NodeCommand::Delete {
        tag_id: tag_id.clone(),
    });
    (StatusCode::OK, Json(json!({ "deleted": tag_id })))
}

#[derive(Deserialize)]
pub struct ImportQuery {
    #[serde(default)]
    replace_all: Option<String>,
}

async fn import_tags(
    State(state): State<GatewayContext>,
    Query(query): Query<ImportQuery>,
    Json(payload): Json<JsonValue>,
) -> impl IntoResponse {
    let replace_all = matches!(
        query
            .replace_all
            .as_deref()
            .map(|s| s.to_ascii_lowercase())
            .as_deref(),
        Some("1") | Some("true") | Some("yes")
    );
    let Some(items) = payload.get("tags").and_then(|v| v.as_array()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "tags must be a list" })),
        );
    };

    if replace_all {
        state.store.clear_tags();
    }

    let mut imported = Vec::new();
    for item in items {
        match tag_from_payload(item) {
            Ok((tag, initial_value)) => {
                let spec = NodeSpec::from(&tag);
                let tag_id = tag.tag_id.clone();
                state.store.add_tag(tag, initial_value);
                state.nodes.send(NodeCommand::Create(spec));
                imported.push(tag_id);
            }
            Err(message) => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": message })));
            }
        }
    }
    (StatusCode::OK, Json(json!({ "imported": imported })))
}

/// Snapshot of raw tag values, timestamped.
async fn hmi_data(State(state): State<GatewayContext>) -> impl IntoResponse {
    let mut tags = JsonMap::new();
    for (tag_id, value) in state.store.snapshot() {
        tags.insert(tag_id, value.to_json());
    }
    Json(json!({ "timestamp": epoch_seconds(), "tags": tags }))
}

/// Aggregated gateway health, fast and safe to call frequently.
async fn hmi_health(State(state): State<GatewayContext>) -> impl IntoResponse {
    let now = epoch_seconds();
    let last = state.last_update.epoch_seconds();
    let age = (last != 0.0).then_some(now - last);
    let healthy = age.map_or(false, |a| a < 5.0);

    let mut plc_health = JsonMap::new();
    for (key, snapshot) in state.health.snapshot() {
        plc_health.insert(
            key,
            serde_json::to_value(&snapshot).unwrap_or_else(|_| json!({})),
        );
    }

    Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "timestamp": now,
        "last_plc_update": last,
        "age_seconds": age,
        "tags_available": state.store.tag_ids(),
        "plc_health": plc_health,
    }))
}

/// Tag metadata for HMI clients.
async fn hmi_config(State(state): State<GatewayContext>) -> impl IntoResponse {
    Json(json!({ "tags": state.store.list_tags() }))
}

async fn hmi_ready(State(state): State<GatewayContext>) -> impl IntoResponse {
    if state.readiness.is_ready() {
        (StatusCode::OK, Json(json!({ "ready": true })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "ready": false })))
    }
}

/// Request graceful shutdown of the gateway.
///
/// The shutdown signal is set immediately; the OPC UA runtime is asked to
/// stop through the command channel (a no-op during the startup race) and
/// the HTTP server stops once this response has been sent.
async fn hmi_stop(State(state): State<GatewayContext>) -> impl IntoResponse {
    state.shutdown.trigger();

    let (ack_tx, ack_rx) = oneshot::channel();
    let scheduled = state.nodes.send(NodeCommand::Shutdown { ack: Some(ack_tx) });
    if !scheduled {
        info!("Stop requested before OPC UA runtime initialized; no-op shutdown");
    } else if state.settings.mock_plc {
        // Bounded wait so tests observe a settled shutdown without this
        // response ever blocking indefinitely.
        let _ = tokio::time::timeout(Duration::from_millis(500), ack_rx).await;
    }

    Json(json!({ "status": "shutting_down" }))
}

fn tag_from_payload(payload: &JsonValue) -> Result<(Tag, Option<TagValue>), String> {
    let Some(fields) = payload.as_object() else {
        return Err("tag must be an object".to_string());
    };
    let tag_id = fields
        .get("tag_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            fields
                .get("name")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
        });
    let Some(tag_id) = tag_id else {
        return Err("tag_id or name is required and must be a string".to_string());
    };
    if let Some(dt) = fields.get("data_type") {
        if !dt.is_string() {
            return Err("data_type must be a string".to_string());
        }
    }

    let mut tag = Tag::new(tag_id);
    if let Some(v) = fields.get("name").and_then(|v| v.as_str()) {
        tag.name = v.to_string();
    }
    if let Some(v) = fields.get("plc_id").and_then(|v| v.as_str()) {
        tag.plc_id = v.to_string();
    }
    if let Some(v) = fields.get("address").and_then(|v| v.as_str()) {
        tag.address = v.to_string();
    }
    if let Some(v) = fields.get("data_type").and_then(|v| v.as_str()) {
        tag.data_type = v.to_string();
    }
    if let Some(v) = fields.get("group_id").and_then(|v| v.as_str()) {
        tag.group_id = v.to_string();
    }
    if let Some(v) = fields.get("description").and_then(|v| v.as_str()) {
        tag.description = Some(v.to_string());
    }
    if let Some(v) = fields.get("project_id").and_then(|v| v.as_str()) {
        tag.project_id = Some(v.to_string());
    }
    if let Some(v) = fields.get("scale_mul").and_then(|v| v.as_f64()) {
        tag.scale_mul = v;
    }
    if let Some(v) = fields.get("scale_add").and_then(|v| v.as_f64()) {
        tag.scale_add = v;
    }
    if let Some(v) = fields.get("decimals").and_then(|v| v.as_u64()) {
        tag.decimals = Some(v as u32);
    }
    if let Some(v) = fields.get("writable").and_then(|v| v.as_bool()) {
        tag.writable = v;
    }
    if let Some(v) = fields.get("enabled").and_then(|v| v.as_bool()) {
        tag.enabled = v;
    }
    if let Some(v) = fields.get("client_visible").and_then(|v| v.as_array()) {
        tag.client_visible = v
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect();
    }

    let initial_value = fields.get("initial_value").and_then(TagValue::from_json);
    Ok((tag, initial_value))
}

fn patch_from_payload(fields: &JsonMap<String, JsonValue>) -> TagPatch {
    let mut patch = TagPatch::default();
    if let Some(v) = fields.get("name").and_then(|v| v.as_str()) {
        patch.name = Some(v.to_string());
    }
    if let Some(v) = fields.get("plc_id").and_then(|v| v.as_str()) {
        patch.plc_id = Some(v.to_string());
    }
    if let Some(v) = fields.get("address").and_then(|v| v.as_str()) {
        patch.address = Some(v.to_string());
    }
    if let Some(v) = fields.get("data_type").and_then(|v| v.as_str()) {
        patch.data_type = Some(v.to_string());
    }
    if let Some(v) = fields.get("group_id").and_then(|v| v.as_str()) {
        patch.group_id = Some(v.to_string());
    }
    if let Some(v) = fields.get("description") {
        patch.description = Some(v.as_str().map(str::to_string));
    }
    if let Some(v) = fields.get("enabled").and_then(|v| v.as_bool()) {
        patch.enabled = Some(v);
    }
    if let Some(v) = fields.get("project_id") {
        patch.project_id = Some(v.as_str().map(str::to_string));
    }
    if let Some(v) = fields.get("scale_mul").and_then(|v| v.as_f64()) {
        patch.scale_mul = Some(v);
    }
    if let Some(v) = fields.get("scale_add").and_then(|v| v.as_f64()) {
        patch.scale_add = Some(v);
    }
    if let Some(v) = fields.get("writable").and_then(|v| v.as_bool()) {
        patch.writable = Some(v);
    }
    if let Some(v) = fields.get("client_visible").and_then(|v| v.as_array()) {
        patch.client_visible = Some(
            v.iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
        );
    }
    patch
}

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use plc_gateway::api::rest::create_api_routes;
use plc_gateway::config::settings::Settings;
use plc_gateway::loki::LokiHandle;
use plc_gateway::runtime::GatewayContext;
use plc_gateway::tags::structures::{Tag, TagValue};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use tower::ServiceExt;

fn create_test_context() -> GatewayContext {
    GatewayContext::new(Settings::default(), LokiHandle::disabled())
}

fn create_test_app(ctx: &GatewayContext) -> Router {
    create_api_routes().with_state(ctx.clone())
}

async fn send(
    app: Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri).method(method);
    let body = match body {
        Some(payload) => {
            builder = builder.header("content-type", "application/json");
            Body::from(payload.to_string())
        }
        None => Body::empty(),
    };
    let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_create_and_get_tag() {
    let ctx = create_test_context();
    let app = create_test_app(&ctx);

    let (status, body) = send(
        app.clone(),
        Method::POST,
        "/api/v1/tags",
        Some(json!({
            "tag_id": "T1",
            "name": "T1",
            "plc_id": "plcA",
            "address": "ADDR1",
            "data_type": "Boolean",
            "initial_value": false
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["created"], json!(["T1"]));

    let (status, body) = send(app.clone(), Method::GET, "/api/v1/tags", None).await;
    assert_eq!(status, StatusCode::OK);
    let tags = body["tags"].as_array().unwrap();
    assert!(tags.iter().any(|t| t["tag_id"] == "T1"));

    let (status, body) = send(app, Method::GET, "/api/v1/tags/T1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tag"]["tag_id"], "T1");
    assert_eq!(body["tag"]["plc_id"], "plcA");
    assert_eq!(body["tag"]["value"], json!(false));
}

#[tokio::test]
async fn test_patch_update_and_delete() {
    let ctx = create_test_context();
    let app = create_test_app(&ctx);

    let (status, _) = send(
        app.clone(),
        Method::POST,
        "/api/v1/tags",
        Some(json!({ "tag_id": "T2", "name": "T2", "initial_value": 123 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        app.clone(),
        Method::PATCH,
        "/api/v1/tags/T2",
        Some(json!({ "name": "TWO", "value": 456 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], "T2");

    let (status, body) = send(app.clone(), Method::GET, "/api/v1/tags/T2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tag"]["name"], "TWO");
    assert_eq!(body["tag"]["value"], json!(456));

    let (status, body) = send(app.clone(), Method::DELETE, "/api/v1/tags/T2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], "T2");

    let (status, _) = send(app, Method::GET, "/api/v1/tags/T2", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_batch_create_and_import_replace_all() {
    let ctx = create_test_context();
    let app = create_test_app(&ctx);

    let (status, body) = send(
        app.clone(),
        Method::POST,
        "/api/v1/tags",
        Some(json!({ "tags": [
            { "tag_id": "A", "name": "A", "initial_value": 1 },
            { "tag_id": "B", "name": "B", "initial_value": 2 }
        ]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let created: Vec<&str> = body["created"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(created.contains(&"A") && created.contains(&"B"));

    let (status, body) = send(
        app.clone(),
        Method::PUT,
        "/api/v1/tags/import?replace_all=true",
        Some(json!({ "tags": [{ "tag_id": "X", "name": "X", "initial_value": 9 }] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["imported"], json!(["X"]));

    let (status, body) = send(app, Method::GET, "/api/v1/tags", None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["tags"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["tag_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["X"]);
}

#[tokio::test]
async fn test_import_without_replace_keeps_existing_tags() {
    let ctx = create_test_context();
    let app = create_test_app(&ctx);

    let (status, _) = send(
        app.clone(),
        Method::POST,
        "/api/v1/tags",
        Some(json!({ "tag_id": "KEEP" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        app.clone(),
        Method::PUT,
        "/api/v1/tags/import",
        Some(json!({ "tags": [{ "tag_id": "NEW" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(app, Method::GET, "/api/v1/tags", None).await;
    let mut ids: Vec<&str> = body["tags"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["tag_id"].as_str().unwrap())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["KEEP", "NEW"]);
}

#[tokio::test]
async fn test_decimal_values_serialize_with_trailing_zeros() {
    let ctx = create_test_context();
    // Stored decimals (e.g. supplied by a driver that preserves scale)
    // keep their textual form on the single-tag endpoint.
    let mut tag = Tag::new("t1");
    tag.plc_id = "p1".to_string();
    tag.address = "A1".to_string();
    ctx.store.add_tag(
        tag,
        Some(TagValue::Decimal(Decimal::from_str("1.2300").unwrap())),
    );
    let app = create_test_app(&ctx);

    let (status, body) = send(app, Method::GET, "/api/v1/tags/t1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tag"]["value"], json!("1.2300"));
}

#[tokio::test]
async fn test_invalid_payloads_are_rejected() {
    let ctx = create_test_context();
    let app = create_test_app(&ctx);

    // no tag_id or name
    let (status, body) = send(app.clone(), Method::POST, "/api/v1/tags", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    // data_type must be a string
    let (status, _) = send(
        app.clone(),
        Method::POST,
        "/api/v1/tags",
        Some(json!({ "tag_id": "T", "data_type": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // import body must carry a list
    let (status, body) = send(
        app.clone(),
        Method::PUT,
        "/api/v1/tags/import",
        Some(json!({ "tags": "not-a-list" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "tags must be a list");

    // nothing created along the way
    let (_, body) = send(app, Method::GET, "/api/v1/tags", None).await;
    assert!(body["tags"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_patch_validation() {
    let ctx = create_test_context();
    let app = create_test_app(&ctx);

    let (status, _) = send(
        app.clone(),
        Method::POST,
        "/api/v1/tags",
        Some(json!({ "tag_id": "P1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        app.clone(),
        Method::PATCH,
        "/api/v1/tags/P1",
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "empty payload");

    // only unknown fields: nothing updatable
    let (status, body) = send(
        app.clone(),
        Method::PATCH,
        "/api/v1/tags/P1",
        Some(json!({ "decimals": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "no updatable fields provided");

    let (status, _) = send(
        app,
        Method::PATCH,
        "/api/v1/tags/MISSING",
        Some(json!({ "name": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

//! Ingress API integration tests
//!
//! Drives the real router with `tower::ServiceExt::oneshot`: auth,
//! device registration and heartbeats, upload admission (size, media
//! type, rate limit, idempotent replay) and capture reads.

mod helpers;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use helpers::{expect_status, json_body, TestApp, TestOptions, TEST_DEVICE, TEST_TOKEN};
use tower::util::ServiceExt;

fn authed_json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_no_auth() {
    let app = TestApp::start().await;
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let body = expect_status(response, StatusCode::OK).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "chirp-cc");
}

#[tokio::test]
async fn test_upload_requires_auth() {
    let app = TestApp::start().await;

    let response = app
        .upload_as(None, TEST_DEVICE, 1, b"clip", "audio/wav")
        .await;
    let body = expect_status(response, StatusCode::UNAUTHORIZED).await;
    assert_eq!(body["error"], "auth_missing");

    let response = app
        .upload_as(Some("tok-wrong"), TEST_DEVICE, 1, b"clip", "audio/wav")
        .await;
    let body = expect_status(response, StatusCode::UNAUTHORIZED).await;
    assert_eq!(body["error"], "auth_invalid");
}

#[tokio::test]
async fn test_upload_foreign_device_forbidden() {
    let app = TestApp::start().await;

    // Second user owns a device; ada must not upload through it.
    let other = uuid::Uuid::new_v4();
    chirp_cc::db::users::insert(&app.db, other, "brynn", "hash", None, 1)
        .await
        .unwrap();
    chirp_cc::db::devices::register_or_update(&app.db, "CHIRP-OTHER", other, "1.0.0", None, 1)
        .await
        .unwrap();

    let response = app
        .upload_as(Some(TEST_TOKEN), "CHIRP-OTHER", 1, b"clip", "audio/wav")
        .await;
    let body = expect_status(response, StatusCode::FORBIDDEN).await;
    assert_eq!(body["error"], "not_owned");
}

#[tokio::test]
async fn test_upload_unknown_device_registered_on_first_use() {
    let app = TestApp::start().await;
    let response = app
        .upload_as(Some(TEST_TOKEN), "CHIRP-FRESH", 1, b"clip", "audio/wav")
        .await;
    expect_status(response, StatusCode::ACCEPTED).await;

    let device = chirp_cc::db::devices::get(&app.db, "CHIRP-FRESH")
        .await
        .unwrap()
        .expect("device row created on first upload");
    assert_eq!(device.user_id, app.user_id);
}

#[tokio::test]
async fn test_upload_unsupported_media() {
    let app = TestApp::start().await;
    let response = app
        .upload_as(Some(TEST_TOKEN), TEST_DEVICE, 1, b"<xml/>", "text/xml")
        .await;
    let body = expect_status(response, StatusCode::UNSUPPORTED_MEDIA_TYPE).await;
    assert_eq!(body["error"], "unsupported_media");
}

#[tokio::test]
async fn test_upload_payload_too_large() {
    let app = TestApp::start_with(TestOptions {
        max_upload_bytes: 1024,
        ..TestOptions::default()
    })
    .await;

    let oversized = vec![0u8; 2048];
    let response = app
        .upload_as(Some(TEST_TOKEN), TEST_DEVICE, 1, &oversized, "audio/wav")
        .await;
    let body = expect_status(response, StatusCode::PAYLOAD_TOO_LARGE).await;
    assert_eq!(body["error"], "payload_too_large");
}

#[tokio::test]
async fn test_upload_rate_limited_with_retry_after() {
    let app = TestApp::start_with(TestOptions {
        rate_per_minute: 30,
        rate_burst: 2,
        ..TestOptions::default()
    })
    .await;

    for seq in 1..=2 {
        let response = app.upload(TEST_DEVICE, seq, format!("clip-{seq}").as_bytes()).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = app.upload(TEST_DEVICE, 3, b"clip-3").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .expect("Retry-After header")
        .to_str()
        .unwrap()
        .parse::<u64>()
        .unwrap();
    assert!(retry_after >= 1);
}

#[tokio::test]
async fn test_duplicate_upload_is_idempotent() {
    let app = TestApp::start().await;

    let first = app.upload(TEST_DEVICE, 7, b"same clip").await;
    let first = expect_status(first, StatusCode::ACCEPTED).await;
    let first_id = first["capture_id"].as_str().unwrap().to_string();

    let replay = app.upload(TEST_DEVICE, 7, b"same clip").await;
    let replay = expect_status(replay, StatusCode::OK).await;
    assert_eq!(replay["capture_id"].as_str().unwrap(), first_id);

    // One capture row only.
    let rows: Vec<(i64,)> = sqlx::query_as("SELECT COUNT(*) FROM captures")
        .fetch_all(&app.db)
        .await
        .unwrap();
    assert_eq!(rows[0].0, 1);

    // The pipeline ran at most once for it.
    app.wait_terminal(first_id.parse().unwrap()).await;
    assert_eq!(app.classifier.calls(), 1);
}

#[tokio::test]
async fn test_upload_flows_to_processed() {
    let app = TestApp::start().await;
    app.classifier
        .respond_with(Ok(helpers::classification("amerob")));

    let response = app.upload(TEST_DEVICE, 1, b"robin song").await;
    let body = expect_status(response, StatusCode::ACCEPTED).await;
    assert_eq!(body["status"], "pending");

    let capture_id = body["capture_id"].as_str().unwrap().parse().unwrap();
    let capture = app.wait_terminal(capture_id).await;
    assert_eq!(capture.status.as_str(), "processed");
}

#[tokio::test]
async fn test_capture_list_pagination_and_get() {
    let app = TestApp::start().await;
    app.classifier
        .respond_with(Ok(helpers::classification("amerob")));

    let mut uploaded = Vec::new();
    for seq in 1..=5 {
        let response = app.upload(TEST_DEVICE, seq, format!("clip-{seq}").as_bytes()).await;
        let body = json_body(response).await;
        uploaded.push(body["capture_id"].as_str().unwrap().to_string());
    }
    for id in &uploaded {
        app.wait_terminal(id.parse().unwrap()).await;
    }

    // Page newest-first, two at a time.
    let body = expect_status(app.get("/v1/captures?limit=2").await, StatusCode::OK).await;
    let page = body["captures"].as_array().unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0]["capture_id"], uploaded[4].as_str());
    assert_eq!(page[1]["capture_id"], uploaded[3].as_str());
    let cursor = body["next_cursor"].as_str().unwrap().to_string();

    let body = expect_status(
        app.get(&format!("/v1/captures?limit=2&cursor={cursor}")).await,
        StatusCode::OK,
    )
    .await;
    let page = body["captures"].as_array().unwrap();
    assert_eq!(page[0]["capture_id"], uploaded[2].as_str());
    assert_eq!(page[1]["capture_id"], uploaded[1].as_str());

    // Single read joins the species.
    let body = expect_status(
        app.get(&format!("/v1/captures/{}", uploaded[0])).await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(body["status"], "processed");
    assert_eq!(body["species"]["code"], "amerob");

    // Foreign captures are invisible.
    let ghost = uuid::Uuid::new_v4();
    let response = app.get(&format!("/v1/captures/{ghost}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_cursor_rejected() {
    let app = TestApp::start().await;
    let response = app.get("/v1/captures?cursor=garbage").await;
    expect_status(response, StatusCode::BAD_REQUEST).await;
}

#[tokio::test]
async fn test_device_register_heartbeat_and_reads() {
    let app = TestApp::start().await;

    // Fresh registration: 201; replay: 200.
    let response = app
        .router
        .clone()
        .oneshot(authed_json_post(
            "/v1/devices/register",
            serde_json::json!({
                "device_id": "CHIRP-NEW",
                "firmware_version": "2.0.0",
                "capabilities": {"beamforming": true},
            }),
        ))
        .await
        .unwrap();
    let body = expect_status(response, StatusCode::CREATED).await;
    assert_eq!(body["device_id"], "CHIRP-NEW");
    assert_eq!(body["capabilities"]["beamforming"], true);

    let response = app
        .router
        .clone()
        .oneshot(authed_json_post(
            "/v1/devices/register",
            serde_json::json!({
                "device_id": "CHIRP-NEW",
                "firmware_version": "2.0.1",
            }),
        ))
        .await
        .unwrap();
    let body = expect_status(response, StatusCode::OK).await;
    assert_eq!(body["firmware_version"], "2.0.1");

    // Heartbeat updates telemetry.
    let response = app
        .router
        .clone()
        .oneshot(authed_json_post(
            "/v1/devices/CHIRP-NEW/heartbeat",
            serde_json::json!({
                "timestamp": "2025-06-01T13:00:00Z",
                "battery_voltage": 3.87,
                "rssi": -58,
            }),
        ))
        .await
        .unwrap();
    let body = expect_status(response, StatusCode::OK).await;
    assert_eq!(body["battery_voltage"], 3.87);
    assert_eq!(body["rssi"], -58);

    // Device list covers both seeded and new devices.
    let body = expect_status(app.get("/v1/devices").await, StatusCode::OK).await;
    assert_eq!(body["count"], 2);

    let body = expect_status(app.get("/v1/devices/CHIRP-NEW").await, StatusCode::OK).await;
    assert_eq!(body["firmware_version"], "2.0.1");

    // Unknown device heartbeat: 404.
    let response = app
        .router
        .clone()
        .oneshot(authed_json_post(
            "/v1/devices/CHIRP-GHOST/heartbeat",
            serde_json::json!({"timestamp": "2025-06-01T13:00:00Z"}),
        ))
        .await
        .unwrap();
    expect_status(response, StatusCode::NOT_FOUND).await;
}

#[tokio::test]
async fn test_species_endpoints() {
    let app = TestApp::start().await;
    app.classifier
        .respond_with(Ok(helpers::classification("pilwoo")));

    let response = app.upload(TEST_DEVICE, 1, b"drumming").await;
    let body = json_body(response).await;
    app.wait_terminal(body["capture_id"].as_str().unwrap().parse().unwrap())
        .await;

    let body = expect_status(app.get("/v1/species").await, StatusCode::OK).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["species"][0]["code"], "pilwoo");

    let body = expect_status(app.get("/v1/species/pilwoo").await, StatusCode::OK).await;
    assert_eq!(body["common_name"], "Pileated Woodpecker");
    assert_eq!(body["asset_url"], "mem://assets/pilwoo");

    let response = app.get("/v1/species/nosuch").await;
    expect_status(response, StatusCode::NOT_FOUND).await;
}

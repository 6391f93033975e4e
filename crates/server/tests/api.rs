//! HTTP-level tests of the API router against fake download tools.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::{Harness, SOURCE};
use fetchd_server::create_app;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(app, Method::GET, uri, None).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn submit(app: &Router, format: &str) -> (StatusCode, Value) {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/jobs",
        Some(json!({ "url": SOURCE, "formatId": format })),
    )
    .await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn poll_until_terminal(app: &Router, id: &str) -> Value {
    for _ in 0..500 {
        let (status, view) = get_json(app, &format!("/api/jobs/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        if matches!(
            view["status"].as_str(),
            Some("complete" | "failed" | "cancelled")
        ) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {id} never finished");
}

#[tokio::test]
async fn test_submit_poll_and_download() {
    let h = Harness::new(common::SUCCESS, |_| {});
    let app = create_app(h.orchestrator.clone());

    let (status, body) = submit(&app, "18").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    let id = body["jobId"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 22);

    let view = poll_until_terminal(&app, &id).await;
    assert_eq!(view["status"], "complete");
    assert_eq!(view["progressPercent"], 100.0);
    assert!(view.get("errorDetail").is_none() || view["errorDetail"].is_null());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/downloads/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(headers[header::CONTENT_LENGTH], "4");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        format!("attachment; filename=\"{id}.mp4\"").as_str()
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"data");
}

#[tokio::test]
async fn test_stream_of_finished_job_ends_with_terminal_event() {
    let h = Harness::new(common::SUCCESS, |_| {});
    let app = create_app(h.orchestrator.clone());
    let (_, body) = submit(&app, "18").await;
    let id = body["jobId"].as_str().unwrap().to_string();
    poll_until_terminal(&app, &id).await;

    let (status, body) = tokio::time::timeout(
        Duration::from_secs(5),
        send(&app, Method::GET, &format!("/api/jobs/{id}/stream"), None),
    )
    .await
    .expect("stream closes after the terminal event");
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("event: complete"), "stream was: {text}");
    assert!(text.contains(&format!("\"id\":\"{id}\"")));
}

#[tokio::test]
async fn test_stream_of_live_job_reports_progress_in_order() {
    let h = Harness::new(common::SLOW_SUCCESS, |_| {});
    let app = create_app(h.orchestrator.clone());
    let (_, body) = submit(&app, "18").await;
    let id = body["jobId"].as_str().unwrap().to_string();

    let (status, body) = tokio::time::timeout(
        Duration::from_secs(10),
        send(&app, Method::GET, &format!("/api/jobs/{id}/stream"), None),
    )
    .await
    .expect("stream closes once the job completes");
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).unwrap();
    let events: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("event: "))
        .collect();
    let views: Vec<Value> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();

    assert_eq!(events.len(), views.len());
    assert!(events.len() >= 2, "expected live updates, got: {text}");
    assert_eq!(events.last().copied(), Some("complete"));
    assert!(events[..events.len() - 1]
        .iter()
        .all(|e| matches!(*e, "queued" | "running")));

    let percents: Vec<f64> = views
        .iter()
        .map(|v| v["progressPercent"].as_f64().unwrap())
        .collect();
    assert!(
        percents.windows(2).all(|w| w[0] <= w[1]),
        "percent went backwards: {percents:?}"
    );
    assert!(percents.contains(&10.0), "missing mid-run progress: {percents:?}");
    assert_eq!(percents.last().copied(), Some(100.0));
}

#[tokio::test]
async fn test_malformed_submit_body_returns_json_400() {
    let h = Harness::new(common::SUCCESS, |_| {});
    let app = create_app(h.orchestrator.clone());

    for (content_type, raw) in [
        ("application/json", "{\"url\": "),
        ("application/json", "[1, 2, 3]"),
        ("text/plain", "url=x"),
    ] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/jobs")
                    .header(header::CONTENT_TYPE, content_type)
                    .body(Body::from(raw))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {raw:?}");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Bad request");
        assert!(body["details"].is_string());
    }
    assert!(h.spawned().is_empty());
}

#[tokio::test]
async fn test_finished_job_cannot_be_cancelled_but_can_be_purged() {
    let h = Harness::new(common::SUCCESS, |_| {});
    let app = create_app(h.orchestrator.clone());
    let (_, body) = submit(&app, "18").await;
    let id = body["jobId"].as_str().unwrap().to_string();
    poll_until_terminal(&app, &id).await;

    let (status, _) = send(&app, Method::POST, &format!("/api/jobs/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, Method::DELETE, &format!("/api/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(h.files_for(&fetchd_core::JobId::parse(&id).unwrap()).is_empty());

    let (status, _) = get_json(&app, &format!("/api/jobs/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, Method::GET, &format!("/api/downloads/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_running_job_over_http() {
    let h = Harness::new(common::HANG, |_| {});
    let app = create_app(h.orchestrator.clone());
    let (_, body) = submit(&app, "18").await;
    let id = body["jobId"].as_str().unwrap().to_string();

    let (status, body) = send(&app, Method::POST, &format!("/api/jobs/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let ack: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(ack["id"], id.as_str());

    let view = poll_until_terminal(&app, &id).await;
    assert_eq!(view["status"], "cancelled");
    assert_eq!(view["cancelRequested"], true);

    let (status, _) = send(&app, Method::GET, &format!("/api/downloads/{id}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_invalid_submissions_return_400() {
    let h = Harness::new(common::SUCCESS, |_| {});
    let app = create_app(h.orchestrator.clone());

    let (status, body) = submit(&app, "18 && reboot").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid input");

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/jobs",
        Some(json!({ "url": "https://evil.example.com/v", "formatId": "18" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.spawned().is_empty());
}

#[tokio::test]
async fn test_unknown_id_is_404_and_malformed_id_is_400() {
    let h = Harness::new(common::SUCCESS, |_| {});
    let app = create_app(h.orchestrator.clone());

    let (status, body) = get_json(&app, "/api/jobs/AAAAAAAAAAAAAAAAAAAAAA").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Job not found");

    let (status, body) = get_json(&app, "/api/downloads/..%2F..%2Fetc%2Fpasswd").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid input");
}

#[tokio::test]
async fn test_health_reports_tool_and_directory() {
    let h = Harness::new(common::SUCCESS, |_| {});
    let app = create_app(h.orchestrator.clone());

    let (status, body) = get_json(&app, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["tool"]["available"], true);
    assert_eq!(body["tool"]["version"], "2024.08.06");
    assert_eq!(body["downloadDir"], true);
    assert!(body["uptimeSecs"].is_u64());
    assert!(body.get("uptime_secs").is_none());
}

#[tokio::test]
async fn test_health_degraded_without_tool() {
    let h = Harness::new(common::SUCCESS, |c| {
        c.tool_path = "/nonexistent/fetchd-test-tool".into();
    });
    let app = create_app(h.orchestrator.clone());

    let (status, body) = get_json(&app, "/api/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["tool"]["available"], false);
}

#[tokio::test]
async fn test_metrics_endpoint_renders_after_init() {
    fetchd_server::init_metrics();
    let h = Harness::new(common::SUCCESS, |_| {});
    let app = create_app(h.orchestrator.clone());
    let (_, body) = submit(&app, "18").await;
    poll_until_terminal(&app, body["jobId"].as_str().unwrap()).await;

    let (status, body) = send(&app, Method::GET, "/api/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("fetchd_jobs_submitted_total"), "metrics were: {text}");
}

//! End-to-end tests for the HTTP surface
//!
//! The router runs against SQLite in memory with the default cache enabled.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use linkpulse::app::Services;
use linkpulse::config::{AnalyticsConfig, Config};
use linkpulse::models::{ClickEvent, RollupPeriod};
use linkpulse::storage::SqliteStore;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    services: Services,
}

/// One connection, otherwise every connection sees its own in-memory database
async fn create_test_app() -> TestApp {
    let store = Arc::new(SqliteStore::new("sqlite::memory:", 1).await.unwrap());
    store.init().await.unwrap();
    store.register_link("abc", "alice").await.unwrap();
    store.register_link("xyz", "alice").await.unwrap();
    store.register_link("bob-link", "bob").await.unwrap();

    let config = Config {
        analytics: AnalyticsConfig {
            visitor_salt: Some("test-salt".to_string()),
            ..AnalyticsConfig::default()
        },
        ..Config::default()
    };
    let services = Services::build(store, &config).unwrap();
    TestApp {
        router: services.router(true),
        services,
    }
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
}

async fn record(app: &TestApp, link: &str, country: &str, minutes: i64, ip: &str) {
    let mut event = ClickEvent::new(link, base_time() + chrono::Duration::minutes(minutes), "");
    event.location.country_code = Some(country.to_string());
    let ip: IpAddr = ip.parse().unwrap();
    app.services.recorder.record(event, ip).await.unwrap();
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get_json(app: &TestApp, uri: &str, user: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri);
    if let Some(user) = user {
        builder = builder.header("X-User-Id", user);
    }
    let (status, body) = send(app, builder.body(Body::empty()).unwrap()).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_health_needs_no_caller() {
    let app = create_test_app().await;
    let (status, body) = get_json(&app, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_missing_caller_is_unauthorized() {
    let app = create_test_app().await;
    let (status, body) = get_json(&app, "/api/links/abc/summary", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("X-User-Id"));
}

#[tokio::test]
async fn test_summary_breakdown() {
    let app = create_test_app().await;
    record(&app, "abc", "US", 0, "203.0.113.1").await;
    record(&app, "abc", "US", 5, "203.0.113.2").await;
    record(&app, "abc", "DE", 10, "203.0.113.1").await;

    let (status, body) = get_json(&app, "/api/links/abc/summary", Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalClicks"], 3);
    assert_eq!(body["uniqueVisitors"], 2);
    assert_eq!(body["topCountries"][0]["value"], "US");
    assert_eq!(body["topCountries"][0]["percentage"], 66.67);
    assert_eq!(body["topCountries"][1]["value"], "DE");
    assert_eq!(body["topCountries"][1]["percentage"], 33.33);
}

#[tokio::test]
async fn test_ownership_errors() {
    let app = create_test_app().await;

    let (status, _) = get_json(&app, "/api/links/nope/geographic", Some("alice")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get_json(&app, "/api/links/bob-link/devices", Some("alice")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_window_validation() {
    let app = create_test_app().await;

    let (status, _) = get_json(
        &app,
        "/api/links/abc/referrers?startDate=2024-03-05&endDate=2024-03-01",
        Some("alice"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get_json(
        &app,
        "/api/links/abc/timeline?granularity=hour&startDate=2024-01-01&endDate=2024-01-09",
        Some("alice"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get_json(
        &app,
        "/api/links/abc/timeline?granularity=fortnight",
        Some("alice"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_timeline_respects_window() {
    let app = create_test_app().await;
    record(&app, "abc", "US", 0, "203.0.113.1").await;
    record(&app, "abc", "US", 90, "203.0.113.2").await;
    record(&app, "abc", "US", 60 * 30, "203.0.113.3").await;

    let (status, body) = get_json(
        &app,
        "/api/links/abc/timeline?granularity=hour&startDate=2024-03-04&endDate=2024-03-05",
        Some("alice"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalClicks"], 2);
    assert_eq!(body["points"][0]["bucket"], "2024-03-04 10:00");
    assert_eq!(body["points"][1]["bucket"], "2024-03-04 11:00");
}

#[tokio::test]
async fn test_compare_limits() {
    let app = create_test_app().await;
    record(&app, "abc", "US", 0, "203.0.113.1").await;

    let (status, body) = get_json(&app, "/api/compare?ids=abc,xyz", Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["links"][0]["share"], 100.0);
    assert_eq!(body["links"][1]["totalClicks"], 0);

    let ids: Vec<String> = (0..11).map(|i| format!("l{i}")).collect();
    let (status, _) = get_json(
        &app,
        &format!("/api/compare?ids={}", ids.join(",")),
        Some("alice"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get_json(&app, "/api/compare?ids=abc,bob-link", Some("alice")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_custom_report() {
    let app = create_test_app().await;
    record(&app, "abc", "US", 0, "203.0.113.1").await;
    record(&app, "xyz", "FR", 0, "203.0.113.2").await;

    let request = |body: Value| {
        Request::builder()
            .method("POST")
            .uri("/api/reports")
            .header("X-User-Id", "alice")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    let (status, body) = send(
        &app,
        request(json!({ "linkIds": ["abc", "xyz"], "dimensions": ["country", "device"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let report: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(report["totalClicks"], 2);
    assert_eq!(report["links"].as_array().unwrap().len(), 2);
    assert_eq!(report["breakdowns"][0]["dimension"], "country");
    assert_eq!(report["breakdowns"][1]["items"][0]["value"], "desktop");

    let (status, _) = send(
        &app,
        request(json!({ "linkIds": ["abc"], "dimensions": ["shoeSize"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_event_paging_with_signed_cursor() {
    let app = create_test_app().await;
    for i in 0..5 {
        record(&app, "abc", "US", i, "203.0.113.1").await;
    }

    let mut seen = Vec::new();
    let mut uri = "/api/links/abc/events?limit=2".to_string();
    loop {
        let (status, body) = get_json(&app, &uri, Some("alice")).await;
        assert_eq!(status, StatusCode::OK);
        for event in body["events"].as_array().unwrap() {
            seen.push(event["id"].as_i64().unwrap());
        }
        match body["nextCursor"].as_str() {
            Some(cursor) => uri = format!("/api/links/abc/events?limit=2&cursor={cursor}"),
            None => break,
        }
    }
    assert_eq!(seen.len(), 5);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));

    let (_, body) = get_json(&app, "/api/links/abc/events?limit=2", Some("alice")).await;
    let cursor = body["nextCursor"].as_str().unwrap();
    let tampered = format!("x{}", &cursor[1..]);
    let (status, _) = get_json(
        &app,
        &format!("/api/links/abc/events?cursor={tampered}"),
        Some("alice"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_csv_export_streams_every_event() {
    let app = create_test_app().await;
    for i in 0..250 {
        record(&app, "abc", "US", i, &format!("198.51.100.{}", i % 200)).await;
    }

    let request = Request::builder()
        .uri("/api/links/abc/export?format=csv")
        .header("X-User-Id", "alice")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/csv"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 251);
    assert!(lines[0].starts_with("id,linkId,timestamp"));
}

#[tokio::test]
async fn test_json_export_is_valid_array() {
    let app = create_test_app().await;
    for i in 0..120 {
        record(&app, "abc", "US", i, "203.0.113.1").await;
    }

    let request = Request::builder()
        .uri("/api/links/abc/export?format=json")
        .header("X-User-Id", "alice")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let events: Vec<Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(events.len(), 120);
}

#[tokio::test]
async fn test_rollups_and_job_history() {
    let app = create_test_app().await;
    record(&app, "abc", "US", 0, "203.0.113.1").await;
    record(&app, "abc", "US", 1, "203.0.113.1").await;

    let run = app
        .services
        .scheduler
        .run_rollup_for(RollupPeriod::Day, base_time())
        .await;
    assert_eq!(run.processed, 1);

    let (status, body) = get_json(&app, "/api/links/abc/rollups?period=day", Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["totalClicks"], 2);
    assert_eq!(body[0]["uniqueVisitors"], 1);
    assert_eq!(body[0]["periodStart"], "2024-03-04T00:00:00Z");

    let (status, body) = get_json(&app, "/api/jobs/history", Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["job"], "daily_rollup");
    assert_eq!(body[0]["outcome"]["status"], "succeeded");
}

#[tokio::test]
async fn test_user_endpoints() {
    let app = create_test_app().await;
    let now = Utc::now();
    let recent = (now - base_time()).num_minutes() - 30;
    record(&app, "abc", "US", recent, "203.0.113.1").await;
    record(&app, "xyz", "US", recent, "203.0.113.2").await;
    record(&app, "xyz", "US", recent, "203.0.113.3").await;

    let (status, body) = get_json(&app, "/api/me/overview", Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalLinks"], 2);
    assert_eq!(body["totalClicks"], 3);
    assert_eq!(body["topLinks"][0]["value"], "xyz");

    let (status, body) = get_json(&app, "/api/me/trending?period=day", Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["linkId"].as_str().unwrap())
        .collect();
    // Both grew from zero; xyz wins on absolute growth
    assert_eq!(ids, vec!["xyz", "abc"]);

    let (status, _) = get_json(&app, "/api/me/trending?period=decade", Some("alice")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = get_json(&app, "/api/me/alerts", Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().is_some());
}

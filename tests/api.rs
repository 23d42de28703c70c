mod support;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use support::*;

async fn patch_config(server: &TestServer, body: &str) -> TestResponse {
    server
        .client
        .send_body(
            Method::PATCH,
            &server.url("/api/cache/config"),
            HeaderMap::new(),
            Bytes::from(body.to_string()),
        )
        .await
}

#[tokio::test]
async fn test_cache_stats_and_clear() {
    let file = gen_file(3 * MIB);
    let server = TestServer::start().await;
    server.app.library().register("42", &file.path).unwrap();

    server.stream("42", Some("bytes=0-1023")).await;
    let cache = server.app.cache().clone();
    wait_until("admission", move || cache.resident_segments("42") == 1).await;
    server.stream("42", Some("bytes=0-1023")).await;

    let resp = server.get("/api/cache/stats", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let stats = resp.json();
    assert_eq!(stats["hitCount"], 1);
    assert_eq!(stats["missCount"], 1);
    assert_eq!(stats["hitRatePercent"], 50.0);
    assert_eq!(stats["entries"], 1);
    assert_eq!(stats["totalBytesResident"], 2 * MIB as u64);
    assert_eq!(stats["perVideoAccessCounts"]["42"], 1);
    assert_eq!(stats["keys"][0], "video_42_segment_0");

    let resp = server.request(Method::POST, "/api/cache/clear", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.json()["cleared"], 1);
    let stats = server.get("/api/cache/stats", |_| {}).await.json();
    assert_eq!(stats["entries"], 0);
    assert_eq!(stats["totalBytesResident"], 0);
    assert_eq!(stats["perVideoAccessCounts"]["42"], 1);

    let resp = server.request(Method::DELETE, "/api/cache", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server.request(Method::POST, "/api/cache/stats/reset", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let stats = resp.json();
    assert_eq!(stats["hitCount"], 0);
    assert_eq!(stats["missCount"], 0);
    assert!(stats["perVideoAccessCounts"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn test_cache_config_roundtrip() {
    let server = TestServer::start().await;

    let resp = server.get("/api/cache/config", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let cfg = resp.json();
    assert_eq!(cfg["maxCacheSize"], 512 * 1024 * 1024u64);
    assert_eq!(cfg["stdTTL"], 3600);
    assert_eq!(cfg["maxSegmentsPerVideo"], 10);

    let resp = patch_config(&server, r#"{"popularityThreshold": 5, "stdTTL": 0}"#).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.json()["popularityThreshold"], 5);
    assert_eq!(server.app.cache().config().popularity_threshold, 5);
    assert_eq!(server.app.cache().config().ttl(), None);

    for body in [
        "not json",
        r#"{"maxCacheSize": 0}"#,
        r#"{"evictionTargetRatio": 0}"#,
        r#"{"unknownField": true}"#,
    ] {
        let resp = patch_config(&server, body).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{body}");
        assert!(resp.json()["error"].is_string());
    }
    assert_eq!(server.app.cache().config().popularity_threshold, 5);

    let resp = server.request(Method::PUT, "/api/cache/config", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_cache_admin_is_local_only() {
    let server = TestServer::start().await;
    for path in ["/api/cache/stats", "/api/cache/config", "/metrics"] {
        let resp = server
            .get(path, |headers| {
                headers.insert("Host", "videos.example.com".parse().unwrap());
            })
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{path}");
    }

    let resp = server
        .get("/api/videos", |headers| {
            headers.insert("Host", "videos.example.com".parse().unwrap());
        })
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_allow_listed_host() {
    let server = TestServer::start_with(|cfg| {
        cfg.server.local_api_allow_hosts = vec!["admin.internal".to_string()];
    })
    .await;
    let resp = server
        .get("/api/cache/stats", |headers| {
            headers.insert("Host", "admin.internal:8080".parse().unwrap());
        })
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_video_listing() {
    let file = gen_file(1000);
    let server = TestServer::start().await;
    server.app.library().register("42", &file.path).unwrap();

    let resp = server.get("/api/videos", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let videos = resp.json();
    assert_eq!(videos.as_array().unwrap().len(), 1);
    assert_eq!(videos[0]["id"], "42");
    assert_eq!(videos[0]["streamUrl"], "/videos/42/stream");

    let resp = server.get("/api/videos/42", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.json()["size"], 1000);

    let resp = server.get("/api/videos/nope", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_library_rescan() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.mp4"), random_bytes(100)).unwrap();
    let root = dir.path().to_string_lossy().to_string();
    let server = TestServer::start_with(|cfg| cfg.library.paths = vec![root]).await;
    assert_eq!(server.app.library().len(), 1);

    std::fs::write(dir.path().join("b.webm"), random_bytes(100)).unwrap();
    let resp = server.request(Method::POST, "/api/library/rescan", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.json()["total"], 2);
    assert_eq!(server.app.library().len(), 2);
}

#[tokio::test]
async fn test_health_version_metrics() {
    let server = TestServer::start().await;

    let resp = server.get("/healthz/startup-probe", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"ok");
    let resp = server.get("/healthz/liveness-probe", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = server.get("/healthz/readiness-probe", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server.get("/version", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let info = resp.json();
    assert_eq!(info["name"], "marquee");
    assert!(info["version"].is_string());

    let resp = server.get("/metrics", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = String::from_utf8_lossy(resp.body()).to_string();
    assert!(body.contains("marquee_requests_code_total"));
    assert!(body.contains("marquee_segment_lookups_total"));

    let resp = server.get("/nope", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let server = TestServer::start().await;
    let resp = server
        .get("/healthz/liveness-probe", |headers| {
            headers.insert("X-Request-ID", "abc123".parse().unwrap());
        })
        .await;
    assert_eq!(resp.header("X-Request-ID"), "abc123");
}

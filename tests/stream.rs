mod support;

use http::{Method, StatusCode};
use support::*;

const SEGMENT: usize = 2 * MIB;

async fn server_with(file: &MockFile, id: &str) -> TestServer {
    let server = TestServer::start().await;
    server.app.library().register(id, &file.path).expect("register");
    server
}

async fn wait_for_segment(server: &TestServer, id: &str, count: usize) {
    let cache = server.app.cache().clone();
    let id = id.to_string();
    wait_until("background admission", move || cache.resident_segments(&id) >= count).await;
}

#[tokio::test]
async fn test_first_megabyte_miss_then_hit() {
    let file = gen_file(5 * MIB);
    let server = server_with(&file, "42").await;

    let resp = server.stream("42", Some("bytes=0-1048575")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.header("X-Cache"), "MISS");
    assert_eq!(resp.header("Content-Range"), "bytes 0-1048575/5242880");
    assert_eq!(resp.header("Content-Length"), "1048576");
    assert_eq!(resp.header("Accept-Ranges"), "bytes");
    assert_eq!(resp.header("Content-Type"), "video/mp4");
    assert!(resp.header("Cache-Control").contains("max-age=3600"));
    assert!(!resp.header("ETag").is_empty());
    assert!(!resp.header("Last-Modified").is_empty());
    assert!(!resp.header("X-Request-ID").is_empty());
    assert_eq!(hash_bytes(resp.body()), hash_bytes(file.range(0, MIB - 1)));

    // the whole first segment is admitted, nothing else
    wait_for_segment(&server, "42", 1).await;
    let stats = server.app.cache().stats();
    assert_eq!(stats.keys, vec!["video_42_segment_0"]);
    assert_eq!(stats.total_bytes_resident, SEGMENT as u64);

    let resp = server.stream("42", Some("bytes=0-1048575")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.header("X-Cache"), "HIT");
    assert_eq!(resp.body().len(), MIB);
    assert_eq!(hash_bytes(resp.body()), hash_bytes(file.range(0, MIB - 1)));
    assert_eq!(server.app.cache().access_count("42"), 1);
}

#[tokio::test]
async fn test_hit_shapes() {
    let file = gen_file(5 * MIB);
    let server = server_with(&file, "7").await;

    let resp = server.stream("7", Some("bytes=2097152-4194303")).await;
    assert_eq!(resp.header("X-Cache"), "MISS");
    wait_for_segment(&server, "7", 1).await;

    // exactly the cached segment
    let resp = server.stream("7", Some("bytes=2097152-4194303")).await;
    assert_eq!(resp.header("X-Cache"), "HIT");
    assert_eq!(resp.body().as_ref(), file.range(SEGMENT, 2 * SEGMENT - 1));

    // shorter than the cached segment
    let resp = server.stream("7", Some("bytes=2097152-2097251")).await;
    assert_eq!(resp.header("X-Cache"), "HIT");
    assert_eq!(resp.body().as_ref(), file.range(SEGMENT, SEGMENT + 99));

    // past the cached segment: cached head plus file tail
    let resp = server.stream("7", Some("bytes=2097152-5242879")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.header("X-Cache"), "HIT");
    assert_eq!(resp.header("Content-Range"), "bytes 2097152-5242879/5242880");
    assert_eq!(resp.body().len(), 5 * MIB - SEGMENT);
    assert_eq!(
        hash_bytes(resp.body()),
        hash_bytes(file.range(SEGMENT, 5 * MIB - 1))
    );
}

#[tokio::test]
async fn test_last_segment_is_short() {
    let file = gen_file(5 * MIB);
    let server = server_with(&file, "tail").await;

    let resp = server.stream("tail", Some("bytes=4194304-")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.header("Content-Range"), "bytes 4194304-5242879/5242880");
    assert_eq!(resp.body().len(), MIB);

    wait_for_segment(&server, "tail", 1).await;
    let cached = server.app.cache().get_segment("tail", 2).expect("segment 2");
    assert_eq!(cached.len(), MIB);
    assert_eq!(cached.as_ref(), file.range(2 * SEGMENT, 5 * MIB - 1));
}

#[tokio::test]
async fn test_open_ended_range_is_bounded_to_one_segment() {
    let file = gen_file(5 * MIB);
    let server = server_with(&file, "42").await;

    let resp = server.stream("42", Some("bytes=0-")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.header("Content-Range"), "bytes 0-2097151/5242880");
    assert_eq!(resp.body().len(), SEGMENT);
}

#[tokio::test]
async fn test_unaligned_range_bypasses_cache() {
    let file = gen_file(3 * MIB);
    let server = server_with(&file, "42").await;

    let resp = server.stream("42", Some("bytes=100-199")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.header("X-Cache"), "BYPASS");
    assert_eq!(resp.header("Content-Range"), "bytes 100-199/3145728");
    assert_eq!(resp.body().as_ref(), file.range(100, 199));

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let stats = server.app.cache().stats();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.miss_count, 0);
}

#[tokio::test]
async fn test_whole_file_without_range() {
    let file = gen_file(3 * MIB + 17);
    let server = server_with(&file, "42").await;

    let resp = server.stream("42", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.header("X-Cache"), "BYPASS");
    assert_eq!(resp.header("Accept-Ranges"), "bytes");
    assert!(resp.headers().get("Content-Range").is_none());
    assert_eq!(resp.body().len(), file.data.len());
    assert_eq!(hash_bytes(resp.body()), hash_bytes(&file.data));
}

#[tokio::test]
async fn test_malformed_range_is_ignored() {
    let file = gen_file(4096);
    let server = server_with(&file, "42").await;

    for raw in ["items=0-10", "bytes=0-10,20-30", "bytes=50-10"] {
        let resp = server.stream("42", Some(raw)).await;
        assert_eq!(resp.status(), StatusCode::OK, "{raw}");
        assert_eq!(resp.body().len(), 4096);
    }
}

#[tokio::test]
async fn test_unsatisfiable_range() {
    let file = gen_file(5 * MIB);
    let server = server_with(&file, "42").await;

    let resp = server.stream("42", Some("bytes=5242880-")).await;
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(resp.header("Content-Range"), "bytes */5242880");
    assert!(resp.body().is_empty());
}

#[tokio::test]
async fn test_empty_file() {
    let file = gen_file(0);
    let server = server_with(&file, "empty").await;

    let resp = server.stream("empty", Some("bytes=0-")).await;
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(resp.header("Content-Range"), "bytes */0");

    let resp = server.stream("empty", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.body().is_empty());
}

#[tokio::test]
async fn test_unknown_video() {
    let server = TestServer::start().await;
    let resp = server.stream("missing", Some("bytes=0-10")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = server.get("/videos/a/b/stream", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deleted_file_is_internal_error() {
    let file = gen_file(1024);
    let server = server_with(&file, "42").await;
    std::fs::remove_file(&file.path).unwrap();

    let resp = server.stream("42", Some("bytes=0-10")).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.body().as_ref(), b"internal server error");
}

#[tokio::test]
async fn test_head_request() {
    let file = gen_file(3 * MIB);
    let server = server_with(&file, "42").await;

    let resp = server
        .request(Method::HEAD, "/videos/42/stream", |headers| {
            headers.insert("Range", "bytes=0-1023".parse().unwrap());
        })
        .await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.header("Content-Range"), "bytes 0-1023/3145728");
    assert!(resp.body().is_empty());

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(server.app.cache().stats().entries, 0);

    let resp = server.request(Method::POST, "/videos/42/stream", |_| {}).await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_if_none_match() {
    let file = gen_file(4096);
    let server = server_with(&file, "42").await;

    let etag = server.stream("42", None).await.header("ETag").to_string();
    assert!(etag.starts_with("\"42-"));

    let resp = server
        .get("/videos/42/stream", |headers| {
            headers.insert("If-None-Match", etag.parse().unwrap());
        })
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    assert!(resp.body().is_empty());

    let resp = server
        .get("/videos/42/stream", |headers| {
            headers.insert("If-None-Match", "\"other\"".parse().unwrap());
        })
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_changed_file_drops_cached_segments() {
    let mut file = gen_file(3 * MIB);
    let server = server_with(&file, "42").await;

    server.stream("42", Some("bytes=0-1023")).await;
    wait_for_segment(&server, "42", 1).await;
    let resp = server.stream("42", Some("bytes=0-1023")).await;
    assert_eq!(resp.header("X-Cache"), "HIT");

    file.rewrite(3 * MIB + 1);
    let resp = server.stream("42", Some("bytes=0-1023")).await;
    assert_eq!(resp.header("X-Cache"), "MISS");
    assert_eq!(resp.header("Content-Range"), "bytes 0-1023/3145729");
    assert_eq!(resp.body().as_ref(), file.range(0, 1023));
}

#[tokio::test]
async fn test_popularity_threshold_blocks_background_admission() {
    let file = gen_file(3 * MIB);
    let server = TestServer::start_with(|cfg| cfg.cache.popularity_threshold = 2).await;
    server.app.library().register("42", &file.path).unwrap();

    let resp = server.stream("42", Some("bytes=0-1023")).await;
    assert_eq!(resp.header("X-Cache"), "MISS");
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(server.app.cache().resident_segments("42"), 0);
}

#[test]
fn test_segment_arithmetic() {
    use marquee::http_range::RangeSpec;
    use marquee::stream::StreamSettings;

    let settings = StreamSettings {
        segment_size: SEGMENT as u64,
        max_age: std::time::Duration::from_secs(60),
    };
    assert_eq!(settings.segment_index(0), 0);
    assert_eq!(settings.segment_index(SEGMENT as u64 - 1), 0);
    assert_eq!(settings.segment_index(SEGMENT as u64), 1);
    assert!(settings.is_aligned(4 * MIB as u64));
    assert!(!settings.is_aligned(100));

    let size = 5 * MIB as u64;
    assert_eq!(settings.segment_bounds(0, size), (0, SEGMENT as u64 - 1));
    assert_eq!(settings.segment_bounds(2, size), (4 * MIB as u64, size - 1));

    let open = RangeSpec {
        start: 0,
        end: size - 1,
        open_ended: true,
    };
    assert_eq!(settings.bound_range(open).end, SEGMENT as u64 - 1);
    let closed = RangeSpec {
        open_ended: false,
        ..open
    };
    assert_eq!(settings.bound_range(closed).end, size - 1);
}

mod support;

use std::io::Read;
use std::time::Duration;

use support::*;

async fn settle() {
    // Admission commits before the response body is fully delivered, but
    // give background work (watchdog, temp cleanup) a moment regardless.
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn serves_robots_and_favicon() {
    let origin = MockOrigin::start(&[]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    let (head, body) = raw_request(proxy.addr, &get_request(&host, "/robots.txt", "")).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"User-agent: *\nDisallow: /");

    let (head, _) = raw_request(proxy.addr, &get_request(&host, "/favicon.ico", "")).await;
    assert_eq!(status_of(&head), 404);
    assert_eq!(origin.request_count(), 0);
}

#[tokio::test]
async fn miss_populates_cache_and_hit_skips_origin() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"hello cache")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    let (head, body) = raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"hello cache");
    assert_eq!(header_of(&head, "accept-ranges"), Some("none"));
    assert_eq!(header_of(&head, "content-type"), Some("text/plain"));
    assert_eq!(origin.request_count(), 1);

    settle().await;

    let (head, body) = raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"hello cache");
    assert_eq!(header_of(&head, "accept-ranges"), Some("bytes"));
    assert_eq!(header_of(&head, "content-type"), Some("text/plain"));
    assert_eq!(header_of(&head, "x-origin"), Some("mock"));
    assert!(header_of(&head, "last-modified").is_some());
    assert_eq!(origin.request_count(), 1, "hit must not refetch");
}

#[tokio::test]
async fn origin_status_passes_through_on_miss() {
    let origin = MockOrigin::start(&[]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    let (head, _) = raw_request(proxy.addr, &get_request(&host, "/nope.txt", "")).await;
    assert_eq!(status_of(&head), 404);
}

#[tokio::test]
async fn rejects_path_traversal() {
    let origin = MockOrigin::start(&[("/assets/etc/passwd", b"nope")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    let (head, _) =
        raw_request(proxy.addr, &get_request(&host, "/a/../../etc/passwd", "")).await;
    assert_eq!(status_of(&head), 400);
    assert_eq!(origin.request_count(), 0);
}

#[tokio::test]
async fn rejects_unknown_virtual_host() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"data")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;

    let (head, _) =
        raw_request(proxy.addr, &get_request("evil.example.com", "/a.txt", "")).await;
    assert_eq!(status_of(&head), 400);
}

#[tokio::test]
async fn rejects_malformed_modified_parameter() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"data")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    let (head, _) =
        raw_request(proxy.addr, &get_request(&host, "/a.txt?modified=soon", "")).await;
    assert_eq!(status_of(&head), 400);
}

#[tokio::test]
async fn modified_parameter_requires_a_valid_signature() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"hello")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    let (head, _) =
        raw_request(proxy.addr, &get_request(&host, "/a.txt?modified=1234", "")).await;
    assert_eq!(status_of(&head), 403);
    assert_eq!(origin.request_count(), 0);
}

#[tokio::test]
async fn signed_modified_purges_stale_copy() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"hello")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    let (_, body) = raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    assert_eq!(body, b"hello");
    settle().await;

    origin.put("/assets/a.txt", b"world!");
    let query = signed_query("GET", &host, "/a.txt", now_unix() + 1, 0);
    let (head, body) = raw_request(
        proxy.addr,
        &get_request(&host, &format!("/a.txt?{query}"), ""),
    )
    .await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"world!");
    assert_eq!(origin.request_count(), 2, "stale copy must be refetched");
}

#[tokio::test]
async fn stats_require_signature_and_report_counters() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"hello")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    let (head, _) = raw_request(proxy.addr, &get_request(&host, "/cacheStats", "")).await;
    assert_eq!(status_of(&head), 403);

    raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    settle().await;

    let query = signed_query("GET", &host, "/cacheStats", 0, 0);
    let (head, body) = raw_request(
        proxy.addr,
        &get_request(&host, &format!("/cacheStats?{query}"), ""),
    )
    .await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(header_of(&head, "content-type"), Some("application/json"));
    let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["BytesIn"], 5);
    assert_eq!(stats["BytesInUse"], 5);
    assert!(stats["BytesOut"].as_u64().unwrap() >= 5);
}

#[tokio::test]
async fn delete_requires_signature() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"hello")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    let (head, _) = raw_request(proxy.addr, &delete_request(&host, "/a.txt")).await;
    assert_eq!(status_of(&head), 403);
}

#[tokio::test]
async fn signed_delete_invalidates_one_object() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"hello")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    settle().await;
    assert_eq!(origin.request_count(), 1);

    let query = signed_query("DELETE", &host, "/a.txt", 0, 0);
    let (head, _) = raw_request(
        proxy.addr,
        &delete_request(&host, &format!("/a.txt?{query}")),
    )
    .await;
    assert_eq!(status_of(&head), 200);

    // The next read must go back to the origin.
    let (_, body) = raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    assert_eq!(body, b"hello");
    assert_eq!(origin.request_count(), 2);
}

#[tokio::test]
async fn signed_delete_all_clears_the_namespace() {
    let origin =
        MockOrigin::start(&[("/assets/a.txt", b"aaa"), ("/assets/b.txt", b"bbb")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    raw_request(proxy.addr, &get_request(&host, "/b.txt", "")).await;
    settle().await;
    assert_eq!(origin.request_count(), 2);

    let query = signed_query("DELETE", &host, "/", 0, 0);
    let (head, _) =
        raw_request(proxy.addr, &delete_request(&host, &format!("/?{query}"))).await;
    assert_eq!(status_of(&head), 200);

    raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    raw_request(proxy.addr, &get_request(&host, "/b.txt", "")).await;
    assert_eq!(origin.request_count(), 4, "both objects must refetch");
}

#[tokio::test]
async fn expired_signature_is_rejected() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"hello")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    let query = signed_query("DELETE", &host, "/a.txt", 0, now_unix() - 10);
    let (head, _) = raw_request(
        proxy.addr,
        &delete_request(&host, &format!("/a.txt?{query}")),
    )
    .await;
    assert_eq!(status_of(&head), 403);
}

#[tokio::test]
async fn sig_required_host_rejects_unsigned_reads() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"hello")]).await;
    let proxy = spawn_proxy(
        &origin,
        ProxyOptions {
            sig_required: true,
            ..ProxyOptions::default()
        },
    )
    .await;
    let host = proxy.host_header();

    let (head, _) = raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    assert_eq!(status_of(&head), 403);

    let query = signed_query("GET", &host, "/a.txt", 0, 0);
    let (head, body) = raw_request(
        proxy.addr,
        &get_request(&host, &format!("/a.txt?{query}"), ""),
    )
    .await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn range_requests_are_honored_on_hits() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"hello cache")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    settle().await;

    let (head, body) = raw_request(
        proxy.addr,
        &get_request(&host, "/a.txt", "Range: bytes=0-4\r\n"),
    )
    .await;
    assert_eq!(status_of(&head), 206);
    assert_eq!(header_of(&head, "content-range"), Some("bytes 0-4/11"));
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn conditional_get_returns_not_modified() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"hello cache")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    settle().await;

    let (head, _) = raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    let validator = header_of(&head, "last-modified").unwrap().to_string();

    let (head, body) = raw_request(
        proxy.addr,
        &get_request(&host, "/a.txt", &format!("If-Modified-Since: {validator}\r\n")),
    )
    .await;
    assert_eq!(status_of(&head), 304);
    assert!(body.is_empty());
}

#[tokio::test]
async fn gzips_configured_content_types_on_hits() {
    let origin = MockOrigin::start(&[("/assets/a.txt", b"hello hello hello hello")]).await;
    let proxy = spawn_proxy(
        &origin,
        ProxyOptions {
            gzip_content_types: vec!["text/".to_string()],
            ..ProxyOptions::default()
        },
    )
    .await;
    let host = proxy.host_header();

    raw_request(proxy.addr, &get_request(&host, "/a.txt", "")).await;
    settle().await;

    // HTTP/1.0 keeps the gzip body close-delimited instead of chunked.
    let request = format!(
        "GET /a.txt HTTP/1.0\r\nHost: {host}\r\nAccept-Encoding: gzip\r\n\r\n"
    );
    let (head, body) = raw_request(proxy.addr, &request).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(header_of(&head, "content-encoding"), Some("gzip"));

    let mut decoder = flate2::read::GzDecoder::new(body.as_slice());
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).unwrap();
    assert_eq!(decoded, b"hello hello hello hello");
}

#[tokio::test]
async fn trailing_slash_serves_index_document() {
    let origin = MockOrigin::start(&[("/assets/site/index.html", b"<html>home</html>")]).await;
    let proxy = spawn_proxy(&origin, ProxyOptions::default()).await;
    let host = proxy.host_header();

    let (head, body) = raw_request(proxy.addr, &get_request(&host, "/site/", "")).await;
    assert_eq!(status_of(&head), 200);
    assert_eq!(body, b"<html>home</html>");
}

use std::net::SocketAddr;

use anyhow::{Context, Result};
use http::StatusCode;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;

use crate::logging::CacheOutcome;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUEST_METHOD_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_method_total", "Requests by method");
    let vec = IntCounterVec::new(opts, &["method"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_method_total");
    vec
});

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_status_total", "Requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_status_total");
    vec
});

static CACHE_READ_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_read_total", "Cache reads by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_read_total");
    vec
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_evictions_total", "Objects removed by the LRU watchdog")
        .expect("create cache_evictions_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evictions_total");
    counter
});

static CACHE_INVALIDATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_invalidations_total",
        "Objects removed by DELETE requests",
    )
    .expect("create cache_invalidations_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_invalidations_total");
    counter
});

static ORIGIN_FETCH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("origin_fetch_total", "Origin fetches by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register origin_fetch_total");
    vec
});

static BYTES_IN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("bytes_in_total", "Bytes read from origins")
        .expect("create bytes_in_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register bytes_in_total");
    counter
});

static BYTES_OUT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("bytes_out_total", "Bytes streamed to clients")
        .expect("create bytes_out_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register bytes_out_total");
    counter
});

static CACHE_BYTES_IN_USE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("cache_bytes_in_use", "Sum of published cache file sizes")
        .expect("create cache_bytes_in_use");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_bytes_in_use");
    gauge
});

pub fn record_request(method: &str, status: StatusCode, cache: CacheOutcome) {
    REQUEST_METHOD_TOTAL.with_label_values(&[method]).inc();
    let class = format!("{}xx", status.as_u16() / 100);
    REQUEST_STATUS_TOTAL.with_label_values(&[&class]).inc();
    match cache {
        CacheOutcome::Hit => CACHE_READ_TOTAL.with_label_values(&["hit"]).inc(),
        CacheOutcome::Miss => CACHE_READ_TOTAL.with_label_values(&["miss"]).inc(),
        CacheOutcome::None => {}
    }
}

pub fn record_eviction() {
    CACHE_EVICTIONS_TOTAL.inc();
}

pub fn record_invalidation() {
    CACHE_INVALIDATIONS_TOTAL.inc();
}

pub fn record_origin_fetch(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    ORIGIN_FETCH_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_bytes_in(bytes: u64) {
    BYTES_IN_TOTAL.inc_by(bytes);
}

pub fn record_bytes_out(bytes: u64) {
    BYTES_OUT_TOTAL.inc_by(bytes);
}

pub fn set_bytes_in_use(bytes: u64) {
    CACHE_BYTES_IN_USE.set(bytes.min(i64::MAX as u64) as i64);
}

pub fn render() -> Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("failed to encode metrics")?;
    Ok(buffer)
}

/// Plain-HTTP Prometheus endpoint; started only when `MetricsListen` is set.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            let service = service_fn(|req: hyper::Request<hyper::body::Incoming>| async move {
                let response = if req.uri().path() == "/metrics" {
                    match render() {
                        Ok(body) => hyper::Response::builder()
                            .header(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")
                            .body(Full::new(Bytes::from(body))),
                        Err(_) => hyper::Response::builder()
                            .status(StatusCode::INTERNAL_SERVER_ERROR)
                            .body(Full::new(Bytes::new())),
                    }
                } else {
                    hyper::Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .body(Full::new(Bytes::new()))
                };
                response
            });
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(error = %err, "metrics connection error");
            }
        });
    }
}

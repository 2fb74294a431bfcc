use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, REFERER, USER_AGENT};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Frame, Incoming};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{self, ClientChannel};
use crate::logging::{AccessLogEvent, CacheOutcome, log_access};
use crate::sign::{self, MODIFIED_PARAM, SignatureError};

use super::App;

pub type ProxyBody = BoxBody<Bytes, io::Error>;

const ROBOTS_BODY: &str = "User-agent: *\nDisallow: /";

/// Streams cache body chunks straight from the engine's channel into the
/// hyper response.
struct ChannelBody {
    receiver: mpsc::Receiver<io::Result<Bytes>>,
}

impl hyper::body::Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        match self.get_mut().receiver.poll_recv(cx) {
            Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|err| match err {}).boxed()
}

fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(full_body(body.to_string()))
        .unwrap_or_else(|_| Response::new(full_body("")))
}

fn error_response(status: StatusCode) -> Response<ProxyBody> {
    text_response(status, &format!("{}: something went wrong", status.as_u16()))
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Strips an optional port from a Host header value, handling bracketed
/// IPv6 literals.
fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
        return host;
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Reconstructs the Referer's host[:port] the way it was signed.
fn referer_host(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(REFERER)?.to_str().ok()?;
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn verify_signature(
    secret: &str,
    method: &Method,
    host_header: &str,
    path: &str,
    query: &HashMap<String, String>,
    peer: SocketAddr,
    headers: &HeaderMap,
) -> Result<(), SignatureError> {
    let params = sign::authenticate(secret, method.as_str(), host_header, path, query)?;
    params.check_expiry(now_unix())?;
    params.check_user_host(&peer.ip().to_string())?;
    params.check_referer(referer_host(headers).as_deref())?;
    Ok(())
}

fn finish(mut log: AccessLogEvent, start: Instant, status: StatusCode, bytes_out: u64) {
    log.status = status.as_u16();
    log.bytes_out = bytes_out;
    log_access(log.elapsed(start.elapsed()));
}

fn finish_error(
    log: AccessLogEvent,
    start: Instant,
    status: StatusCode,
) -> Response<ProxyBody> {
    finish(log, start, status, 0);
    error_response(status)
}

pub async fn handle(
    req: Request<Incoming>,
    peer: SocketAddr,
    app: Arc<App>,
) -> Result<Response<ProxyBody>, Infallible> {
    Ok(handle_inner(req, peer, app).await)
}

async fn handle_inner(
    req: Request<Incoming>,
    peer: SocketAddr,
    app: Arc<App>,
) -> Response<ProxyBody> {
    let start = Instant::now();
    let method = req.method().clone();
    let raw_path = req.uri().path().to_string();

    let mut log = AccessLogEvent::new(peer);
    log.method = method.to_string();
    log.path = raw_path.clone();
    log.referer = header_str(req.headers(), REFERER);
    log.user_agent = header_str(req.headers(), USER_AGENT);

    if raw_path == "/robots.txt" && method == Method::GET {
        finish(log, start, StatusCode::OK, ROBOTS_BODY.len() as u64);
        return text_response(StatusCode::OK, ROBOTS_BODY);
    }
    if raw_path == "/favicon.ico" {
        return finish_error(log, start, StatusCode::NOT_FOUND);
    }

    let host_header = header_str(req.headers(), HOST);
    let hostname = host_without_port(&host_header).to_string();
    log.host = hostname.clone();

    let Some(host_cfg) = app.settings.hosts.get(&hostname) else {
        warn!(host = hostname, "no storage provider configured for host");
        return finish_error(log, start, StatusCode::BAD_REQUEST);
    };
    let Some(provider) = app.providers.get(&hostname).cloned() else {
        return finish_error(log, start, StatusCode::INTERNAL_SERVER_ERROR);
    };

    let query = parse_query(req.uri().query().unwrap_or(""));
    let trimmed = sign::trim_path(&raw_path).to_string();

    let modified_secs = match sign::parse_unix_param(
        query.get(MODIFIED_PARAM).map(String::as_str).unwrap_or(""),
    ) {
        Ok(secs) => secs,
        Err(_) => return finish_error(log, start, StatusCode::BAD_REQUEST),
    };

    // A non-zero modified parameter threatens to purge the cache, so it is
    // only honored on a signed URL.
    let sig_required = modified_secs != 0
        || host_cfg.sig_required
        || method == Method::DELETE
        || trimmed == cache::CACHE_STATS_PATH;
    if sig_required
        && let Err(err) = verify_signature(
            &app.settings.secret,
            &method,
            &host_header,
            &trimmed,
            &query,
            peer,
            req.headers(),
        )
    {
        debug!(peer = %peer, error = %err, "rejected request signature");
        return finish_error(log, start, StatusCode::FORBIDDEN);
    }

    if method == Method::DELETE {
        let result = if trimmed.is_empty() {
            app.cache.delete_all(&hostname).await
        } else {
            app.cache.delete(&hostname, &trimmed).await
        };
        match result {
            Ok(freed) => {
                debug!(host = hostname, path = trimmed, freed, "invalidated");
                finish(log, start, StatusCode::OK, 0);
                text_response(StatusCode::OK, "")
            }
            Err(err) => {
                warn!(error = %err, "failed to delete");
                finish_error(log, start, err.status())
            }
        }
    } else if method == Method::GET {
        stream_cache_read(
            req,
            app,
            provider,
            hostname,
            raw_path,
            trimmed,
            modified_secs,
            log,
            start,
        )
        .await
    } else {
        finish_error(log, start, StatusCode::METHOD_NOT_ALLOWED)
    }
}

#[allow(clippy::too_many_arguments)]
async fn stream_cache_read(
    req: Request<Incoming>,
    app: Arc<App>,
    provider: Arc<dyn crate::storage::StorageProvider>,
    hostname: String,
    raw_path: String,
    trimmed: String,
    modified_secs: i64,
    mut log: AccessLogEvent,
    start: Instant,
) -> Response<ProxyBody> {
    let modified_time = if modified_secs <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_secs(modified_secs as u64)
    };

    // Static-site support: directory requests map to their index document.
    let mut cache_path = trimmed;
    if raw_path.ends_with('/') {
        cache_path.push_str("/index.html");
    }

    let (client, receiver) = ClientChannel::new(req.headers().clone());
    let cache = app.cache.clone();
    let namespace = hostname;

    let task = tokio::spawn(async move {
        let mut client = client;
        let result = cache
            .read(
                &namespace,
                provider.as_ref(),
                &cache_path,
                modified_time,
                &mut client,
            )
            .await;
        let (status, outcome) = match &result {
            Ok(outcome) => (
                client.sent_status().unwrap_or(StatusCode::OK),
                *outcome,
            ),
            Err(err) => (
                client.sent_status().unwrap_or(err.status()),
                CacheOutcome::None,
            ),
        };
        if let Err(err) = &result {
            warn!(path = cache_path, error = %err, "cache read failed");
        }
        log.status = status.as_u16();
        log.bytes_out = client.bytes_sent();
        log.cache = outcome;
        log_access(log.elapsed(start.elapsed()));
        result
    });

    let crate::cache::ResponseReceiver { head, body } = receiver;
    match head.await {
        Ok(head) => {
            let mut response = Response::new(ChannelBody { receiver: body }.boxed());
            *response.status_mut() = head.status;
            *response.headers_mut() = head.headers;
            response
        }
        Err(_) => {
            // The cache failed before sending a head; surface its status.
            let status = match task.await {
                Ok(Err(err)) => err.status(),
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status)
        }
    }
}

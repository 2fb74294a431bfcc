#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use pennycdn::settings::{Host, Settings};
use pennycdn::sign::{self, SigParams};

pub const SECRET: &str = "integration-secret";

/// Minimal S3-ish upstream: answers path-style GETs from an in-memory map
/// and counts the requests it serves.
pub struct MockOrigin {
    pub addr: SocketAddr,
    pub requests: Arc<AtomicUsize>,
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MockOrigin {
    pub async fn start(objects: &[(&str, &[u8])]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let map: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(
            objects
                .iter()
                .map(|(path, body)| (path.to_string(), body.to_vec()))
                .collect(),
        ));

        let accept_requests = requests.clone();
        let accept_map = map.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let requests = accept_requests.clone();
                let map = accept_map.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut data = Vec::new();
                    loop {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        data.extend_from_slice(&buf[..n]);
                        if data.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    if data.is_empty() {
                        return;
                    }

                    let head = String::from_utf8_lossy(&data);
                    let target = head
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .split('?')
                        .next()
                        .unwrap_or("/")
                        .to_string();

                    requests.fetch_add(1, Ordering::SeqCst);
                    let body = map.lock().get(&target).cloned();
                    let response = match body {
                        Some(body) => {
                            let mut response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nX-Origin: mock\r\nConnection: close\r\n\r\n",
                                body.len()
                            )
                            .into_bytes();
                            response.extend_from_slice(&body);
                            response
                        }
                        None => {
                            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                                .to_vec()
                        }
                    };
                    socket.write_all(&response).await.ok();
                    socket.shutdown().await.ok();
                });
            }
        });

        Self {
            addr,
            requests,
            objects: map,
        }
    }

    pub fn put(&self, path: &str, body: &[u8]) {
        self.objects.lock().insert(path.to_string(), body.to_vec());
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    _dirs: TempDir,
}

impl TestProxy {
    pub fn host_header(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }
}

pub struct ProxyOptions {
    pub gzip_content_types: Vec<String>,
    pub sig_required: bool,
    pub cache_size: u64,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            gzip_content_types: Vec::new(),
            sig_required: false,
            cache_size: 10 * 1024 * 1024,
        }
    }
}

/// Boots a full proxy against the mock origin, on an ephemeral port, with
/// fresh cache/tmp/database directories.
pub async fn spawn_proxy(origin: &MockOrigin, options: ProxyOptions) -> TestProxy {
    let dirs = TempDir::new().unwrap();
    for sub in ["cache", "tmp", "db"] {
        std::fs::create_dir_all(dirs.path().join(sub)).unwrap();
    }

    let mut hosts = HashMap::new();
    hosts.insert(
        "127.0.0.1".to_string(),
        Host {
            bucket: "assets".to_string(),
            path: String::new(),
            endpoint: Some(format!("http://{}", origin.addr)),
            preserve_headers: None,
            access_key: String::new(),
            secret_key: String::new(),
            sig_required: options.sig_required,
        },
    );

    let mut settings = Settings {
        listen: "127.0.0.1:0".parse().unwrap(),
        cache_dir: dirs.path().join("cache"),
        tmp_dir: dirs.path().join("tmp"),
        database_dir: dirs.path().join("db"),
        cache_size: options.cache_size,
        free_space_batch_size_in_bytes: 0,
        tls_certificate_dir: None,
        gzip_content_types: options.gzip_content_types,
        access_key: "AK".to_string(),
        secret_key: "SK".to_string(),
        preserve_headers: vec!["X-Origin".to_string()],
        secret: SECRET.to_string(),
        hosts,
        metrics_listen: None,
    };
    settings.normalize().unwrap();
    settings.validate().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Err(err) = pennycdn::run_on(settings, listener).await {
            eprintln!("proxy exited: {err:#}");
        }
    });

    TestProxy { addr, _dirs: dirs }
}

async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to proxy at {addr}");
}

/// Sends a raw request and returns (head, body) split at the blank line.
pub async fn raw_request(addr: SocketAddr, request: &str) -> (String, Vec<u8>) {
    let mut stream = connect_with_retry(addr).await;
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();

    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("malformed response");
    let head = String::from_utf8_lossy(&response[..split]).to_string();
    (head, response[split + 4..].to_vec())
}

pub fn status_of(head: &str) -> u16 {
    head.split_whitespace()
        .nth(1)
        .and_then(|status| status.parse().ok())
        .expect("status line")
}

pub fn header_of<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

pub fn get_request(host: &str, path_and_query: &str, extra_headers: &str) -> String {
    format!(
        "GET {path_and_query} HTTP/1.1\r\nHost: {host}\r\n{extra_headers}Connection: close\r\n\r\n"
    )
}

pub fn delete_request(host: &str, path_and_query: &str) -> String {
    format!("DELETE {path_and_query} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n")
}

/// Query string for a request signed with the harness secret.
pub fn signed_query(method: &str, host: &str, path: &str, modified: i64, expires: i64) -> String {
    let params = SigParams {
        host: host.to_string(),
        method: method.to_string(),
        path: sign::trim_path(path).to_string(),
        modified,
        expires,
        user_host: String::new(),
        referer_host: String::new(),
    };
    let sig = sign::sign(SECRET, &params);
    format!("modified={modified}&expires={expires}&host=&domain=&sig={sig}")
}

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

pub mod client;
mod index;
mod writer;

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::fs::{self as async_fs, File};
use tokio::sync::{RwLock, mpsc};
use tokio::task;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use client::{ClientChannel, ResponseHead, ResponseReceiver};
pub use index::MetaIndex;
pub use writer::CacheWriter;

use crate::http::serve;
use crate::logging::CacheOutcome;
use crate::metrics;
use crate::sign;
use crate::storage::StorageProvider;

/// Reserved path that reports counters instead of touching storage.
pub const CACHE_STATS_PATH: &str = "cacheStats";

const TMP_PREFIX: &str = "pennycdn-";
const EVICTION_CHANNEL_CAPACITY: usize = 1000;

/// Cache-level failure with the HTTP status the adapter should answer with
/// when the response head has not been sent yet.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct CacheError {
    status: StatusCode,
    source: anyhow::Error,
}

impl CacheError {
    pub fn new(status: StatusCode, source: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            source: source.into(),
        }
    }

    pub fn bad_request(message: &'static str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, anyhow::anyhow!(message))
    }

    fn internal(source: impl Into<anyhow::Error>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, source)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheStats {
    pub bytes_in_use: u64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub uptime: u64,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub cache_size: u64,
    pub free_space_batch_size: u64,
    pub gzip_content_types: Vec<String>,
}

/// The cache engine. Shared by every request handler and the eviction
/// watchdog; filesystem publication and deletion decisions are guarded by
/// `cache_lock`, statistics live in atomics.
pub struct Cache {
    config: CacheConfig,
    index: MetaIndex,
    bytes_in_use: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    delete_generation: AtomicU64,
    started_at: Instant,
    cache_lock: RwLock<()>,
    evict_tx: mpsc::Sender<i64>,
    evict_rx: Mutex<Option<mpsc::Receiver<i64>>>,
}

/// Rejects `.`/`..` segments before any trimming, then trims spaces and
/// slashes; the empty path is invalid.
pub(crate) fn validate_path(path: &str) -> Result<String, CacheError> {
    for segment in path.split('/') {
        if segment == "." || segment == ".." {
            return Err(CacheError::bad_request("naughty path"));
        }
    }
    let trimmed = sign::trim_path(path);
    if trimmed.is_empty() {
        return Err(CacheError::bad_request("empty path"));
    }
    Ok(trimmed.to_string())
}

struct HitFile {
    file: File,
    size: u64,
    mtime: SystemTime,
    headers: std::collections::HashMap<String, String>,
}

/// Unlinks the temp file on every exit path unless the rename committed it.
struct TempGuard {
    path: PathBuf,
    committed: bool,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let path = self.path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = async_fs::remove_file(path).await;
            });
        } else {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Cache {
    /// Walks the cache tree to rebuild `bytes_in_use`, deleting files whose
    /// index entries are incomplete, then arms the eviction channel.
    pub async fn open(config: CacheConfig, index: MetaIndex) -> Result<Arc<Self>> {
        let scan = {
            let cache_dir = config.cache_dir.clone();
            let index = index.clone();
            task::spawn_blocking(move || scan_cache_dir(&cache_dir, &index))
        };
        let bytes_in_use = scan
            .await
            .map_err(|err| anyhow::anyhow!("startup scan task failed: {err}"))??;
        info!(bytes_in_use, "cache ready");
        metrics::set_bytes_in_use(bytes_in_use);

        let (evict_tx, evict_rx) = mpsc::channel(EVICTION_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            config,
            index,
            bytes_in_use: AtomicU64::new(bytes_in_use),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            delete_generation: AtomicU64::new(0),
            started_at: Instant::now(),
            cache_lock: RwLock::new(()),
            evict_tx,
            evict_rx: Mutex::new(Some(evict_rx)),
        }))
    }

    /// Starts the single long-lived eviction task. The zero seed triggers an
    /// initial sweep in case the startup scan already exceeds the bound.
    pub fn spawn_watchdog(self: &Arc<Self>) {
        let Some(mut rx) = self.evict_rx.lock().take() else {
            return;
        };
        let _ = self.evict_tx.try_send(0);
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                if delta >= 0 {
                    cache.bytes_in_use.fetch_add(delta as u64, Ordering::SeqCst);
                } else {
                    cache
                        .bytes_in_use
                        .fetch_sub(delta.unsigned_abs(), Ordering::SeqCst);
                }
                metrics::set_bytes_in_use(cache.bytes_in_use.load(Ordering::SeqCst));
                if cache.bytes_in_use.load(Ordering::SeqCst) > cache.config.cache_size {
                    cache.free_space().await;
                }
            }
        });
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.bytes_in_use.load(Ordering::SeqCst)
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::SeqCst)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            bytes_in_use: self.bytes_in_use(),
            bytes_out: self.bytes_out(),
            bytes_in: self.bytes_in(),
            uptime: self.started_at.elapsed().as_secs(),
        }
    }

    /// Serves `path` under `namespace`, from disk when a fresh enough copy
    /// exists, otherwise by streaming from the origin while populating the
    /// cache. `last_modified_at` is the purge-by-age floor: cached copies
    /// older than it are treated as absent (epoch disables the check).
    pub async fn read(
        &self,
        namespace: &str,
        storage: &dyn StorageProvider,
        path: &str,
        last_modified_at: SystemTime,
        client: &mut ClientChannel,
    ) -> Result<CacheOutcome, CacheError> {
        let path = validate_path(path)?;
        if path == CACHE_STATS_PATH {
            self.serve_stats(client).await?;
            return Ok(CacheOutcome::None);
        }

        let namespaced = format!("{namespace}/{path}");
        let full_path = self.config.cache_dir.join(&namespaced);
        let generation_before = self.delete_generation.load(Ordering::SeqCst);

        let hit = {
            // Held across stat+open so a concurrent delete cannot slip in
            // between them; once the handle exists the inode outlives any
            // unlink and the lock can go.
            let _guard = self.cache_lock.read().await;
            match async_fs::metadata(&full_path).await {
                Ok(meta) if meta.is_file() => {
                    let mtime = meta.modified().map_err(CacheError::internal)?;
                    if mtime >= last_modified_at {
                        let file = File::open(&full_path).await.map_err(CacheError::internal)?;
                        let headers =
                            self.index.headers(&namespaced).map_err(CacheError::internal)?;
                        Some(HitFile {
                            file,
                            size: meta.len(),
                            mtime,
                            headers,
                        })
                    } else {
                        None
                    }
                }
                Ok(_) => None,
                Err(err) if err.kind() == ErrorKind::NotFound => None,
                Err(err) => return Err(CacheError::internal(err)),
            }
        };

        if let Some(hit) = hit {
            self.read_hit(storage, &namespaced, hit, client).await?;
            return Ok(CacheOutcome::Hit);
        }
        self.read_miss(storage, &namespaced, &full_path, &path, generation_before, client)
            .await?;
        Ok(CacheOutcome::Miss)
    }

    async fn serve_stats(&self, client: &mut ClientChannel) -> Result<(), CacheError> {
        let body = serde_json::to_vec(&self.stats()).map_err(CacheError::internal)?;
        client.insert_header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        client.insert_header(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
        client
            .send_head(StatusCode::OK)
            .map_err(CacheError::internal)?;
        client.write_chunk(&body).await.map_err(CacheError::internal)
    }

    async fn read_hit(
        &self,
        storage: &dyn StorageProvider,
        namespaced: &str,
        mut hit: HitFile,
        client: &mut ClientChannel,
    ) -> Result<(), CacheError> {
        self.index.touch(namespaced).map_err(CacheError::internal)?;

        // The preserve filter is re-applied on every hit so a policy change
        // takes effect without rewriting cached entries.
        let preserve = storage.preserve_headers();
        for (name, value) in &hit.headers {
            if !preserve.iter().any(|p| p == name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                client.insert_header(name, value);
            }
        }

        self.bytes_out.fetch_add(hit.size, Ordering::SeqCst);
        metrics::record_bytes_out(hit.size);
        serve::serve_file(
            client,
            &mut hit.file,
            hit.size,
            hit.mtime,
            &self.config.gzip_content_types,
        )
        .await
        .map_err(CacheError::internal)
    }

    async fn read_miss(
        &self,
        storage: &dyn StorageProvider,
        namespaced: &str,
        full_path: &std::path::Path,
        path: &str,
        generation_before: u64,
        client: &mut ClientChannel,
    ) -> Result<(), CacheError> {
        let tmp_path = self
            .config
            .tmp_dir
            .join(format!("{TMP_PREFIX}{}", Uuid::new_v4()));
        let mut tmp_guard = TempGuard::new(tmp_path.clone());

        let mut options = async_fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let temp = options.open(&tmp_path).await.map_err(CacheError::internal)?;

        // The origin body is consumed sequentially; range is only supported
        // on later hits.
        client.insert_header(ACCEPT_RANGES, HeaderValue::from_static("none"));

        let mut cache_writer = CacheWriter::new(client, temp, storage.preserve_headers());
        let bytes_read = match storage.read(path, &mut cache_writer).await {
            Ok(bytes) => {
                metrics::record_origin_fetch(true);
                bytes
            }
            Err(err) => {
                metrics::record_origin_fetch(false);
                let status = err.status();
                return Err(CacheError::new(status, err));
            }
        };
        let fetched = cache_writer.finish().await.map_err(CacheError::internal)?;
        let recorded_headers = fetched.headers;
        drop(fetched.temp);

        if let Some(parent) = full_path.parent() {
            async_fs::create_dir_all(parent)
                .await
                .map_err(CacheError::internal)?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            async_fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o644))
                .await
                .map_err(CacheError::internal)?;
        }

        self.bytes_in.fetch_add(bytes_read, Ordering::SeqCst);
        self.bytes_out.fetch_add(bytes_read, Ordering::SeqCst);
        metrics::record_bytes_in(bytes_read);
        metrics::record_bytes_out(bytes_read);

        // The fetch ran with no lock held. If an invalidation interleaved,
        // the bytes we just read may predate it from the caller's point of
        // view: serve them, but do not publish.
        let _guard = self.cache_lock.write().await;
        if self.delete_generation.load(Ordering::SeqCst) == generation_before {
            let overwritten = match async_fs::metadata(&full_path).await {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => 0,
            };
            self.index.touch(namespaced).map_err(CacheError::internal)?;
            self.index
                .put_headers(namespaced, &recorded_headers)
                .map_err(CacheError::internal)?;
            async_fs::rename(&tmp_path, &full_path)
                .await
                .map_err(CacheError::internal)?;
            tmp_guard.commit();
            let delta = bytes_read as i64 - overwritten as i64;
            let _ = self.evict_tx.send(delta).await;
        } else {
            debug!(path = namespaced, "invalidation during fetch; not admitted");
        }
        Ok(())
    }

    /// Removes one cached object.
    pub async fn delete(&self, namespace: &str, path: &str) -> Result<u64, CacheError> {
        let path = validate_path(path)?;
        let namespaced = format!("{namespace}/{path}");
        let _guard = self.cache_lock.write().await;
        let freed = self
            .delete_inner(&namespaced)
            .await
            .map_err(CacheError::internal)?;
        metrics::record_invalidation();
        Ok(freed)
    }

    /// Removes every cached object under `namespace`. Individual failures
    /// are logged and skipped; the sweep continues.
    pub async fn delete_all(&self, namespace: &str) -> Result<u64, CacheError> {
        let prefix = format!("{namespace}/");
        let _guard = self.cache_lock.write().await;
        let paths = self
            .index
            .paths_by_access_time()
            .map_err(CacheError::internal)?;
        let mut freed = 0u64;
        for path in paths {
            if !path.starts_with(&prefix) {
                continue;
            }
            match self.delete_inner(&path).await {
                Ok(bytes) => {
                    freed += bytes;
                    metrics::record_invalidation();
                }
                Err(err) => {
                    warn!(path, error = %err, "failed to delete cached object");
                }
            }
        }
        Ok(freed)
    }

    /// Caller must hold `cache_lock` exclusively.
    async fn delete_inner(&self, namespaced: &str) -> Result<u64> {
        self.delete_generation.fetch_add(1, Ordering::SeqCst);
        let full_path = self.config.cache_dir.join(namespaced);
        let meta = match async_fs::metadata(&full_path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = namespaced, "no longer on disk, dropping index entries");
                self.index.remove(namespaced)?;
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };
        let size = meta.len();
        async_fs::remove_file(&full_path)
            .await
            .with_context(|| format!("failed to remove {}", full_path.display()))?;
        self.index.remove(namespaced)?;
        self.bytes_in_use.fetch_sub(size, Ordering::SeqCst);
        metrics::set_bytes_in_use(self.bytes_in_use.load(Ordering::SeqCst));
        Ok(size)
    }

    /// Deletes objects in ascending access-time order until at least the
    /// oversize plus the configured batch has been freed. The overshoot
    /// amortizes re-entry.
    async fn free_space(&self) {
        let _guard = self.cache_lock.write().await;
        let paths = match self.index.paths_by_access_time() {
            Ok(paths) => paths,
            Err(err) => {
                error!(error = %err, "failed to list cached paths for eviction");
                return;
            }
        };
        let in_use = self.bytes_in_use.load(Ordering::SeqCst);
        if in_use <= self.config.cache_size {
            return;
        }
        let mut left_to_remove =
            (in_use - self.config.cache_size) + self.config.free_space_batch_size;
        for path in paths {
            if left_to_remove == 0 {
                break;
            }
            match self.delete_inner(&path).await {
                Ok(freed) => {
                    if freed > 0 {
                        metrics::record_eviction();
                    }
                    left_to_remove = left_to_remove.saturating_sub(freed);
                }
                Err(err) => {
                    warn!(path, error = %err, "failed to evict cached object");
                }
            }
        }
    }
}

fn scan_cache_dir(cache_dir: &std::path::Path, index: &MetaIndex) -> Result<u64> {
    let mut bytes_in_use = 0u64;
    let mut stack = vec![cache_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read cache dir {}", dir.display()))?
        {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let path = entry.path();
            let relative = match path.strip_prefix(cache_dir).ok().and_then(|p| p.to_str()) {
                Some(relative) => relative.to_string(),
                None => {
                    warn!(path = %path.display(), "skipping non-utf8 cache file");
                    continue;
                }
            };
            if index.is_indexed(&relative)? {
                bytes_in_use += entry.metadata()?.len();
            } else {
                // A file with no complete index entry has no recorded
                // headers to replay; drop it rather than serve it bare.
                warn!(path = relative, "removing orphan cache file");
                std::fs::remove_file(&path).ok();
            }
        }
    }
    Ok(bytes_in_use)
}

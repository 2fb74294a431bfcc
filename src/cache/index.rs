use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use rocksdb::{DB, Direction, IteratorMode, Options};
use tracing::warn;

const ACCESS_TIME_PREFIX: &str = "accessed/";
const HEADERS_PREFIX: &str = "headers/";

/// Ordered key-value index beside the cache tree. Two entries per object,
/// keyed by namespaced path: `accessed/<path>` holds a big-endian unix-nano
/// timestamp for LRU ordering, `headers/<path>` the preserved origin
/// headers as JSON. An object counts as indexed only when both exist.
#[derive(Clone)]
pub struct MetaIndex {
    db: Arc<DB>,
}

fn access_key(path: &str) -> Vec<u8> {
    format!("{ACCESS_TIME_PREFIX}{path}").into_bytes()
}

fn headers_key(path: &str) -> Vec<u8> {
    format!("{HEADERS_PREFIX}{path}").into_bytes()
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

impl MetaIndex {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, dir)
            .map_err(|err| anyhow!("failed to open index at {}: {err}", dir.display()))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Records "now" as the object's last access time.
    pub fn touch(&self, path: &str) -> Result<()> {
        self.db
            .put(access_key(path), now_nanos().to_be_bytes())
            .with_context(|| format!("failed to touch access time for {path}"))
    }

    pub fn put_headers(&self, path: &str, headers: &HashMap<String, String>) -> Result<()> {
        let blob = serde_json::to_vec(headers)?;
        self.db
            .put(headers_key(path), blob)
            .with_context(|| format!("failed to store headers for {path}"))
    }

    /// Missing entries decode as an empty map; a hit with no stored headers
    /// is served without replay rather than failed.
    pub fn headers(&self, path: &str) -> Result<HashMap<String, String>> {
        match self.db.get(headers_key(path))? {
            Some(blob) => serde_json::from_slice(&blob)
                .with_context(|| format!("corrupt headers entry for {path}")),
            None => Ok(HashMap::new()),
        }
    }

    pub fn is_indexed(&self, path: &str) -> Result<bool> {
        let has_access = self.db.get_pinned(access_key(path))?.is_some();
        let has_headers = self.db.get_pinned(headers_key(path))?.is_some();
        Ok(has_access && has_headers)
    }

    /// Removes both entries; absent entries are not an error.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.db.delete(access_key(path))?;
        self.db.delete(headers_key(path))?;
        Ok(())
    }

    /// All indexed namespaced paths, ascending by last access time. Order
    /// within equal timestamps is unspecified.
    pub fn paths_by_access_time(&self) -> Result<Vec<String>> {
        let prefix = ACCESS_TIME_PREFIX.as_bytes();
        let mut entries: Vec<(i64, String)> = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let path = match std::str::from_utf8(&key[prefix.len()..]) {
                Ok(path) => path.to_string(),
                Err(_) => {
                    warn!("skipping non-utf8 index key");
                    continue;
                }
            };
            let raw: [u8; 8] = match value.as_ref().try_into() {
                Ok(raw) => raw,
                Err(_) => {
                    warn!(path, "skipping malformed access-time entry");
                    continue;
                }
            };
            entries.push((i64::from_be_bytes(raw), path));
        }
        entries.sort_unstable_by_key(|(ts, _)| *ts);
        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_index(dir: &TempDir) -> MetaIndex {
        MetaIndex::open(dir.path()).unwrap()
    }

    #[test]
    fn object_is_indexed_only_with_both_entries() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        assert!(!index.is_indexed("h1/a.txt").unwrap());
        index.touch("h1/a.txt").unwrap();
        assert!(!index.is_indexed("h1/a.txt").unwrap());
        index.put_headers("h1/a.txt", &HashMap::new()).unwrap();
        assert!(index.is_indexed("h1/a.txt").unwrap());

        index.remove("h1/a.txt").unwrap();
        assert!(!index.is_indexed("h1/a.txt").unwrap());
    }

    #[test]
    fn headers_round_trip() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "image/png".to_string());
        headers.insert("etag".to_string(), "\"abc\"".to_string());
        index.put_headers("h1/img.png", &headers).unwrap();

        assert_eq!(index.headers("h1/img.png").unwrap(), headers);
        assert!(index.headers("h1/missing").unwrap().is_empty());
    }

    #[test]
    fn lists_paths_in_access_order() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        for path in ["h1/oldest", "h1/middle", "h2/newest"] {
            index.touch(path).unwrap();
            index.put_headers(path, &HashMap::new()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        assert_eq!(
            index.paths_by_access_time().unwrap(),
            vec!["h1/oldest", "h1/middle", "h2/newest"]
        );

        // Re-touching moves an object to the back of the LRU order.
        index.touch("h1/oldest").unwrap();
        assert_eq!(
            index.paths_by_access_time().unwrap(),
            vec!["h1/middle", "h2/newest", "h1/oldest"]
        );
    }

    #[test]
    fn header_entries_do_not_leak_into_the_listing() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.put_headers("h1/only-headers", &HashMap::new()).unwrap();
        assert!(index.paths_by_access_time().unwrap().is_empty());
    }
}

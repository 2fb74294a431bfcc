use std::collections::HashMap;
use std::io;

use http::StatusCode;
use http::header::CONTENT_LENGTH;
use http::HeaderMap;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::client::ClientChannel;

/// Streams one origin object to the client and the cache temp file in a
/// single pass, recording the origin's headers for replay on later hits.
pub struct CacheWriter<'a> {
    client: &'a mut ClientChannel,
    temp: File,
    preserve: &'a [String],
    recorded: HashMap<String, String>,
    bytes_written: u64,
}

/// What a completed origin read leaves behind: the flushed temp file, the
/// recorded header map destined for the index, and the body byte count.
pub(super) struct FetchedObject {
    pub temp: File,
    pub headers: HashMap<String, String>,
    pub bytes: u64,
}

impl<'a> CacheWriter<'a> {
    pub(super) fn new(client: &'a mut ClientChannel, temp: File, preserve: &'a [String]) -> Self {
        Self {
            client,
            temp,
            preserve,
            recorded: HashMap::new(),
            bytes_written: 0,
        }
    }

    /// Invoked once with the origin response headers, before any body bytes.
    /// `Content-Length` is copied to the client verbatim; every header is
    /// recorded lower-cased; headers on the provider's preserve list are
    /// additionally forwarded to the client.
    pub fn preserve_and_write_headers(&mut self, origin: &HeaderMap) {
        if let Some(len) = origin.get(CONTENT_LENGTH) {
            self.client.insert_header(CONTENT_LENGTH, len.clone());
        }
        for (name, value) in origin.iter() {
            let lower = name.as_str();
            if let Ok(text) = value.to_str() {
                self.recorded.insert(lower.to_string(), text.to_string());
            }
            if self.preserve.iter().any(|p| p == lower) {
                self.client.insert_header(name.clone(), value.clone());
            }
        }
    }

    /// Tees one body chunk to the temp file and the client. An error on
    /// either sink aborts the fetch.
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.temp.write_all(chunk).await?;
        self.client.write_chunk(chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Empty bodies never trigger the implicit head send in `write_chunk`,
    /// so the head is completed here.
    pub(super) async fn finish(mut self) -> io::Result<FetchedObject> {
        if !self.client.head_sent() {
            self.client.send_head(StatusCode::OK)?;
        }
        self.temp.flush().await?;
        Ok(FetchedObject {
            temp: self.temp,
            headers: self.recorded,
            bytes: self.bytes_written,
        })
    }
}

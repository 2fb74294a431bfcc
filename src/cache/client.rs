use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::sync::{mpsc, oneshot};

use crate::io_util::ChunkSink;

const BODY_CHANNEL_CAPACITY: usize = 32;

/// Status line and headers, delivered to the HTTP adapter exactly once,
/// before the first body chunk.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Receiving half handed to the HTTP adapter: the head arrives on a oneshot,
/// body chunks follow on a bounded channel. A dropped receiver is how the
/// cache observes a client disconnect.
pub struct ResponseReceiver {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::Receiver<io::Result<Bytes>>,
}

/// The cache's view of one client response. Headers accumulate until the
/// head is sent (explicitly, or implicitly by the first body chunk); body
/// chunks are then streamed through the channel.
pub struct ClientChannel {
    req_headers: HeaderMap,
    resp_headers: HeaderMap,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: mpsc::Sender<io::Result<Bytes>>,
    sent_status: Option<StatusCode>,
    bytes_sent: u64,
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
}

impl ClientChannel {
    pub fn new(req_headers: HeaderMap) -> (Self, ResponseReceiver) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        (
            Self {
                req_headers,
                resp_headers: HeaderMap::new(),
                head_tx: Some(head_tx),
                body_tx,
                sent_status: None,
                bytes_sent: 0,
            },
            ResponseReceiver {
                head: head_rx,
                body: body_rx,
            },
        )
    }

    pub fn req_headers(&self) -> &HeaderMap {
        &self.req_headers
    }

    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.resp_headers.insert(name, value);
    }

    pub fn remove_header(&mut self, name: &HeaderName) {
        self.resp_headers.remove(name);
    }

    pub fn response_header(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.resp_headers.get(name)
    }

    pub fn head_sent(&self) -> bool {
        self.head_tx.is_none()
    }

    pub fn sent_status(&self) -> Option<StatusCode> {
        self.sent_status
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Delivers the status line and accumulated headers. A second call is a
    /// no-op; the head cannot be unsent.
    pub fn send_head(&mut self, status: StatusCode) -> io::Result<()> {
        let Some(tx) = self.head_tx.take() else {
            return Ok(());
        };
        let head = ResponseHead {
            status,
            headers: std::mem::take(&mut self.resp_headers),
        };
        tx.send(head).map_err(|_| disconnected())?;
        self.sent_status = Some(status);
        Ok(())
    }

    /// Streams one body chunk, implicitly sending a 200 head first if none
    /// has been sent yet.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        if !self.head_sent() {
            self.send_head(StatusCode::OK)?;
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.body_tx
            .send(Ok(Bytes::copy_from_slice(chunk)))
            .await
            .map_err(|_| disconnected())?;
        self.bytes_sent += chunk.len() as u64;
        Ok(())
    }
}

#[async_trait]
impl ChunkSink for ClientChannel {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_chunk(chunk).await
    }
}

#[cfg(test)]
pub(crate) async fn collect_body(mut receiver: ResponseReceiver) -> (ResponseHead, Vec<u8>) {
    let head = receiver.head.await.expect("response head");
    let mut body = Vec::new();
    while let Some(chunk) = receiver.body.recv().await {
        body.extend_from_slice(&chunk.expect("body chunk"));
    }
    (head, body)
}

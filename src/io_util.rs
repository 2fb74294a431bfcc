use std::io;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::io::{AsyncRead, AsyncReadExt};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Byte sink fed chunk-by-chunk; the response body channel and the gzip
/// adapter both implement it so the copy loops below don't care which side
/// of the compression boundary they write to.
#[async_trait]
pub trait ChunkSink: Send {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl<T: ChunkSink + Send + ?Sized> ChunkSink for &mut T {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        (**self).send(chunk).await
    }
}

/// Copies a reader into a sink, optionally stopping after `limit` bytes.
/// EOF before a requested limit is an error; range serving depends on the
/// file being at least as long as the stat that produced the limit.
pub async fn copy_to_sink<R, S>(reader: &mut R, sink: &mut S, limit: Option<u64>) -> io::Result<u64>
where
    R: AsyncRead + Unpin + Send,
    S: ChunkSink + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut remaining = limit;
    let mut total = 0u64;
    loop {
        let want = match remaining {
            Some(0) => break,
            Some(n) => buf.len().min(n as usize),
            None => buf.len(),
        };
        let read = reader.read(&mut buf[..want]).await?;
        if read == 0 {
            if remaining.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source ended before requested length",
                ));
            }
            break;
        }
        sink.send(&buf[..read]).await?;
        total += read as u64;
        if let Some(n) = remaining {
            remaining = Some(n - read as u64);
        }
    }
    Ok(total)
}

/// Gzip-compressing adapter over another sink. Compressed output is pushed
/// through as it becomes available; `finish` must be called to flush the
/// trailer.
pub struct GzipSink<S> {
    inner: S,
    encoder: GzEncoder<Vec<u8>>,
}

impl<S: ChunkSink> GzipSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
        }
    }

    async fn drain(&mut self) -> io::Result<()> {
        let buffered = std::mem::take(self.encoder.get_mut());
        if !buffered.is_empty() {
            self.inner.send(&buffered).await?;
        }
        Ok(())
    }

    pub async fn finish(mut self) -> io::Result<S> {
        self.encoder.try_finish()?;
        self.drain().await?;
        Ok(self.inner)
    }
}

#[async_trait]
impl<S: ChunkSink> ChunkSink for GzipSink<S> {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.encoder.write_all(chunk)?;
        self.drain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[derive(Default)]
    struct VecSink {
        data: Vec<u8>,
    }

    #[async_trait]
    impl ChunkSink for VecSink {
        async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
            self.data.extend_from_slice(chunk);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ChunkSink for FailingSink {
        async fn send(&mut self, _chunk: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }
    }

    #[tokio::test]
    async fn copies_whole_reader_without_limit() {
        let payload = b"abcdefghijklmnopqrstuvwxyz".repeat(100);
        let mut reader = std::io::Cursor::new(payload.clone());
        let mut sink = VecSink::default();
        let copied = copy_to_sink(&mut reader, &mut sink, None).await.unwrap();
        assert_eq!(copied as usize, payload.len());
        assert_eq!(sink.data, payload);
    }

    #[tokio::test]
    async fn respects_byte_limit() {
        let mut reader = std::io::Cursor::new(b"0123456789".to_vec());
        let mut sink = VecSink::default();
        let copied = copy_to_sink(&mut reader, &mut sink, Some(4)).await.unwrap();
        assert_eq!(copied, 4);
        assert_eq!(sink.data, b"0123");
    }

    #[tokio::test]
    async fn short_source_with_limit_is_an_error() {
        let mut reader = std::io::Cursor::new(b"abc".to_vec());
        let mut sink = VecSink::default();
        let err = copy_to_sink(&mut reader, &mut sink, Some(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn sink_errors_abort_the_copy() {
        let mut reader = std::io::Cursor::new(b"abc".to_vec());
        let mut sink = FailingSink;
        let err = copy_to_sink(&mut reader, &mut sink, None).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn gzip_round_trips() {
        let payload = b"hello hello hello hello hello".repeat(50);
        let mut gzip = GzipSink::new(VecSink::default());
        for chunk in payload.chunks(17) {
            gzip.send(chunk).await.unwrap();
        }
        let inner = gzip.finish().await.unwrap();

        let mut decoder = flate2::read::GzDecoder::new(inner.data.as_slice());
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }
}

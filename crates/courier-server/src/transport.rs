//! Record-level I/O over a byte stream.
//!
//! [`RecordReader`] pulls newline-delimited JSON records out of any
//! `AsyncRead`; [`RecordWriter`] writes them to any `AsyncWrite`. Both are
//! transport-agnostic so tests can drive them over in-memory pipes.

use courier_core::codec::LineDecoder;
use courier_core::{line_decode, line_encode, CourierError, CourierResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

pub struct RecordReader<R> {
    inner: R,
    decoder: LineDecoder,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(inner: R, max_line: usize) -> Self {
        Self {
            inner,
            decoder: LineDecoder::new(max_line),
            buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Read the next record.
    ///
    /// `Ok(None)` means the peer closed the stream. A malformed or oversized
    /// line yields a protocol error and leaves the reader positioned at the
    /// next line, so callers may skip it and keep reading.
    ///
    /// Cancel-safe: bytes are only consumed from the socket inside a single
    /// poll, and partial lines stay buffered across calls.
    pub async fn next_record<T: DeserializeOwned>(&mut self) -> CourierResult<Option<T>> {
        loop {
            if let Some(line) = self.decoder.next_line() {
                return line_decode(&line?).map(Some);
            }
            let n = self.inner.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }
}

pub struct RecordWriter<W> {
    inner: W,
    write_timeout: Option<Duration>,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            write_timeout: None,
        }
    }

    /// A writer whose every record must be written within `limit`, so a peer
    /// that stops reading cannot stall the caller.
    pub fn with_timeout(inner: W, limit: Duration) -> Self {
        Self {
            inner,
            write_timeout: Some(limit),
        }
    }

    /// Write one record and flush. Fails with [`CourierError::Timeout`] when
    /// the write limit is exceeded.
    pub async fn send<T: Serialize>(&mut self, record: &T) -> CourierResult<()> {
        let line = line_encode(record)?;
        match self.write_timeout {
            Some(limit) => tokio::time::timeout(limit, write_line(&mut self.inner, &line))
                .await
                .map_err(|_| CourierError::Timeout)?,
            None => write_line(&mut self.inner, &line).await,
        }
    }

    /// Close the write side of the stream.
    pub async fn shutdown(&mut self) -> CourierResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

async fn write_line<W: AsyncWrite + Unpin>(inner: &mut W, line: &[u8]) -> CourierResult<()> {
    inner.write_all(line).await?;
    inner.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::MessageRecord;

    #[tokio::test]
    async fn records_cross_a_pipe() {
        let (client, server) = tokio::io::duplex(256);
        let mut writer = RecordWriter::new(client);
        let mut reader = RecordReader::new(server, 1024);

        let rec = MessageRecord::new("alice", "bob", "hi", 1);
        writer.send(&rec).await.unwrap();
        writer.send(&rec).await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(reader.next_record::<MessageRecord>().await.unwrap(), Some(rec.clone()));
        assert_eq!(reader.next_record::<MessageRecord>().await.unwrap(), Some(rec));
        assert_eq!(reader.next_record::<MessageRecord>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_line_is_skippable() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = RecordReader::new(server, 1024);
        client
            .write_all(b"not json\n{\"sender\":\"a\",\"receiver\":\"b\",\"text\":\"ok\"}\n")
            .await
            .unwrap();
        drop(client);

        let err = reader.next_record::<MessageRecord>().await.unwrap_err();
        assert!(matches!(err, CourierError::Protocol(_)));
        let rec = reader.next_record::<MessageRecord>().await.unwrap().unwrap();
        assert_eq!(rec.text, "ok");
        assert!(reader.next_record::<MessageRecord>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stalled_peer_times_out() {
        let (client, _server) = tokio::io::duplex(64);
        let mut writer = RecordWriter::with_timeout(client, Duration::from_millis(50));
        let rec = MessageRecord::new("alice", "bob", &"x".repeat(200), 1);
        let err = writer.send(&rec).await.unwrap_err();
        assert!(matches!(err, CourierError::Timeout));
    }
}

//! Server-sent events framing for stream set outputs.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{StreamSet, StreamSetClosed};
use crate::correlation::CorrelationId;

const DATA_PREFIX: &str = "data: ";

#[derive(Debug, Error)]
pub enum SseError {
    #[error("failed to write event")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Closed(#[from] StreamSetClosed),
}

/// Writes payloads as `data: <payload>\n\n` events, flushing after each one.
///
/// A payload spanning several lines is written as one `data:` line per line, which readers join
/// back with `\n`. Payloads are written as raw bytes; a `\r` ending a line is not preserved.
pub struct SseWriter<W> {
    writer: W,
    written: u64,
}

impl<W: AsyncWrite + Unpin> SseWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub async fn write_event(&mut self, data: &[u8]) -> io::Result<()> {
        for line in data.split(|b| *b == b'\n') {
            self.writer.write_all(DATA_PREFIX.as_bytes()).await?;
            self.writer.write_all(line).await?;
            self.writer.write_all(b"\n").await?;
        }
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        self.written += 1;
        Ok(())
    }

    /// Write every payload from `output` until it closes.
    pub async fn run(&mut self, mut output: mpsc::Receiver<Bytes>) -> io::Result<()> {
        while let Some(data) = output.recv().await {
            self.write_event(&data).await?;
        }
        Ok(())
    }

    /// Attach to `set` under `id`, write until the stream is detached or the set shuts down,
    /// then detach.
    ///
    /// A write failure (typically the client went away) ends the session with an error; the
    /// stream is detached either way.
    pub async fn serve(&mut self, set: &StreamSet, id: CorrelationId) -> Result<(), SseError> {
        let output = set.attach(id).await?;
        debug!(stream = %id, "SSE session started");

        let result = self.run(output).await;
        if let Err(e) = &result {
            warn!(stream = %id, error = %e, "SSE client went away");
        }

        // The set may already be gone; that only means there is nothing left to detach
        let _ = set.detach(id).await;
        debug!(stream = %id, events = self.written, "SSE session ended");

        result.map_err(SseError::from)
    }

    /// Number of events written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Read the payloads back out of an event stream body.
///
/// Consecutive `data:` lines form one payload, joined with `\n`, and a blank line ends it.
/// Lines other than `data:` lines are skipped. Payload bytes need not be UTF-8.
pub fn read_events<R>(reader: R) -> impl Stream<Item = io::Result<Bytes>>
where
    R: AsyncBufRead + Unpin,
{
    async_stream::try_stream! {
        let mut lines = reader.split(b'\n');
        let mut event: Option<BytesMut> = None;

        while let Some(line) = lines.next_segment().await? {
            let line = line.strip_suffix(b"\r").unwrap_or(&line);

            if line.is_empty() {
                if let Some(data) = event.take() {
                    yield data.freeze();
                }
            } else if let Some(data) = line.strip_prefix(DATA_PREFIX.as_bytes()) {
                if let Some(pending) = event.as_mut() {
                    pending.put_u8(b'\n');
                    pending.put_slice(data);
                } else {
                    event = Some(BytesMut::from(data));
                }
            }
        }

        // A body cut off before its final blank line still delivers what it carried
        if let Some(data) = event.take() {
            yield data.freeze();
        }
    }
}

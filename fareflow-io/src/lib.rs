//! fareflow-io: line sources and CSV sinks.
//! - `LineReader`: newline-delimited text from a TCP socket, a file, or any buffered reader
//! - `CsvBatchSink`: one CSV file per batch index, never overwritten
//! - `CsvAppendSink`: a single CSV file that every batch appends to
//! - `ConsoleSink`: prints each batch as CSV to stdout

use std::path::Path;

use async_trait::async_trait;
use fareflow_core::{metrics, Error, LineSource, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub mod sink;

pub use sink::{encode_csv, ConsoleSink, CsvAppendSink, CsvBatchSink};

/// Reads newline-terminated lines until the underlying stream closes.
///
/// A trailing `\r` is stripped and invalid UTF-8 is replaced rather than rejected, so a
/// garbled line reaches the parser (and is dropped there) instead of killing the stream.
/// Read errors end the sequence with [`Error::Connection`]; there is no reconnect.
///
/// Lines longer than `max_line_bytes` are skipped up to the next newline and counted as
/// parse errors with reason `line_too_long`.
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    origin: String,
    max_line_bytes: usize,
}

/// Upper bound on a single line unless overridden with [`LineReader::with_max_line_bytes`].
pub const DEFAULT_MAX_LINE_BYTES: usize = 1 << 20;

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, origin: impl Into<String>) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            origin: origin.into(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max.max(1);
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Consume input up to and including the next newline. Returns the bytes skipped.
    async fn discard_line(&mut self) -> Result<u64> {
        let mut skipped = 0u64;
        loop {
            let (used, done) = {
                let chunk = self.reader.fill_buf().await.map_err(Error::Connection)?;
                match chunk.iter().position(|b| *b == b'\n') {
                    Some(i) => (i + 1, true),
                    None => (chunk.len(), chunk.is_empty()),
                }
            };
            self.reader.consume(used);
            skipped += used as u64;
            if done {
                return Ok(skipped);
            }
        }
    }
}

impl LineReader<BufReader<TcpStream>> {
    /// Connect to the event source.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(Error::Connection)?;
        info!(%host, port, "connected to event source");
        Ok(Self::new(BufReader::new(stream), format!("tcp://{host}:{port}")))
    }
}

impl LineReader<BufReader<tokio::fs::File>> {
    /// Replay a captured stream, one JSON event per line.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(BufReader::new(file), format!("file://{}", path.display())))
    }
}

#[async_trait]
impl<R> LineSource for LineReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            self.buf.clear();
            // one extra byte leaves room for the terminator of a line at the limit
            let limit = self.max_line_bytes as u64 + 1;
            let n = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(Error::Connection)?;
            if n == 0 {
                info!(origin = %self.origin, "event source closed");
                return Ok(None);
            }
            if self.buf.last() != Some(&b'\n') && self.buf.len() > self.max_line_bytes {
                let skipped = self.discard_line().await?;
                metrics::PARSE_ERRORS.with_label_values(&["line_too_long"]).inc();
                warn!(
                    origin = %self.origin,
                    bytes = self.buf.len() as u64 + skipped,
                    "dropping over-long line"
                );
                continue;
            }
            if self.buf.last() == Some(&b'\n') {
                self.buf.pop();
            }
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            debug!(len = line.len(), "line read");
            return Ok(Some(line));
        }
    }
}

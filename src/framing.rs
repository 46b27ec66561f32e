//! Newline-delimited JSON framing.
//!
//! Every transport in the multiplexer (agent stdio, client stdio, Unix socket
//! peers) speaks one JSON object per `\n`-terminated line. [`LineReader`]
//! accumulates bytes from an async reader and yields complete lines,
//! tolerating partial reads and skipping lines that exceed the size cap
//! without tearing down the stream. [`write_line`] is the matching write
//! half: one compact JSON line per message, flushed per write so peers see
//! messages promptly.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted line length. Lines longer than this are dropped whole;
/// the stream itself survives.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Incremental line reader over any async byte stream.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_line: usize,
    /// Bytes already discarded of an oversized line still being skipped.
    discarding: Option<usize>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_LINE_BYTES)
    }

    /// Like [`new`](Self::new) with a custom line cap.
    pub fn with_limit(inner: R, max_line: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            max_line,
            discarding: None,
        }
    }

    /// Read the next non-empty line, without its terminator.
    ///
    /// Returns `Ok(None)` on EOF. Oversized and non-UTF-8 lines are logged
    /// and skipped; only an error on the underlying descriptor ends the
    /// stream early.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            // Drain any complete lines already buffered.
            while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let rest = self.buf.split_off(pos + 1);
                let mut line = std::mem::replace(&mut self.buf, rest);
                line.pop();

                let skipped = self.discarding.take().unwrap_or(0);
                if skipped > 0 || line.len() > self.max_line {
                    log::warn!(
                        "dropped oversized line ({} bytes, cap {})",
                        skipped + line.len() + 1,
                        self.max_line
                    );
                    continue;
                }

                match String::from_utf8(line) {
                    Ok(text) => {
                        let trimmed = text.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        return Ok(Some(trimmed.to_string()));
                    }
                    Err(e) => {
                        log::warn!("dropped non-UTF-8 line: {e}");
                        continue;
                    }
                }
            }

            // A partial line past the cap cannot become valid; start skipping
            // so the buffer stays bounded.
            if self.buf.len() > self.max_line {
                let skipped = self.discarding.unwrap_or(0) + self.buf.len();
                self.discarding = Some(skipped);
                self.buf.clear();
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if !self.buf.is_empty() || self.discarding.is_some() {
                    log::debug!("discarding {} trailing bytes without newline", self.buf.len());
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Write one framed line: the payload, a newline, then flush.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Newline-delimited framing over a byte-stream socket with per-operation
//! timeouts. Timeout and EOF are distinguishable from plain IO errors; the
//! QMP client depends on that distinction for its yank recovery.

use std::future::Future;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::{ColodError, Result};

/// Run a future under an optional millisecond deadline. A timeout of 0 means
/// "no timeout".
pub async fn with_timeout<T>(
    timeout_ms: u64,
    what: &str,
    fut: impl Future<Output = T>,
) -> Result<T> {
    if timeout_ms == 0 {
        Ok(fut.await)
    } else {
        tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
            .await
            .map_err(|_| ColodError::Timeout(what.to_string()))
    }
}

/// Write a whole buffer and flush, under an optional timeout.
pub async fn write_all<W: AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &[u8],
    timeout_ms: u64,
) -> Result<()> {
    with_timeout(timeout_ms, "Channel write timed out", async {
        writer.write_all(buf).await?;
        writer.flush().await?;
        Ok(())
    })
    .await?
}

/// Buffered line reader. Bytes read before a timeout stay in `partial`, so a
/// timed-out `read_line` can be retried without losing data.
pub struct LineReader<R> {
    inner: BufReader<R>,
    partial: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            partial: Vec::new(),
        }
    }

    /// Read up to the next newline (stripped from the result).
    pub async fn read_line(&mut self, timeout_ms: u64) -> Result<String> {
        with_timeout(timeout_ms, "Channel read timed out", self.read_line_inner()).await?
    }

    async fn read_line_inner(&mut self) -> Result<String> {
        loop {
            let buf = self.inner.fill_buf().await?;
            if buf.is_empty() {
                return Err(ColodError::Eof);
            }

            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.partial.extend_from_slice(&buf[..pos]);
                    self.inner.consume(pos + 1);
                    let raw = std::mem::take(&mut self.partial);
                    let mut line = String::from_utf8_lossy(&raw).into_owned();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                    return Ok(line);
                }
                None => {
                    self.partial.extend_from_slice(buf);
                    let len = buf.len();
                    self.inner.consume(len);
                }
            }
        }
    }
}

/// A framed unix-socket connection: line-oriented reads and writes plus
/// half-close.
pub struct LineChannel {
    reader: LineReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    fd: RawFd,
}

impl LineChannel {
    pub fn new(stream: UnixStream) -> Self {
        let fd = stream.as_raw_fd();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: LineReader::new(read_half),
            writer: write_half,
            fd,
        }
    }

    pub async fn read_line(&mut self, timeout_ms: u64) -> Result<String> {
        self.reader.read_line(timeout_ms).await
    }

    pub async fn write_all(&mut self, buf: &[u8], timeout_ms: u64) -> Result<()> {
        write_all(&mut self.writer, buf, timeout_ms).await
    }

    /// Write one line, appending the newline.
    pub async fn write_line(&mut self, line: &str, timeout_ms: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.write_all(&buf, timeout_ms).await
    }

    /// Shut the socket down in both directions. Pending reads observe EOF.
    pub fn shutdown(&self) {
        let _ = nix::sys::socket::shutdown(self.fd, nix::sys::socket::Shutdown::Both);
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn into_parts(self) -> (LineReader<OwnedReadHalf>, OwnedWriteHalf) {
        (self.reader, self.writer)
    }
}

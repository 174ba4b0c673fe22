//! Framed TCP Server
//!
//! One request per connection: an ASCII decimal byte count, a newline, then
//! exactly that many bytes of UTF-8 request document. The response document
//! is written back followed by a newline and the connection closes.
//!
//! Workers are drawn from a bounded pool. When the pool is exhausted new
//! connections are closed at accept instead of queueing.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::protocol;
use crate::router::Router;

/// Longest accepted count line, newline included. A frame announcing more
/// than a 19-digit payload is nonsense.
const MAX_COUNT_LINE: u64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame size line")]
    CountLine,

    #[error("frame of {0} bytes exceeds the limit of {1}")]
    TooLarge(usize, usize),

    #[error("request payload is not valid UTF-8")]
    Utf8,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct ExchangeServer {
    router: Arc<Router>,
    permits: Arc<Semaphore>,
    read_timeout: Duration,
    max_frame_bytes: usize,
}

impl ExchangeServer {
    pub fn new(router: Router, config: &AppConfig) -> Self {
        Self {
            router: Arc::new(router),
            permits: Arc::new(Semaphore::new(config.worker_count)),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    /// Accept connections until the process is terminated.
    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => {
                    debug!("accepted connection from {}", peer);
                    let router = Arc::clone(&self.router);
                    let read_timeout = self.read_timeout;
                    let max_frame_bytes = self.max_frame_bytes;
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, router, read_timeout, max_frame_bytes).await
                        {
                            warn!("connection from {} failed: {}", peer, e);
                        }
                        drop(permit);
                    });
                }
                Err(_) => {
                    warn!("worker pool exhausted, dropping connection from {}", peer);
                    drop(stream);
                }
            }
        }
    }
}

/// Serve one framed request and close.
///
/// A read timeout drops the connection without a response; a framing or
/// document error still gets a top-level error document back. The response
/// is written regardless of what the peer does mid-processing.
async fn handle_connection(
    mut stream: TcpStream,
    router: Arc<Router>,
    read_timeout: Duration,
    max_frame_bytes: usize,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    let payload = match timeout(read_timeout, read_frame(&mut reader, max_frame_bytes)).await {
        Err(_) => {
            debug!("read timed out, dropping connection");
            return Ok(());
        }
        Ok(Err(e)) => {
            debug!("framing error: {}", e);
            let response = protocol::render_fatal(&e.to_string());
            return write_frame(&mut writer, &response).await;
        }
        Ok(Ok(payload)) => payload,
    };

    let response = router.dispatch(&payload).await;
    write_frame(&mut writer, &response).await
}

/// Read one length-prefixed frame: a decimal byte count line, then exactly
/// that many bytes, draining short reads until the count is satisfied or
/// the peer closes.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<String, FrameError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = Vec::new();
    let mut limited = reader.take(MAX_COUNT_LINE);
    limited.read_until(b'\n', &mut line).await?;
    if !line.ends_with(b"\n") {
        return Err(FrameError::CountLine);
    }
    let reader = limited.into_inner();

    let size: usize = std::str::from_utf8(&line)
        .map_err(|_| FrameError::CountLine)?
        .trim()
        .parse()
        .map_err(|_| FrameError::CountLine)?;
    if size > max_frame_bytes {
        return Err(FrameError::TooLarge(size, max_frame_bytes));
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    String::from_utf8(payload).map_err(|_| FrameError::Utf8)
}

/// Write one response frame: the document bytes and a trailing newline.
pub async fn write_frame<W>(writer: &mut W, document: &str) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(document.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Bind the configured listen address.
pub async fn bind(config: &AppConfig) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("listening on port {}", config.port);
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const LIMIT: usize = 1024 * 1024;

    async fn frame(bytes: &[u8]) -> Result<String, FrameError> {
        let mut reader = BufReader::new(Cursor::new(bytes.to_vec()));
        read_frame(&mut reader, LIMIT).await
    }

    #[tokio::test]
    async fn reads_an_exact_frame() {
        let payload = frame(b"9\n<create/>").await.unwrap();
        assert_eq!(payload, "<create/>");
    }

    #[tokio::test]
    async fn tolerates_carriage_return_in_the_count_line() {
        let payload = frame(b"9\r\n<create/>").await.unwrap();
        assert_eq!(payload, "<create/>");
    }

    #[tokio::test]
    async fn trailing_bytes_beyond_the_count_are_ignored() {
        let payload = frame(b"9\n<create/><garbage/>").await.unwrap();
        assert_eq!(payload, "<create/>");
    }

    #[tokio::test]
    async fn rejects_non_numeric_count_lines() {
        assert!(matches!(frame(b"nine\n<create/>").await, Err(FrameError::CountLine)));
        assert!(matches!(frame(b"\n").await, Err(FrameError::CountLine)));
    }

    #[tokio::test]
    async fn rejects_an_unterminated_count_line() {
        // 21 digits with no newline within the cap.
        assert!(matches!(
            frame(b"111111111111111111111").await,
            Err(FrameError::CountLine)
        ));
    }

    #[tokio::test]
    async fn rejects_oversized_frames() {
        let mut reader = BufReader::new(Cursor::new(b"99\nx".to_vec()));
        assert!(matches!(
            read_frame(&mut reader, 10).await,
            Err(FrameError::TooLarge(99, 10))
        ));
    }

    #[tokio::test]
    async fn premature_eof_is_an_io_error() {
        assert!(matches!(frame(b"100\n<create/>").await, Err(FrameError::Io(_))));
    }

    #[tokio::test]
    async fn write_frame_appends_a_newline() {
        let mut out = Vec::new();
        write_frame(&mut out, "<results></results>").await.unwrap();
        assert_eq!(out, b"<results></results>\n");
    }
}

//! `Content-Length` framing for JSON-RPC over a byte stream

use crate::types::LspError;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

/// Upper bound on a single message body
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Write one framed message and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &str) -> std::io::Result<()> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next message body. `Ok(None)` on a clean EOF.
    ///
    /// Lines before the first `Content-Length` that are not headers are
    /// skipped; some servers print log noise to stdout at startup.
    pub async fn read_frame(&mut self) -> Result<Option<String>, LspError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_header = false;

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                if !saw_header {
                    return Ok(None);
                }
                return Err(LspError::ProtocolError(
                    "unexpected EOF while reading headers".to_string(),
                ));
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                if content_length.is_some() {
                    break;
                }
                continue;
            }

            match trimmed.split_once(':') {
                Some((key, value)) if key.eq_ignore_ascii_case("Content-Length") => {
                    let len = value.trim().parse::<usize>().map_err(|e| {
                        LspError::ProtocolError(format!("Invalid Content-Length: {}", e))
                    })?;
                    content_length = Some(len);
                    saw_header = true;
                }
                Some((key, _)) if key.starts_with("Content-") => {
                    saw_header = true;
                }
                _ if content_length.is_none() => {
                    debug!("Skipping non-protocol output: {}", trimmed);
                }
                _ => {
                    trace!("Ignoring header line: {}", trimmed);
                }
            }
        }

        let content_length = content_length.unwrap_or_default();
        if content_length > MAX_FRAME_BYTES {
            return Err(LspError::ProtocolError(format!(
                "Content-Length {} exceeds maximum {}",
                content_length, MAX_FRAME_BYTES
            )));
        }

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await?;

        String::from_utf8(body)
            .map(Some)
            .map_err(|e| LspError::ProtocolError(format!("Invalid UTF-8 in message: {}", e)))
    }
}

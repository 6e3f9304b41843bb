use anyhow::{Context, Result};
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::cache::CacheEntry;
use super::headers::HeaderList;

pub const FORBIDDEN_RESPONSE: &[u8] = b"HTTP/1.1 403 Connection forbidden\r\n\r\n";
pub const CONNECT_ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

pub async fn send_forbidden<W>(writer: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    write_fixed(writer, FORBIDDEN_RESPONSE, "writing forbidden response").await
}

pub async fn send_connect_established<W>(writer: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    write_fixed(
        writer,
        CONNECT_ESTABLISHED_RESPONSE,
        "writing CONNECT response",
    )
    .await
}

async fn write_fixed<W>(writer: &mut W, bytes: &[u8], action: &'static str) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await.context(action)?;
    writer.flush().await.context(action)?;
    Ok(bytes.len() as u64)
}

/// `HTTP/1.0 <code> <reason>`, one line per header, blank line.
pub fn encode_response_head(status: StatusCode, reason: &str, headers: &HeaderList) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(format!("HTTP/1.0 {} {}\r\n", status.as_u16(), reason).as_bytes());
    headers.encode_into(&mut buffer);
    buffer.extend_from_slice(b"\r\n");
    buffer
}

/// Writes a stored response without contacting the upstream.
pub async fn serve_cached<W>(writer: &mut W, entry: &CacheEntry) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let head = encode_response_head(entry.status(), entry.reason(), entry.headers());
    writer
        .write_all(&head)
        .await
        .context("writing cached response head")?;
    let mut written = head.len() as u64;
    if let Some(body) = entry.body() {
        writer
            .write_all(body)
            .await
            .context("writing cached response body")?;
        written += body.len() as u64;
    }
    writer.flush().await.context("flushing cached response")?;
    Ok(written)
}

use std::net::SocketAddr;

use anyhow::{Result, anyhow, bail, ensure};
use http::StatusCode;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::headers::HeaderList;

/// Reads one `\n`-terminated line into `buf`, returning the number of bytes
/// consumed. Returns 0 only when the peer closed before sending anything.
pub(crate) async fn read_line<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let available = reader.fill_buf().await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow for {peer}"))?
            > max_len
        {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string = String::from_utf8(collected)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderList,
    pub content_length: Option<u64>,
}

pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    loop {
        let head = read_single_response_head(reader, peer, max_header_bytes).await?;
        // 1xx interim responses carry no body; the final head follows.
        if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            continue;
        }
        return Ok(head);
    }
}

async fn read_single_response_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut remaining = max_header_bytes;
    let mut line = String::new();

    let read = read_line(reader, &mut line, peer, remaining).await?;
    if read == 0 {
        bail!("upstream {peer} closed connection before sending status line");
    }
    remaining = remaining.saturating_sub(read);
    let (status, reason) = parse_status_line(line.trim_end_matches(['\r', '\n']))?;

    let mut headers = HeaderList::new();
    let mut content_length = None;
    loop {
        if remaining == 0 {
            bail!("upstream {peer} response headers exceed {max_header_bytes} bytes");
        }
        let read = read_line(reader, &mut line, peer, remaining).await?;
        if read == 0 {
            bail!("upstream {peer} closed connection during headers");
        }
        remaining = remaining.saturating_sub(read);
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from upstream {peer}"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            bail!("empty header name from upstream {peer}");
        }
        if name.eq_ignore_ascii_case("content-length") && content_length.is_none() {
            let length = value
                .parse::<u64>()
                .map_err(|_| anyhow!("invalid Content-Length '{value}' from upstream {peer}"))?;
            content_length = Some(length);
        }
        headers.push(name, value);
    }

    Ok(ResponseHead {
        status,
        reason,
        headers,
        content_length,
    })
}

/// Parses `HTTP/1.x <code> [reason]`. A missing reason falls back to the
/// canonical one for the code.
pub(crate) fn parse_status_line(line: &str) -> Result<(StatusCode, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        bail!("invalid status line '{line}'");
    }
    let code = parts
        .next()
        .ok_or_else(|| anyhow!("status line missing code: '{line}'"))?;
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| anyhow!("invalid status code '{code}'"))?;
    let reason = match parts.next().map(str::trim) {
        Some(reason) if !reason.is_empty() => reason.to_string(),
        _ => status.canonical_reason().unwrap_or("Unknown").to_string(),
    };
    Ok((status, reason))
}

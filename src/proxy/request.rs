use std::net::SocketAddr;

use anyhow::Result;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::trace;

const CONNECT_DEFAULT_PORT: u16 = 80;
const HTTP_DEFAULT_PORT: u16 = 80;

/// Request-line failures. The connection is closed without a response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestLineError {
    #[error("client sent no request line")]
    EmptyRequest,
    #[error("request line '{0}' has fewer than three tokens")]
    TooShort(String),
    #[error("malformed request target '{0}'")]
    MalformedTarget(String),
    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
    #[error("request head is not valid UTF-8")]
    InvalidUtf8,
}

/// Raw lines of a client request head, without line terminators and
/// without the terminating blank line.
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    lines: Vec<String>,
    bytes: usize,
}

impl RequestHead {
    pub fn from_lines<I, L>(lines: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        let bytes = lines.iter().map(|line| line.len() + 2).sum();
        Self { lines, bytes }
    }

    pub fn request_line(&self) -> Option<&str> {
        self.lines.first().map(String::as_str)
    }

    /// Value of the first header line named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.lines.iter().skip(1).find_map(|line| {
            let (candidate, value) = line.split_once(':')?;
            candidate
                .trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent").filter(|value| !value.is_empty())
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Bytes consumed from the client, terminators included.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Reads lines up to the first blank line or EOF. Bytes the client sent after
/// the blank line stay buffered in `reader`.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    max_header_size: usize,
) -> Result<RequestHead>
where
    S: AsyncRead + Unpin,
{
    let mut head = RequestHead::default();

    loop {
        let remaining = max_header_size.saturating_sub(head.bytes);
        let Some((line, consumed)) = read_head_line(reader, remaining, max_header_size).await?
        else {
            break;
        };
        head.bytes += consumed;
        if line.is_empty() {
            break;
        }
        trace!(peer = %peer, line = %line, "request head line");
        head.lines.push(line);
    }

    if head.lines.is_empty() {
        return Err(RequestLineError::EmptyRequest.into());
    }
    Ok(head)
}

async fn read_head_line<S>(
    reader: &mut BufReader<S>,
    remaining: usize,
    limit: usize,
) -> Result<Option<(String, usize)>>
where
    S: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());
        if collected.len() + consume > remaining {
            return Err(RequestLineError::HeadTooLarge { limit }.into());
        }
        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);
        if newline_pos.is_some() {
            break;
        }
    }

    if collected.is_empty() {
        return Ok(None);
    }
    let consumed = collected.len();
    let mut line = String::from_utf8(collected).map_err(|_| RequestLineError::InvalidUtf8)?;
    while line.ends_with(['\r', '\n']) {
        line.pop();
    }
    Ok(Some((line, consumed)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Connect,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    /// Tunnel host for CONNECT; the full request URL otherwise.
    pub host: String,
    pub port: u16,
    pub kind: RequestKind,
}

impl ParsedRequest {
    pub fn parse(line: &str) -> Result<Self, RequestLineError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 {
            return Err(RequestLineError::TooShort(line.to_string()));
        }
        let method = tokens[0];
        let target = tokens[1];

        if method.eq_ignore_ascii_case("CONNECT") {
            let (host, port) = parse_connect_target(target)?;
            return Ok(Self {
                method: method.to_string(),
                target: target.to_string(),
                host,
                port,
                kind: RequestKind::Connect,
            });
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            host: target.to_string(),
            port: HTTP_DEFAULT_PORT,
            kind: RequestKind::Http,
        })
    }

    /// What the blocklist is matched against.
    pub fn firewall_subject(&self) -> &str {
        &self.host
    }
}

fn parse_connect_target(target: &str) -> Result<(String, u16), RequestLineError> {
    let malformed = || RequestLineError::MalformedTarget(target.to_string());
    let (host, port) = target.rsplit_once(':').ok_or_else(malformed)?;

    let host = host
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(malformed());
    }

    let port = if port.is_empty() {
        CONNECT_DEFAULT_PORT
    } else {
        port.parse::<u16>().map_err(|_| malformed())?
    };
    Ok((host.to_string(), port))
}

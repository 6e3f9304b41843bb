use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow};
use http::{StatusCode, Uri};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, lookup_host};
use tracing::debug;

use super::codec::read_response_head;
use super::headers::HeaderList;

const DEFAULT_HTTP_PORT: u16 = 80;

/// Resolves `host` and connects to the first address that accepts.
pub async fn connect(host: &str, port: u16) -> Result<(TcpStream, SocketAddr)> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .collect();
    connect_to_addrs(&addrs)
        .await
        .with_context(|| format!("failed to connect to {host}:{port}"))
}

/// Attempt to connect to the supplied socket addresses in order.
pub async fn connect_to_addrs(addrs: &[SocketAddr]) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on upstream stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to upstream");
                return Ok((stream, *addr));
            }
            Err(err) => {
                last_err = Some(anyhow!(err).context(format!("failed to connect to {addr}")));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses provided for upstream connect")))
}

/// Final response head from upstream with the unread body still on the wire.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderList,
    pub content_length: Option<u64>,
    pub body: BufReader<TcpStream>,
    pub upstream_addr: SocketAddr,
}

/// Issues a `GET` for an absolute `http://` URL. Only the `User-Agent`
/// is carried over from the client request.
pub async fn fetch(
    uri: &Uri,
    user_agent: Option<&str>,
    max_header_bytes: usize,
) -> Result<UpstreamResponse> {
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("request URL '{uri}' has no host"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host);
    let port = uri.port_u16().unwrap_or(DEFAULT_HTTP_PORT);
    let (mut stream, upstream_addr) = connect(host, port).await?;

    let request = encode_get_request(uri, user_agent)?;
    stream
        .write_all(&request)
        .await
        .with_context(|| format!("failed to send request to {upstream_addr}"))?;
    stream.flush().await?;

    let mut body = BufReader::new(stream);
    let head = read_response_head(&mut body, upstream_addr, max_header_bytes)
        .await
        .with_context(|| format!("failed to read response head from {upstream_addr}"))?;

    Ok(UpstreamResponse {
        status: head.status,
        reason: head.reason,
        headers: head.headers,
        content_length: head.content_length,
        body,
        upstream_addr,
    })
}

fn encode_get_request(uri: &Uri, user_agent: Option<&str>) -> Result<Vec<u8>> {
    let authority = uri
        .authority()
        .ok_or_else(|| anyhow!("request URL '{uri}' has no authority"))?;
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");

    // HTTP/1.0 keeps origins from answering with a chunked body, which the
    // cache could not frame.
    let mut request = Vec::with_capacity(128);
    request.extend_from_slice(format!("GET {path} HTTP/1.0\r\n").as_bytes());
    request.extend_from_slice(format!("Host: {}\r\n", authority.as_str()).as_bytes());
    if let Some(agent) = user_agent {
        request.extend_from_slice(format!("User-Agent: {agent}\r\n").as_bytes());
    }
    request.extend_from_slice(b"Connection: close\r\n\r\n");
    Ok(request)
}

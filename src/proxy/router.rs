use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::{StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use super::AppContext;
use super::cache::CacheKey;
use super::forward::forward_and_cache;
use super::request::{ParsedRequest, RequestHead, RequestKind, RequestLineError};
use super::{respond, tunnel, upstream};
use crate::logging::AccessLogBuilder;

/// Dispatches one parsed request head. Every outcome closes the client
/// connection; malformed requests get no response at all.
pub async fn route<S>(
    client: BufReader<S>,
    peer: SocketAddr,
    head: RequestHead,
    app: &AppContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let started = Instant::now();
    let log = AccessLogBuilder::new(peer);
    let request_line = head.request_line().unwrap_or_default();

    let request = match ParsedRequest::parse(request_line) {
        Ok(request) => request,
        Err(err) => {
            log_failure(log, started, head.bytes() as u64, 0, &err.to_string());
            return Err(err.into());
        }
    };
    let log = log
        .method(request.method.as_str())
        .host(request.host.as_str())
        .target(request.target.as_str());

    if let Some(blocklist) = &app.blocklist
        && !blocklist.is_allowed(request.firewall_subject())
    {
        return deny(client, &head, log, started).await;
    }

    match request.kind {
        RequestKind::Connect => route_connect(client, &head, &request, log, started).await,
        RequestKind::Http => route_http(client, &head, &request, app, log, started).await,
    }
}

async fn deny<S>(
    mut client: BufReader<S>,
    head: &RequestHead,
    log: AccessLogBuilder,
    started: Instant,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let written = match respond::send_forbidden(&mut client).await {
        Ok(written) => written,
        Err(err) => {
            log_failure(log, started, head.bytes() as u64, 0, &format!("{err:#}"));
            return Err(err);
        }
    };
    close_client(&mut client).await;
    log.decision("DENY")
        .status(StatusCode::FORBIDDEN)
        .bytes(head.bytes() as u64, written)
        .elapsed(started.elapsed())
        .log();
    Ok(())
}

async fn route_connect<S>(
    mut client: BufReader<S>,
    head: &RequestHead,
    request: &ParsedRequest,
    log: AccessLogBuilder,
    started: Instant,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes_in = head.bytes() as u64;
    let (upstream, upstream_addr) = match upstream::connect(&request.host, request.port).await {
        Ok(connected) => connected,
        Err(err) => {
            log_failure(log, started, bytes_in, 0, &format!("{err:#}"));
            return Err(err);
        }
    };

    let handshake = match respond::send_connect_established(&mut client).await {
        Ok(written) => written,
        Err(err) => {
            let log = log.upstream_addr(upstream_addr.to_string());
            log_failure(log, started, bytes_in, 0, &format!("{err:#}"));
            return Err(err);
        }
    };

    // The client half is still wrapped in its BufReader, so bytes sent after
    // the request head are relayed first.
    let stats = tunnel::run(client, upstream).await;
    debug!(
        host = %request.host,
        port = request.port,
        finished_first = ?stats.finished_first,
        "tunnel finished"
    );

    let mut log = log
        .decision("TUNNEL")
        .status(StatusCode::OK)
        .bytes(
            bytes_in + stats.client_bytes,
            handshake + stats.upstream_bytes,
        )
        .upstream_addr(upstream_addr.to_string())
        .elapsed(started.elapsed());
    if let Some(err) = &stats.error {
        log = log.error_detail(err.to_string());
    }
    log.log();
    Ok(())
}

async fn route_http<S>(
    mut client: BufReader<S>,
    head: &RequestHead,
    request: &ParsedRequest,
    app: &AppContext,
    log: AccessLogBuilder,
    started: Instant,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes_in = head.bytes() as u64;
    let uri = match parse_http_url(&request.target) {
        Ok(uri) => uri,
        Err(err) => {
            log_failure(log, started, bytes_in, 0, &err.to_string());
            return Err(err.into());
        }
    };
    let key = CacheKey::new(request.target.as_str(), head.user_agent());

    let (log, result) = match app.cache.lookup(&key) {
        Some(entry) => {
            trace!(uri = %uri, "cache hit");
            let log = log.cache_lookup("hit");
            match respond::serve_cached(&mut client, &entry).await {
                Ok(written) => (
                    log.decision("ALLOW")
                        .status(entry.status())
                        .bytes(bytes_in, written),
                    Ok(()),
                ),
                Err(err) => (log, Err(err)),
            }
        }
        None => {
            trace!(uri = %uri, "cache miss");
            let log = log.cache_lookup("miss");
            match forward_and_cache(&mut client, &uri, key, app).await {
                Ok(outcome) => (
                    log.decision("ALLOW")
                        .status(outcome.status)
                        .bytes(bytes_in, outcome.bytes_out)
                        .cache_store(outcome.cache_store.as_str())
                        .upstream_addr(outcome.upstream_addr.to_string()),
                    Ok(()),
                ),
                Err(err) => (log, Err(err)),
            }
        }
    };
    close_client(&mut client).await;

    match result {
        Ok(()) => {
            log.elapsed(started.elapsed()).log();
            Ok(())
        }
        Err(err) => {
            log_failure(log, started, bytes_in, 0, &format!("{err:#}"));
            Err(err)
        }
    }
}

/// Accepts only absolute `http://` URLs with an authority.
fn parse_http_url(target: &str) -> Result<Uri, RequestLineError> {
    let malformed = || RequestLineError::MalformedTarget(target.to_string());
    let uri: Uri = target.parse().map_err(|_| malformed())?;
    if uri.scheme_str() != Some("http") || uri.authority().is_none() {
        return Err(malformed());
    }
    Ok(uri)
}

async fn close_client<W>(client: &mut W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = client.flush().await {
        trace!(error = %err, "flush before close failed");
    }
    if let Err(err) = client.shutdown().await {
        trace!(error = %err, "client shutdown failed");
    }
}

fn log_failure(
    log: AccessLogBuilder,
    started: Instant,
    bytes_in: u64,
    bytes_out: u64,
    detail: &str,
) {
    log.decision("ERROR")
        .bytes(bytes_in, bytes_out)
        .elapsed(started.elapsed())
        .error_detail(detail)
        .log();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::Blocklist;
    use crate::proxy::cache::{CacheEntry, CachePolicy, HttpCache};
    use crate::proxy::headers::HeaderList;
    use crate::settings::Settings;
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, duplex};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn app(blocklist: Option<Arc<Blocklist>>) -> AppContext {
        AppContext::new(
            Arc::new(Settings::default()),
            blocklist,
            HttpCache::new(CachePolicy::default()),
        )
    }

    async fn exchange(lines: &[&str], app: &AppContext) -> (Result<()>, Vec<u8>) {
        let (server, mut client) = duplex(16 * 1024);
        let head = RequestHead::from_lines(lines.iter().copied());
        let result = route(BufReader::new(server), peer(), head, app).await;
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        (result, received)
    }

    #[tokio::test]
    async fn blocked_target_gets_exact_forbidden_response() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("blocked.txt");
        std::fs::write(&path, ".*blocked\\.test\n")?;
        let app = app(Some(Arc::new(Blocklist::load(&path)?)));

        let (result, received) = exchange(
            &["GET http://www.blocked.test/page HTTP/1.1", "Host: www.blocked.test"],
            &app,
        )
        .await;
        result?;
        assert_eq!(received, b"HTTP/1.1 403 Connection forbidden\r\n\r\n");
        assert_eq!(app.cache.hits(), 0);
        assert!(app.cache.is_empty());

        let (result, received) = exchange(&["CONNECT blocked.test:443 HTTP/1.1"], &app).await;
        result?;
        assert_eq!(received, b"HTTP/1.1 403 Connection forbidden\r\n\r\n");
        Ok(())
    }

    #[tokio::test]
    async fn fresh_entry_is_served_from_cache() -> Result<()> {
        let app = app(None);
        let headers: HeaderList = [("Content-Length", "5"), ("X-Proxied-By", "cachegate")]
            .into_iter()
            .collect();
        app.cache.insert(CacheEntry::new(
            CacheKey::new("http://example.test/a", Some("agent/1")),
            None,
            StatusCode::OK,
            "OK",
            headers,
            Some(Bytes::from_static(b"hello")),
        ));

        let (result, received) = exchange(
            &["GET http://example.test/a HTTP/1.1", "User-Agent: agent/1"],
            &app,
        )
        .await;
        result?;
        assert_eq!(
            received,
            b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\nX-Proxied-By: cachegate\r\n\r\nhello"
        );
        assert_eq!(app.cache.hits(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_requests_are_closed_without_response() {
        let app = app(None);
        for lines in [
            &["GET /relative HTTP/1.1"][..],
            &["GET http://example.test/"][..],
            &["CONNECT example.test HTTP/1.1"][..],
            &["GET https://example.test/ HTTP/1.1"][..],
        ] {
            let (result, received) = exchange(lines, &app).await;
            let err = result.unwrap_err();
            assert!(err.downcast_ref::<RequestLineError>().is_some(), "{err:#}");
            assert!(received.is_empty());
        }
    }

    #[test]
    fn http_url_must_be_absolute() {
        assert!(parse_http_url("http://example.test/a?b").is_ok());
        assert!(parse_http_url("/a").is_err());
        assert!(parse_http_url("ftp://example.test/").is_err());
    }
}

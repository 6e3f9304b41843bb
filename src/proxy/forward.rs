use std::net::SocketAddr;

use anyhow::{Context, Result};
use http::{StatusCode, Uri};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::AppContext;
use super::cache::{CacheKey, PendingEntry};
use super::headers::process_response_headers;
use super::respond::encode_response_head;
use super::upstream;

const UNKNOWN_LENGTH_CHUNK: usize = 8 * 1024;
const MAX_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStoreOutcome {
    Stored,
    /// Another request stored the same key first.
    Duplicate,
    Uncacheable,
    /// Cacheable, but the body was too large or incomplete.
    Abandoned,
}

impl CacheStoreOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStoreOutcome::Stored => "stored",
            CacheStoreOutcome::Duplicate => "duplicate",
            CacheStoreOutcome::Uncacheable => "uncacheable",
            CacheStoreOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForwardOutcome {
    pub status: StatusCode,
    pub bytes_out: u64,
    pub cache_store: CacheStoreOutcome,
    pub upstream_addr: SocketAddr,
}

/// Fetches `uri` from the upstream, relays the response to `client` and
/// stores it when the response headers allow it. The client writer is left
/// open; the caller closes it.
pub async fn forward_and_cache<W>(
    client: &mut W,
    uri: &Uri,
    key: CacheKey,
    app: &AppContext,
) -> Result<ForwardOutcome>
where
    W: AsyncWrite + Unpin,
{
    let mut response = upstream::fetch(uri, key.user_agent(), app.settings.max_header_size).await?;
    let upstream_addr = response.upstream_addr;
    let decision = app.cache.can_cache(&response.headers);
    let headers = process_response_headers(&response.headers);

    let head = encode_response_head(response.status, &response.reason, &headers);
    client
        .write_all(&head)
        .await
        .context("writing response head to client")?;
    let mut bytes_out = head.len() as u64;

    let mut cache_store = CacheStoreOutcome::Uncacheable;
    let mut pending = None;
    if decision.cacheable {
        pending = PendingEntry::new(
            key,
            decision.expires_at,
            response.status,
            response.reason.clone(),
            headers,
            response.content_length,
            app.settings.cache_max_entry_size,
        );
        if pending.is_none() {
            debug!(uri = %uri, "declared body exceeds cache entry limit");
            cache_store = CacheStoreOutcome::Abandoned;
        }
    }

    let mut body = (&mut response.body).take(response.content_length.unwrap_or(u64::MAX));
    let mut buffer = vec![0u8; chunk_size(response.content_length)];
    loop {
        let read = body
            .read(&mut buffer)
            .await
            .with_context(|| format!("reading response body from {upstream_addr}"))?;
        if read == 0 {
            break;
        }
        client
            .write_all(&buffer[..read])
            .await
            .context("writing response body to client")?;
        bytes_out += read as u64;
        trace!(bytes = read, "relayed body chunk");

        if let Some(entry) = pending.as_mut()
            && !entry.push(&buffer[..read])
        {
            debug!(uri = %uri, "response body exceeds cache entry limit");
            pending = None;
            cache_store = CacheStoreOutcome::Abandoned;
        }
    }
    client.flush().await.context("flushing response to client")?;

    if let Some(entry) = pending {
        cache_store = match entry.finish() {
            Some(entry) => {
                if app.cache.insert(entry) {
                    CacheStoreOutcome::Stored
                } else {
                    CacheStoreOutcome::Duplicate
                }
            }
            None => CacheStoreOutcome::Abandoned,
        };
    }

    Ok(ForwardOutcome {
        status: response.status,
        bytes_out,
        cache_store,
        upstream_addr,
    })
}

/// Read buffer size: the declared length clamped to 64 KiB, or 8 KiB when
/// the length is unknown.
fn chunk_size(content_length: Option<u64>) -> usize {
    match content_length {
        Some(len) => usize::try_from(len).unwrap_or(MAX_CHUNK).clamp(1, MAX_CHUNK),
        None => UNKNOWN_LENGTH_CHUNK,
    }
}

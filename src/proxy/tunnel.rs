use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

pub const TUNNEL_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelDirection {
    ClientToUpstream,
    UpstreamToClient,
}

#[derive(Debug)]
pub struct TunnelStats {
    /// Bytes relayed from the client to the upstream.
    pub client_bytes: u64,
    /// Bytes relayed from the upstream to the client.
    pub upstream_bytes: u64,
    pub finished_first: TunnelDirection,
    /// Error that ended the session; `None` for a plain end of stream.
    pub error: Option<io::Error>,
}

/// Relays bytes both ways until either direction reaches end of stream or
/// fails. The other direction is abandoned without draining, then both
/// write halves are shut down and both streams dropped.
pub async fn run<C, U>(client: C, upstream: U) -> TunnelStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut upstream_reader, mut upstream_writer) = tokio::io::split(upstream);
    let mut client_bytes = 0u64;
    let mut upstream_bytes = 0u64;

    let (finished_first, error) = {
        let client_to_upstream = relay(
            &mut client_reader,
            &mut upstream_writer,
            &mut client_bytes,
            TunnelDirection::ClientToUpstream,
        );
        let upstream_to_client = relay(
            &mut upstream_reader,
            &mut client_writer,
            &mut upstream_bytes,
            TunnelDirection::UpstreamToClient,
        );
        tokio::pin!(client_to_upstream, upstream_to_client);

        tokio::select! {
            result = &mut client_to_upstream => (TunnelDirection::ClientToUpstream, result.err()),
            result = &mut upstream_to_client => (TunnelDirection::UpstreamToClient, result.err()),
        }
    };

    if let Err(err) = client_writer.shutdown().await {
        trace!(error = %err, "client shutdown after tunnel failed");
    }
    if let Err(err) = upstream_writer.shutdown().await {
        trace!(error = %err, "upstream shutdown after tunnel failed");
    }
    drop((client_reader, client_writer));
    drop((upstream_reader, upstream_writer));

    debug!(
        client_bytes,
        upstream_bytes,
        finished_first = ?finished_first,
        "tunnel closed"
    );
    TunnelStats {
        client_bytes,
        upstream_bytes,
        finished_first,
        error,
    }
}

async fn relay<R, W>(
    reader: &mut R,
    writer: &mut W,
    transferred: &mut u64,
    direction: TunnelDirection,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; TUNNEL_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            trace!(direction = ?direction, "tunnel end of stream");
            return Ok(());
        }
        writer.write_all(&buffer[..read]).await?;
        writer.flush().await?;
        *transferred = transferred.saturating_add(read as u64);
    }
}

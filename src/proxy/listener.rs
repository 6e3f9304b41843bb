use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::request::{RequestLineError, read_request_head};
use super::{AppContext, router};

/// Accepts connections until `shutdown` flips to true, spawning one task per
/// connection. Connection tasks are not tracked and outlive the loop.
pub fn spawn_accept_loop(
    listener: TcpListener,
    app: AppContext,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "failed to accept incoming connection");
                    continue;
                }
            };
            debug!(peer = %peer_addr, "accepted connection");
            if let Err(err) = stream.set_nodelay(true) {
                debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on downstream stream");
            }
            let connection_app = app.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, peer_addr, connection_app).await {
                    if matches!(
                        err.downcast_ref::<RequestLineError>(),
                        Some(RequestLineError::EmptyRequest)
                    ) {
                        debug!(peer = %peer_addr, "connection closed without a request");
                    } else {
                        warn!(peer = %peer_addr, error = ?err, "connection closed with error");
                    }
                }
            });
        }
        info!("proxy listener stopped");
    })
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let head = read_request_head(&mut reader, peer, app.settings.max_header_size).await?;
    router::route(reader, peer, head, &app).await
}

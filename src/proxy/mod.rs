pub mod cache;
pub mod codec;
pub mod forward;
pub mod headers;
pub mod listener;
pub mod request;
pub mod respond;
pub mod router;
pub mod tunnel;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::{blocklist::Blocklist, settings::Settings};
use cache::{HttpCache, spawn_cache_sweeper};

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    /// `None` disables the firewall check.
    pub blocklist: Option<Arc<Blocklist>>,
    pub cache: HttpCache,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        blocklist: Option<Arc<Blocklist>>,
        cache: HttpCache,
    ) -> Self {
        Self {
            settings,
            blocklist,
            cache,
        }
    }
}

/// A running proxy: the accept loop plus the cache sweeper.
pub struct ProxyServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    listener_task: JoinHandle<()>,
    sweeper_task: JoinHandle<()>,
}

impl ProxyServer {
    pub async fn start(app: AppContext) -> Result<Self> {
        let bind_addr = app.settings.listen;
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
        let local_addr = listener.local_addr().unwrap_or(bind_addr);
        info!(address = %local_addr, "proxy listener started");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper_task = spawn_cache_sweeper(
            app.cache.clone(),
            app.settings.cache_sweeper_interval(),
            shutdown_rx.clone(),
        );
        let listener_task = listener::spawn_accept_loop(listener, app, shutdown_rx);

        Ok(Self {
            local_addr,
            shutdown_tx,
            listener_task,
            sweeper_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns once the accept loop and the sweeper have exited. The
    /// listening socket is closed by then; in-flight connections keep running.
    pub async fn stop(self) -> Result<()> {
        // Both receivers also exit if the sender is gone, so a send error is harmless.
        let _ = self.shutdown_tx.send(true);
        self.listener_task
            .await
            .map_err(|err| anyhow!("listener task failed: {err}"))?;
        self.sweeper_task
            .await
            .map_err(|err| anyhow!("cache sweeper task failed: {err}"))?;
        info!("proxy stopped");
        Ok(())
    }
}

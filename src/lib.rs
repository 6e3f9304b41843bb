pub mod blocklist;
pub mod cli;
pub mod logging;
pub mod proxy;
pub mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    blocklist::Blocklist,
    proxy::{AppContext, ProxyServer, cache::HttpCache},
    settings::Settings,
};

/// Builds the proxy from `settings` and serves until Ctrl-C.
pub async fn run(settings: Settings) -> Result<()> {
    let app = build_app(settings)?;
    if let Some(list) = &app.blocklist {
        blocklist::spawn_reload_task(list.clone());
    }

    let server = ProxyServer::start(app).await?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    server.stop().await
}

pub fn build_app(settings: Settings) -> Result<AppContext> {
    let settings = Arc::new(settings);
    let blocklist = settings
        .blocklist
        .as_ref()
        .map(Blocklist::load)
        .transpose()?
        .map(Arc::new);
    let cache = HttpCache::new(settings.cache_policy());
    Ok(AppContext::new(settings, blocklist, cache))
}

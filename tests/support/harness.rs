use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use tokio::net::TcpStream;

use cachegate::{
    blocklist::Blocklist,
    build_app,
    cli::LogFormat,
    proxy::{ProxyServer, cache::HttpCache},
    settings::Settings,
};

use super::net::wait_for_listener;

pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub cache: HttpCache,
    pub blocklist: Option<Arc<Blocklist>>,
    pub blocklist_path: Option<PathBuf>,
    server: ProxyServer,
    _temp: TempDir,
}

impl ProxyHarness {
    pub fn builder() -> ProxyHarnessBuilder {
        ProxyHarnessBuilder::default()
    }

    pub async fn start() -> Result<Self> {
        Self::builder().start().await
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    pub async fn stop(self) -> Result<()> {
        self.server.stop().await
    }
}

#[derive(Default)]
pub struct ProxyHarnessBuilder {
    blocklist: Option<String>,
    sweeper_interval: Option<u64>,
    honor_no_store: bool,
}

impl ProxyHarnessBuilder {
    /// Newline-separated blocklist patterns.
    pub fn blocklist(mut self, patterns: &str) -> Self {
        self.blocklist = Some(patterns.to_string());
        self
    }

    pub fn sweeper_interval(mut self, seconds: u64) -> Self {
        self.sweeper_interval = Some(seconds);
        self
    }

    pub fn honor_no_store(mut self, honor: bool) -> Self {
        self.honor_no_store = honor;
        self
    }

    pub async fn start(self) -> Result<ProxyHarness> {
        let temp = TempDir::new()?;
        let blocklist_path = match &self.blocklist {
            Some(patterns) => {
                let path = temp.path().join("blocked.txt");
                std::fs::write(&path, patterns)?;
                Some(path)
            }
            None => None,
        };

        let defaults = Settings::default();
        let settings = Settings {
            listen: "127.0.0.1:0".parse()?,
            log: LogFormat::Text,
            blocklist: blocklist_path.clone(),
            cache_sweeper_interval: self
                .sweeper_interval
                .unwrap_or(defaults.cache_sweeper_interval),
            cache_honor_no_store: self.honor_no_store,
            ..defaults
        };
        settings.validate()?;

        let app = build_app(settings)?;
        let cache = app.cache.clone();
        let blocklist = app.blocklist.clone();
        let server = ProxyServer::start(app).await?;
        let addr = server.local_addr();
        wait_for_listener(addr).await?;

        Ok(ProxyHarness {
            addr,
            cache,
            blocklist,
            blocklist_path,
            server,
            _temp: temp,
        })
    }
}

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use regex::Regex;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct BlockPattern {
    source: String,
    regex: Regex,
}

impl BlockPattern {
    fn compile(source: &str) -> Result<Self> {
        let regex =
            Regex::new(source).with_context(|| format!("invalid block pattern '{source}'"))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }
}

/// Regex patterns matched against a request target, persisted one per line.
///
/// A pattern matches anywhere in the target (`.*example\.com` and
/// `example\.com` are equivalent). Unblocking only affects the in-memory
/// list; the backing file keeps the line until it is edited by hand.
#[derive(Debug)]
pub struct Blocklist {
    path: PathBuf,
    patterns: RwLock<Vec<BlockPattern>>,
}

impl Blocklist {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let patterns = read_patterns(&path)?;
        info!(
            path = %path.display(),
            patterns = patterns.len(),
            "blocklist loaded"
        );
        Ok(Self {
            path,
            patterns: RwLock::new(patterns),
        })
    }

    /// Re-reads the backing file, replacing the in-memory list. On error the
    /// current list is kept.
    pub fn reload(&self) -> Result<usize> {
        let patterns = read_patterns(&self.path)?;
        let count = patterns.len();
        *self.patterns.write() = patterns;
        Ok(count)
    }

    pub fn is_allowed(&self, target: &str) -> bool {
        !self
            .patterns
            .read()
            .iter()
            .any(|pattern| pattern.regex.is_match(target))
    }

    pub fn block(&self, pattern: &str) -> Result<()> {
        let compiled = BlockPattern::compile(pattern)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open blocklist {}", self.path.display()))?;
        let separator = if ends_without_newline(&mut file)? {
            "\n"
        } else {
            ""
        };
        writeln!(file, "{separator}{pattern}")
            .with_context(|| format!("failed to append to blocklist {}", self.path.display()))?;
        self.patterns.write().push(compiled);
        Ok(())
    }

    /// Returns true when at least one pattern with exactly this source was removed.
    pub fn unblock(&self, pattern: &str) -> bool {
        let mut guard = self.patterns.write();
        let before = guard.len();
        guard.retain(|existing| existing.source != pattern);
        before != guard.len()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.patterns
            .read()
            .iter()
            .map(|pattern| pattern.source.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// True when a hand-edited file lacks its final newline, so an appended
/// pattern would be glued onto the last line.
fn ends_without_newline(file: &mut fs::File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn read_patterns(path: &Path) -> Result<Vec<BlockPattern>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "blocklist file not found; starting empty");
            return Ok(Vec::new());
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read blocklist {}", path.display()));
        }
    };

    let mut patterns = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let pattern = BlockPattern::compile(line)
            .with_context(|| format!("{}:{}", path.display(), index + 1))?;
        patterns.push(pattern);
    }
    Ok(patterns)
}

#[cfg(unix)]
pub fn spawn_reload_task(blocklist: std::sync::Arc<Blocklist>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGHUP handler");
                return;
            }
        };

        while hup.recv().await.is_some() {
            tracing::info!("received SIGHUP; reloading blocklist");
            match blocklist.reload() {
                Ok(count) => tracing::info!(patterns = count, "blocklist reloaded"),
                Err(err) => tracing::error!(error = ?err, "blocklist reload failed"),
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_reload_task(_blocklist: std::sync::Arc<Blocklist>) {
    tracing::info!("SIGHUP reload is not supported on this platform");
}

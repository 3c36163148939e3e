//! Config file watcher for hot reload.
//!
//! Editors often emit several events per save, so a reload is only forwarded
//! when the validated config differs from the last one sent.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::PipelineConfig;

/// Watches one config file and forwards validated, changed configs.
pub struct ConfigWatcher {
    path: PathBuf,
    last_sent: Arc<Mutex<Option<PipelineConfig>>>,
    update_tx: mpsc::UnboundedSender<PipelineConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiver of reloaded configs.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<PipelineConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            last_sent: Arc::new(Mutex::new(None)),
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        // Seed with the current file so the first no-op save is not forwarded.
        if let Ok(current) = load_config(&self.path) {
            *self.last_sent.lock().unwrap_or_else(|e| e.into_inner()) = Some(current);
        }

        let path = self.path.clone();
        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let last_sent = self.last_sent.clone();
        let tx = self.update_tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = event.kind.is_modify() || event.kind.is_create();
                    let ours = event.paths.is_empty()
                        || event.paths.iter().any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant && ours {
                        reload(&path, &last_sent, &tx);
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        // Watch the directory: editors that replace the file break a file watch.
        let target = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher.watch(target, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %self.path.display(), "Config watcher started");
        Ok(watcher)
    }
}

/// Load, validate and forward `path` if it changed. Returns whether it was sent.
fn reload(
    path: &Path,
    last_sent: &Mutex<Option<PipelineConfig>>,
    tx: &mpsc::UnboundedSender<PipelineConfig>,
) -> bool {
    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Config reload rejected, keeping current configuration");
            return false;
        }
    };

    let mut last = last_sent.lock().unwrap_or_else(|e| e.into_inner());
    if last.as_ref() == Some(&config) {
        tracing::debug!(path = %path.display(), "Config file touched without changes");
        return false;
    }

    tracing::info!(path = %path.display(), "Config reloaded");
    *last = Some(config.clone());
    tx.send(config).is_ok()
}

//! Configuration loading and file watching.

use std::path::{Path, PathBuf};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::types::AppConfig;
use crate::error::{ProxyError, ProxyResult};

/// Load and validate a configuration document from a JSON file.
pub async fn load_config(path: impl AsRef<Path>) -> ProxyResult<AppConfig> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        ProxyError::ConfigInvalid(format!("read {}: {e}", path.display()))
    })?;
    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> ProxyResult<AppConfig> {
    let mut config: AppConfig = serde_json::from_str(content)
        .map_err(|e| ProxyError::ConfigInvalid(format!("parse config: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Watches a configuration file and emits each valid new generation.
///
/// Invalid edits are logged and swallowed so the previous generation stays in
/// effect. The watcher observes the parent directory because atomic-rename
/// saves replace the inode of the file itself.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    generations: mpsc::UnboundedReceiver<AppConfig>,
}

impl ConfigWatcher {
    pub fn start(path: impl Into<PathBuf>) -> ProxyResult<Self> {
        let path: PathBuf = path.into();
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ProxyError::ConfigInvalid("config path has no parent".to_string()))?;

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |res| match res {
            Ok(event) => {
                let _ = raw_tx.send(event);
            }
            Err(e) => warn!("config watch error: {e}"),
        })
        .map_err(|e| ProxyError::ConfigInvalid(format!("start config watcher: {e}")))?;
        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| ProxyError::ConfigInvalid(format!("watch {}: {e}", parent.display())))?;

        let (gen_tx, generations) = mpsc::unbounded_channel();
        let watched = path.clone();
        tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                if !event.paths.iter().any(|p| p == &watched) {
                    continue;
                }
                // Coalesce bursts from editors that write in several steps.
                while raw_rx.try_recv().is_ok() {}

                match load_config(&watched).await {
                    Ok(config) => {
                        info!("configuration reloaded from {}", watched.display());
                        if gen_tx.send(config).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("configuration change rejected, keeping previous generation: {e}");
                    }
                }
            }
            debug!("config watcher stopped for {}", path.display());
        });

        Ok(Self {
            _watcher: watcher,
            generations,
        })
    }

    /// Next valid configuration generation, or `None` once the watcher stops.
    pub async fn next_generation(&mut self) -> Option<AppConfig> {
        self.generations.recv().await
    }
}

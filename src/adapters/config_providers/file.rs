use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{GatewayConfig, loader::load_config},
    ports::config_provider::ConfigProvider,
};

/// Loads the gateway configuration from a local file and watches it for edits.
pub struct FileConfigProvider {
    path: PathBuf,
    // Dropping the watcher stops notifications
    _watcher: RecommendedWatcher,
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid config path: {}", path.display()))?
            .to_owned();

        // Capacity 1: a pending signal already means "reload"
        let (tx, rx) = mpsc::channel(1);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if touches_config(&event, &file_name) {
                    tracing::debug!(kind = ?event.kind, "Config file changed");
                    let _ = tx.try_send(());
                }
            }
            Err(e) => tracing::error!("File watch error: {:?}", e),
        })
        .wrap_err("Failed to create config file watcher")?;

        // Editors often replace the file, so watch the directory rather than the inode
        let watch_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err_with(|| format!("Failed to watch config directory {}", watch_dir.display()))?;

        Ok(Self {
            path,
            _watcher: watcher,
            update_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn touches_config(event: &Event, file_name: &OsString) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", self.path.display()))?;
        load_config(path).await
    }

    fn watch(&self) -> Option<mpsc::Receiver<()>> {
        self.update_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

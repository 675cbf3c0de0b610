//! Config file hot reload
//!
//! Polls the file's modification time and publishes every config that parses
//! and validates. A broken edit is logged and the previous config stays live.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct ConfigWatcher {
    path: PathBuf,
    interval: Duration,
    last_modified: Option<SystemTime>,
    tx: watch::Sender<Arc<RelayConfig>>,
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl ConfigWatcher {
    /// `initial` is the config already loaded from `path`
    pub fn new(path: impl Into<PathBuf>, initial: RelayConfig, interval: Duration) -> Self {
        let path = path.into();
        let (tx, _) = watch::channel(Arc::new(initial));
        Self {
            last_modified: modified(&path),
            path,
            interval,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RelayConfig>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Arc<RelayConfig> {
        self.tx.borrow().clone()
    }

    /// Check the file once; true when a new config was published
    pub fn poll(&mut self) -> bool {
        let stamp = modified(&self.path);
        if stamp.is_none() || stamp == self.last_modified {
            return false;
        }
        self.last_modified = stamp;

        match RelayConfig::load(&self.path) {
            Ok(config) => {
                let changed = self.tx.send_if_modified(|current| {
                    if **current == config {
                        false
                    } else {
                        *current = Arc::new(config);
                        true
                    }
                });
                if changed {
                    info!("🔄 Reloaded configuration from {}", self.path.display());
                } else {
                    debug!("{} touched without changes", self.path.display());
                }
                changed
            }
            Err(e) => {
                warn!(
                    "Ignoring invalid configuration in {}: {}",
                    self.path.display(),
                    e
                );
                false
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "Watching {} for changes every {:?}",
            self.path.display(),
            self.interval
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(path: &Path, content: &str, bump: u64) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        // Coarse filesystem clocks may not move between two quick writes
        file.set_modified(SystemTime::now() + Duration::from_secs(bump))
            .unwrap();
    }

    #[test]
    fn test_poll_publishes_valid_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        write(&path, "queue:\n  capacity: 8\n", 0);

        let initial = RelayConfig::load(&path).unwrap();
        let mut watcher = ConfigWatcher::new(&path, initial, DEFAULT_POLL_INTERVAL);
        let rx = watcher.subscribe();

        assert!(!watcher.poll());

        write(&path, "queue:\n  capacity: 16\n", 10);
        assert!(watcher.poll());
        assert_eq!(rx.borrow().queue.capacity, 16);
    }

    #[test]
    fn test_poll_ignores_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        write(&path, "queue:\n  capacity: 8\n", 0);

        let initial = RelayConfig::load(&path).unwrap();
        let mut watcher = ConfigWatcher::new(&path, initial, DEFAULT_POLL_INTERVAL);

        write(&path, "queue:\n  capacity: 0\n", 10);
        assert!(!watcher.poll());
        assert_eq!(watcher.current().queue.capacity, 8);

        write(&path, "queue: [oops", 20);
        assert!(!watcher.poll());
        assert_eq!(watcher.current().queue.capacity, 8);
    }

    #[test]
    fn test_poll_skips_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        write(&path, "queue:\n  capacity: 8\n", 0);

        let initial = RelayConfig::load(&path).unwrap();
        let mut watcher = ConfigWatcher::new(&path, initial, DEFAULT_POLL_INTERVAL);

        write(&path, "queue:\n  capacity: 8\n", 10);
        assert!(!watcher.poll());
    }
}

//! Task tracking for per-tunnel background tasks
//!
//! Each tunnel owns a lifecycle driver and a deadline sweeper. Their join
//! handles are kept here so closing a tunnel can abort them.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Tracks background tasks associated with tunnels
#[derive(Default)]
pub struct TaskTracker {
    /// Map of tunnel_id -> task handles
    tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task for a tunnel
    pub fn register(&self, tunnel_id: &str, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks
                .entry(tunnel_id.to_string())
                .or_default()
                .retain(|h| !h.is_finished());
            tasks.entry(tunnel_id.to_string()).or_default().push(handle);
        }
    }

    /// Unregister and abort every task of a tunnel
    pub fn unregister(&self, tunnel_id: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(handles) = tasks.remove(tunnel_id) {
                for handle in handles {
                    handle.abort();
                }
            }
        }
    }

    /// Stop tracking a tunnel's tasks without aborting them; used when the
    /// tasks are finishing on their own
    pub fn detach(&self, tunnel_id: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.remove(tunnel_id);
        }
    }

    pub fn tracked(&self, tunnel_id: &str) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.get(tunnel_id).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Abort everything
    pub fn abort_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handles) in tasks.drain() {
                for handle in handles {
                    handle.abort();
                }
            }
        }
    }
}

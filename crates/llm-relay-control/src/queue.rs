//! Bounded per-tunnel request queue
//!
//! Three FIFO lanes serviced in strict priority order. `push` never blocks:
//! at capacity the request is handed back to the caller (reject-new).

use llm_relay_proto::ProxyRequest;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Priority class of a queued request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    fn lane(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub correlation_id: String,
    pub priority: Priority,
    pub request: ProxyRequest,
    pub enqueued_at: Instant,
    pub deadline: Instant,
}

pub struct RequestQueue {
    capacity: usize,
    lanes: Mutex<[VecDeque<QueuedRequest>; 3]>,
    notify: Notify,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lanes: Mutex::new(Default::default()),
            notify: Notify::new(),
        }
    }

    fn lanes(&self) -> MutexGuard<'_, [VecDeque<QueuedRequest>; 3]> {
        self.lanes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn total(lanes: &[VecDeque<QueuedRequest>; 3]) -> usize {
        lanes.iter().map(VecDeque::len).sum()
    }

    /// Enqueue at the back of its lane; returns the new depth, or the request
    /// itself when the queue is full
    pub fn push(&self, item: QueuedRequest) -> Result<usize, QueuedRequest> {
        let depth = {
            let mut lanes = self.lanes();
            if Self::total(&lanes) >= self.capacity {
                return Err(item);
            }
            lanes[item.priority.lane()].push_back(item);
            Self::total(&lanes)
        };
        self.notify.notify_one();
        Ok(depth)
    }

    /// Put a request that could not be transmitted back at the head of its lane
    pub fn restore_front(&self, item: QueuedRequest) -> Result<usize, QueuedRequest> {
        let mut lanes = self.lanes();
        if Self::total(&lanes) >= self.capacity {
            return Err(item);
        }
        lanes[item.priority.lane()].push_front(item);
        Ok(Self::total(&lanes))
    }

    /// Next request: highest non-empty lane, oldest first
    pub fn pop(&self) -> Option<QueuedRequest> {
        let mut lanes = self.lanes();
        lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn remove(&self, correlation_id: &str) -> Option<QueuedRequest> {
        let mut lanes = self.lanes();
        for lane in lanes.iter_mut() {
            if let Some(pos) = lane.iter().position(|r| r.correlation_id == correlation_id) {
                return lane.remove(pos);
            }
        }
        None
    }

    /// Take every request whose deadline has passed
    pub fn remove_expired(&self, now: Instant) -> Vec<QueuedRequest> {
        let mut expired = Vec::new();
        let mut lanes = self.lanes();
        for lane in lanes.iter_mut() {
            let (keep, gone): (VecDeque<_>, VecDeque<_>) =
                lane.drain(..).partition(|r| r.deadline > now);
            *lane = keep;
            expired.extend(gone);
        }
        expired
    }

    /// Empty the queue, returning everything in service order
    pub fn drain(&self) -> Vec<QueuedRequest> {
        let mut lanes = self.lanes();
        lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
    }

    pub fn len(&self) -> usize {
        Self::total(&self.lanes())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resolves after the next `push`
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

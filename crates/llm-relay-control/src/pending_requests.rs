//! Pending requests tracker
//!
//! Matches asynchronous responses arriving over a tunnel to the callers
//! waiting for them. Every entry is removed exactly once: by its response,
//! by an error, by deadline expiry or by the tunnel going away.

use dashmap::DashMap;
use llm_relay_proto::ProxyResponse;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ProxyError;

pub type ProxyResult = Result<ProxyResponse, ProxyError>;

struct PendingEntry {
    tunnel_id: String,
    enqueued_at: Instant,
    deadline: Instant,
    waiter: oneshot::Sender<ProxyResult>,
}

/// Tracks requests awaiting responses
#[derive(Clone, Default)]
pub struct PendingRequests {
    /// Maps correlation id -> waiter
    entries: Arc<DashMap<String, PendingEntry>>,
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("count", &self.entries.len())
            .finish()
    }
}

/// Caller side of a pending request
#[derive(Debug)]
pub struct ResponseHandle {
    correlation_id: String,
    enqueued_at: Instant,
    deadline: Instant,
    rx: oneshot::Receiver<ProxyResult>,
    pending: PendingRequests,
}

impl ResponseHandle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Wait for the response, bounded by the request deadline
    pub async fn wait(mut self) -> ProxyResult {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProxyError::TunnelClosed(
                "tunnel dropped the request".to_string(),
            )),
            Err(_) => {
                self.pending.cancel(&self.correlation_id);
                // A resolution racing the deadline wins
                self.rx.try_recv().unwrap_or(Err(ProxyError::RequestTimeout))
            }
        }
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request
    /// Returns a handle that will receive the response
    pub fn register(
        &self,
        correlation_id: impl Into<String>,
        tunnel_id: impl Into<String>,
        deadline: Instant,
    ) -> ResponseHandle {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();
        let enqueued_at = Instant::now();
        self.entries.insert(
            correlation_id.clone(),
            PendingEntry {
                tunnel_id: tunnel_id.into(),
                enqueued_at,
                deadline,
                waiter: tx,
            },
        );
        debug!("Registered pending request {}", correlation_id);
        ResponseHandle {
            correlation_id,
            enqueued_at,
            deadline,
            rx,
            pending: self.clone(),
        }
    }

    fn complete(&self, correlation_id: &str, result: ProxyResult) -> bool {
        let Some((_, entry)) = self.entries.remove(correlation_id) else {
            return false;
        };
        if entry.waiter.send(result).is_err() {
            debug!(
                "Waiter for {} on tunnel {} already gone",
                correlation_id, entry.tunnel_id
            );
        }
        true
    }

    /// Deliver a response; returns false for unknown or already-resolved ids
    pub fn resolve(&self, correlation_id: &str, response: ProxyResponse) -> bool {
        if self.complete(correlation_id, Ok(response)) {
            debug!("Routing response for {}", correlation_id);
            true
        } else {
            warn!("No pending request found for {}", correlation_id);
            false
        }
    }

    /// Complete a request with an error
    pub fn fail(&self, correlation_id: &str, error: ProxyError) -> bool {
        let code = error.code();
        if self.complete(correlation_id, Err(error)) {
            debug!("Failed pending request {} with {}", correlation_id, code);
            true
        } else {
            warn!(
                "No pending request found for {} (dropping {})",
                correlation_id, code
            );
            false
        }
    }

    /// Remove without notifying (the caller has stopped waiting)
    pub fn cancel(&self, correlation_id: &str) -> bool {
        if self.entries.remove(correlation_id).is_some() {
            debug!("Cancelled pending request {}", correlation_id);
            true
        } else {
            false
        }
    }

    /// Fail every pending request with a clone of `error`
    pub fn cancel_all(&self, error: ProxyError) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.complete(id, Err(error.clone())))
            .count()
    }

    /// Fail every request whose deadline is at or before `now` with
    /// `RequestTimeout`; returns their ids
    pub fn sweep_expired(&self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| e.key().clone())
            .collect();

        expired
            .into_iter()
            .filter(|id| self.complete(id, Err(ProxyError::RequestTimeout)))
            .inspect(|id| debug!("Pending request {} expired", id))
            .collect()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    /// Time spent waiting so far
    pub fn age(&self, correlation_id: &str) -> Option<std::time::Duration> {
        self.entries
            .get(correlation_id)
            .map(|e| e.value().enqueued_at.elapsed())
    }

    /// Get count of pending requests
    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

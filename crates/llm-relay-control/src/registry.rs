//! Tunnel registry
//!
//! The single owner of every tunnel connection, keyed by user. All lifecycle
//! changes go through here (or through the driver tasks it spawns), which is
//! what keeps at most one live tunnel per user.

use llm_relay_auth::{AuthValidator, Identity, SCOPE_TUNNEL};
use llm_relay_guard::{AuditSink, TracingAuditSink};
use llm_relay_metrics::MetricsCollector;
use llm_relay_proto::{Envelope, ErrorCode, HandshakeAccepted};
use llm_relay_transport::TunnelTransport;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use crate::connection::TunnelConnection;
use crate::driver;
use crate::error::ProxyError;
use crate::events::{TunnelEvent, TunnelInfo, TunnelStatus};
use crate::settings::TunnelSettings;
use crate::state::TunnelState;
use crate::task_tracker::TaskTracker;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Tables {
    by_user: HashMap<String, Arc<TunnelConnection>>,
    /// tunnel id -> user id
    owners: HashMap<String, String>,
}

impl Tables {
    fn by_tunnel(&self, tunnel_id: &str) -> Option<Arc<TunnelConnection>> {
        self.owners
            .get(tunnel_id)
            .and_then(|user| self.by_user.get(user))
            .cloned()
    }

    fn remove(&mut self, conn: &TunnelConnection) -> bool {
        let owned = self
            .by_user
            .get(conn.user_id())
            .map(|current| current.id() == conn.id())
            .unwrap_or(false);
        if owned {
            self.by_user.remove(conn.user_id());
        }
        self.owners.remove(conn.id());
        owned
    }
}

pub(crate) struct RegistryInner {
    auth: Arc<dyn AuthValidator>,
    tables: RwLock<Tables>,
    settings: StdRwLock<TunnelSettings>,
    events: broadcast::Sender<TunnelEvent>,
    metrics: Arc<MetricsCollector>,
    audit: Arc<dyn AuditSink>,
    tasks: TaskTracker,
}

/// Registry of live tunnels; cheap to clone
#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<RegistryInner>,
}

impl TunnelRegistry {
    pub fn new(
        auth: Arc<dyn AuthValidator>,
        settings: TunnelSettings,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self::with_audit(auth, settings, metrics, Arc::new(TracingAuditSink))
    }

    pub fn with_audit(
        auth: Arc<dyn AuthValidator>,
        settings: TunnelSettings,
        metrics: Arc<MetricsCollector>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                auth,
                tables: RwLock::new(Tables::default()),
                settings: StdRwLock::new(settings),
                events,
                metrics,
                audit,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }

    /// Validate a bearer token as the identity collaborator sees it
    pub async fn authenticate(&self, credentials: &str) -> Result<Identity, ProxyError> {
        self.inner.authenticate(credentials).await
    }

    /// Open a tunnel for the token's subject over `transport`
    ///
    /// An existing live tunnel for the same user is closed first. On
    /// credential failure nothing changes. The returned connection starts in
    /// `connecting`; its driver moves it to `connected`.
    pub async fn establish(
        &self,
        credentials: &str,
        transport: Arc<dyn TunnelTransport>,
    ) -> Result<Arc<TunnelConnection>, ProxyError> {
        let identity = self.inner.authenticate(credentials).await?;
        if !identity.has_scope(SCOPE_TUNNEL) {
            self.inner.metrics.record_error(ErrorCode::AuthenticationFailed);
            return Err(ProxyError::AuthenticationFailed(format!(
                "missing scope '{}'",
                SCOPE_TUNNEL
            )));
        }

        let user_id = identity.user_id.clone();
        let (conn, resume_rx) = TunnelConnection::new(
            identity,
            self.settings(),
            self.inner.metrics.clone(),
            self.inner.audit.clone(),
        );
        let conn = Arc::new(conn);
        if let Err(e) = send_handshake(&conn, transport.as_ref()).await {
            self.inner.metrics.forget_tunnel(conn.id());
            return Err(e);
        }

        let mut tables = self.inner.tables.write().await;
        if let Some(old) = tables.by_user.remove(&user_id) {
            tables.owners.remove(old.id());
            info!(
                "Replacing tunnel {} for user {} with {}",
                old.id(),
                user_id,
                conn.id()
            );
            self.inner.retire(&old, "replaced by a new connection").await;
        }

        tables.by_user.insert(user_id.clone(), conn.clone());
        tables.owners.insert(conn.id().to_string(), user_id.clone());
        self.inner.metrics.tunnel_opened();
        driver::spawn(&self.inner, conn.clone(), transport, resume_rx);
        drop(tables);

        info!("✅ Tunnel {} established for user {}", conn.id(), user_id);
        Ok(conn)
    }

    /// Hand a re-dialed transport to an existing tunnel
    pub async fn resume(
        &self,
        tunnel_id: &str,
        credentials: &str,
        transport: Arc<dyn TunnelTransport>,
    ) -> Result<Arc<TunnelConnection>, ProxyError> {
        let identity = self.inner.authenticate(credentials).await?;

        let conn = self
            .inner
            .tables
            .read()
            .await
            .by_tunnel(tunnel_id)
            .ok_or_else(|| ProxyError::TunnelUnavailable(format!("unknown tunnel {}", tunnel_id)))?;

        if conn.user_id() != identity.user_id {
            self.inner.metrics.record_error(ErrorCode::AuthenticationFailed);
            warn!(
                "User {} tried to resume tunnel {} owned by {}",
                identity.user_id,
                tunnel_id,
                conn.user_id()
            );
            return Err(ProxyError::AuthenticationFailed(
                "tunnel belongs to another user".to_string(),
            ));
        }

        match conn.state() {
            TunnelState::Reconnecting | TunnelState::Connected => {}
            state => {
                return Err(ProxyError::TunnelUnavailable(format!(
                    "tunnel {} is {}",
                    tunnel_id, state
                )))
            }
        }

        send_handshake(&conn, transport.as_ref()).await?;
        if !conn.offer_transport(transport) {
            return Err(ProxyError::TunnelUnavailable(
                "resume already in progress".to_string(),
            ));
        }

        info!("🔄 Tunnel {} resumed by user {}", tunnel_id, identity.user_id);
        Ok(conn)
    }

    /// Live tunnel of a user
    pub async fn lookup(&self, user_id: &str) -> Result<Arc<TunnelConnection>, ProxyError> {
        self.inner
            .tables
            .read()
            .await
            .by_user
            .get(user_id)
            .cloned()
            .ok_or_else(|| ProxyError::TunnelUnavailable(format!("no tunnel for user {}", user_id)))
    }

    pub async fn get(&self, tunnel_id: &str) -> Option<Arc<TunnelConnection>> {
        self.inner.tables.read().await.by_tunnel(tunnel_id)
    }

    /// Close a tunnel: pending requests fail with `TunnelClosed`, the queue is
    /// released and the driver stops
    pub async fn close(&self, tunnel_id: &str, reason: &str) -> Result<(), ProxyError> {
        let mut tables = self.inner.tables.write().await;
        let conn = tables
            .by_tunnel(tunnel_id)
            .ok_or_else(|| ProxyError::TunnelUnavailable(format!("unknown tunnel {}", tunnel_id)))?;
        tables.remove(&conn);
        self.inner.retire(&conn, reason).await;
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<TunnelInfo> {
        let mut tunnels: Vec<TunnelInfo> = self
            .inner
            .tables
            .read()
            .await
            .by_user
            .values()
            .map(|conn| conn.info())
            .collect();
        tunnels.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tunnels
    }

    pub async fn len(&self) -> usize {
        self.inner.tables.read().await.by_user.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Status changes of every tunnel
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    pub fn settings(&self) -> TunnelSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// New settings apply to tunnels established from now on
    pub fn apply_settings(&self, settings: TunnelSettings) {
        info!(
            "Tunnel settings updated (heartbeat {:?}, queue capacity {})",
            settings.heartbeat.interval, settings.queue.capacity
        );
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
    }

    /// Close every tunnel
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<TunnelConnection>> = {
            let mut tables = self.inner.tables.write().await;
            tables.owners.clear();
            tables.by_user.drain().map(|(_, conn)| conn).collect()
        };
        info!("Shutting down {} tunnels", drained.len());
        for conn in drained {
            self.inner.retire(&conn, "relay shutting down").await;
        }
        self.inner.tasks.abort_all();
    }
}

/// First frame on every accepted link, sent before the driver owns it
async fn send_handshake(
    conn: &TunnelConnection,
    transport: &dyn TunnelTransport,
) -> Result<(), ProxyError> {
    let accepted = HandshakeAccepted {
        tunnel_id: conn.id().to_string(),
        user_id: conn.user_id().to_string(),
    };
    let envelope =
        Envelope::handshake(&accepted).map_err(|e| ProxyError::ProtocolError(e.to_string()))?;
    transport
        .send(envelope)
        .await
        .map_err(|e| ProxyError::TunnelUnavailable(format!("handshake not delivered: {}", e)))
}

impl RegistryInner {
    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    async fn authenticate(&self, credentials: &str) -> Result<Identity, ProxyError> {
        self.auth.validate(credentials).await.map_err(|e| {
            self.metrics.record_error(ErrorCode::AuthenticationFailed);
            warn!("Authentication failed: {}", e);
            ProxyError::from(e)
        })
    }

    fn publish(&self, conn: &TunnelConnection, status: TunnelStatus) {
        // No subscribers is fine
        let _ = self
            .events
            .send(TunnelEvent::new(conn.id(), conn.user_id(), status));
    }

    /// Move to `connected`; false if the tunnel is already on its way out
    pub(crate) fn mark_connected(&self, conn: &TunnelConnection) -> bool {
        if conn.state() == TunnelState::Connected {
            return true;
        }
        match conn.set_state(TunnelState::Connected) {
            Ok(previous) => {
                conn.set_reconnect_attempts(0);
                if previous == TunnelState::Reconnecting {
                    info!("🔗 Tunnel {} reconnected", conn.id());
                } else {
                    info!("🔗 Tunnel {} connected", conn.id());
                }
                self.publish(conn, TunnelStatus::Connected);
                true
            }
            Err(e) => {
                info!("Tunnel {} not connecting: {}", conn.id(), e);
                false
            }
        }
    }

    pub(crate) fn mark_reconnecting(&self, conn: &TunnelConnection) -> bool {
        match conn.set_state(TunnelState::Reconnecting) {
            Ok(_) => {
                self.publish(conn, TunnelStatus::Reconnecting);
                true
            }
            Err(_) => false,
        }
    }

    /// Reconnection exhausted: terminal `failed`, waiters get
    /// `TunnelUnavailable`, the tunnel leaves the registry
    pub(crate) async fn mark_failed(&self, conn: &TunnelConnection) {
        if conn.set_state(TunnelState::Failed).is_err() {
            return;
        }
        conn.cancel_token().cancel();
        conn.release(ProxyError::TunnelUnavailable(format!(
            "tunnel {} failed to reconnect",
            conn.id()
        )));

        self.tables.write().await.remove(conn);
        self.metrics.tunnel_dropped(conn.id());
        // The calling driver is finishing by itself
        self.tasks.detach(conn.id());
        self.publish(conn, TunnelStatus::Failed);
        error!(
            "❌ Tunnel {} for user {} failed after {} reconnect attempts",
            conn.id(),
            conn.user_id(),
            conn.reconnect_attempts()
        );
    }

    /// `closing → closed`; caller has already removed `conn` from the tables
    async fn retire(&self, conn: &Arc<TunnelConnection>, reason: &str) {
        if conn.set_state(TunnelState::Closing).is_err() {
            return;
        }
        conn.cancel_token().cancel();
        conn.release(ProxyError::TunnelClosed(reason.to_string()));
        if let Some(link) = conn.take_link() {
            link.close(reason).await;
        }
        let _ = conn.set_state(TunnelState::Closed);

        self.metrics.tunnel_dropped(conn.id());
        self.tasks.unregister(conn.id());
        self.publish(conn, TunnelStatus::Disconnected);
        info!(
            "🔌 Tunnel {} for user {} closed: {}",
            conn.id(),
            conn.user_id(),
            reason
        );
    }
}

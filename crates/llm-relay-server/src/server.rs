//! Relay server: listener, background upkeep and graceful shutdown

use anyhow::Context;
use llm_relay_auth::{AuthValidator, JwtValidator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{AuthSection, ConfigError, RelayConfig};
use crate::relay::Relay;
use crate::routes::router;
use crate::watcher::ConfigWatcher;

/// How often idle rate-limit state is dropped
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Identities untouched for this long lose their limiter state
pub const PRUNE_IDLE_AFTER: Duration = Duration::from_secs(600);

/// HS256 validator for the `auth` section
pub fn jwt_validator(auth: &AuthSection) -> Result<JwtValidator, ConfigError> {
    let secret = auth
        .jwt_secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::Invalid("auth.jwt_secret is required".to_string()))?;

    let mut validator = JwtValidator::new(secret.as_bytes());
    if let Some(issuer) = &auth.issuer {
        validator = validator.with_issuer(issuer.clone());
    }
    if let Some(audience) = &auth.audience {
        validator = validator.with_audience(audience.clone());
    }
    Ok(validator)
}

pub struct RelayServer {
    bind: SocketAddr,
    relay: Arc<Relay>,
    watcher: Option<ConfigWatcher>,
}

impl RelayServer {
    pub fn new(config: &RelayConfig, auth: Arc<dyn AuthValidator>) -> anyhow::Result<Self> {
        let relay = Relay::new(auth, config).context("failed to register relay metrics")?;
        Ok(Self {
            bind: config.server.bind,
            relay: Arc::new(relay),
            watcher: None,
        })
    }

    /// Apply every config the watcher publishes
    pub fn with_watcher(mut self, watcher: ConfigWatcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    /// Bind the configured address and serve until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind)
            .await
            .with_context(|| format!("failed to bind {}", self.bind))?;
        self.serve(listener, cancel).await
    }

    pub async fn serve(
        self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr().context("listener has no local address")?;
        let relay = self.relay;
        let mut upkeep = JoinSet::new();

        if let Some(watcher) = self.watcher {
            let mut updates = watcher.subscribe();
            upkeep.spawn(watcher.run(cancel.clone()));

            let relay = relay.clone();
            let cancel = cancel.clone();
            upkeep.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = updates.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let config = updates.borrow_and_update().clone();
                            relay.apply_config(&config);
                        }
                    }
                }
            });
        }

        {
            let relay = relay.clone();
            let cancel = cancel.clone();
            upkeep.spawn(async move {
                let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let pruned = relay.limiter().prune_idle(PRUNE_IDLE_AFTER);
                            if pruned > 0 {
                                debug!("Pruned rate-limit state for {} idle callers", pruned);
                            }
                        }
                    }
                }
            });
        }

        info!("🚀 Relay listening on http://{}", addr);
        info!("   Tunnel:  ws://{}/v1/tunnel", addr);
        info!("   Proxy:   http://{}/v1/users/{{user_id}}/proxy/...", addr);

        let shutdown_relay = relay.clone();
        let shutdown = cancel.clone();
        axum::serve(
            listener,
            router(relay).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Shutting down relay, closing tunnels");
            shutdown_relay.shutdown().await;
        })
        .await
        .context("relay server failed")?;

        cancel.cancel();
        while upkeep.join_next().await.is_some() {}
        info!("Relay stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwt_validator_requires_secret() {
        let result = jwt_validator(&AuthSection::default());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let auth = AuthSection {
            jwt_secret: Some("s3cret".to_string()),
            issuer: Some("llm-relay".to_string()),
            audience: None,
        };
        assert!(jwt_validator(&auth).is_ok());
    }
}

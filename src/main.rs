//! llm-relay CLI
//!
//! Runs the relay, runs the local agent next to a model server, or mints
//! development tokens.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use llm_relay_agent::{Agent, AgentConfig};
use llm_relay_auth::{JwtClaims, JwtValidator};
use llm_relay_server::{
    jwt_validator, ConfigWatcher, RelayConfig, RelayServer, DEFAULT_POLL_INTERVAL,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("LLM_RELAY_GIT_HASH"),
    " ",
    env!("LLM_RELAY_BUILD_DATE"),
    ")"
);

/// Reach a locally hosted model server through a public relay
#[derive(Parser, Debug)]
#[command(name = "llm-relay")]
#[command(version = VERSION)]
struct Cli {
    /// Log filter, e.g. `info` or `llm_relay_control=debug` (RUST_LOG wins when set)
    #[arg(long, global = true, default_value = "info", env = "LLM_RELAY_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay
    #[command(long_about = r#"
Run the relay. Agents dial /v1/tunnel; callers use
/v1/users/{user_id}/proxy/{path}.

The config file is watched and reloaded while the relay runs. Changes to the
queue, breaker and heartbeat settings apply to tunnels opened afterwards.

EXAMPLES:
  # Print a config template
  llm-relay serve --print-config > relay.yaml

  # Run with a config file, overriding the secret from the environment
  LLM_RELAY_JWT_SECRET=... llm-relay serve --config relay.yaml
    "#)]
    Serve {
        /// YAML config file (defaults apply when omitted)
        #[arg(long, short, env = "LLM_RELAY_CONFIG")]
        config: Option<PathBuf>,

        /// Listen address, overrides server.bind
        #[arg(long, env = "LLM_RELAY_BIND")]
        bind: Option<SocketAddr>,

        /// HS256 secret, overrides auth.jwt_secret
        #[arg(long, env = "LLM_RELAY_JWT_SECRET", hide_env_values = true)]
        jwt_secret: Option<String>,

        /// Print the default config and exit
        #[arg(long)]
        print_config: bool,
    },

    /// Run the agent next to a local model server
    Connect {
        /// Relay tunnel URL (e.g., wss://relay.example.com/v1/tunnel)
        #[arg(long, env = "LLM_RELAY_URL")]
        relay: String,

        /// Bearer token with the `tunnel` scope
        #[arg(long, env = "LLM_RELAY_TOKEN", hide_env_values = true)]
        token: String,

        /// Local model server base URL
        #[arg(long, default_value = "http://127.0.0.1:11434")]
        upstream: String,

        /// Upper bound for one upstream request, in seconds
        #[arg(long, default_value = "300")]
        request_timeout: u64,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "30")]
        max_reconnect_delay: u64,
    },

    /// Print an HS256 token the relay accepts
    GenerateToken {
        #[arg(long, env = "LLM_RELAY_JWT_SECRET", hide_env_values = true)]
        secret: String,

        /// Token subject (the tunnel owner)
        #[arg(long)]
        user: String,

        #[arg(long, default_value = "free")]
        tier: String,

        /// Granted scope, repeatable (none = all scopes)
        #[arg(long = "scope")]
        scopes: Vec<String>,

        #[arg(long, default_value = "llm-relay")]
        issuer: String,

        #[arg(long, default_value = "llm-relay")]
        audience: String,

        /// Validity in hours
        #[arg(long, default_value = "720")]
        valid_hours: i64,
    },
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancelled on the first Ctrl+C
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
        }
        trigger.cancel();
    });
    cancel
}

async fn serve(
    config_path: Option<PathBuf>,
    bind: Option<SocketAddr>,
    jwt_secret: Option<String>,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => RelayConfig::default(),
    };
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(secret) = jwt_secret {
        config.auth.jwt_secret = Some(secret);
    }
    if config.server.allow_anonymous {
        warn!("⚠️  Anonymous callers allowed, identified by client IP");
    }

    let auth = Arc::new(jwt_validator(&config.auth).context("invalid auth configuration")?);
    let mut server = RelayServer::new(&config, auth)?;
    if let Some(path) = config_path {
        server = server.with_watcher(ConfigWatcher::new(
            path,
            config.clone(),
            DEFAULT_POLL_INTERVAL,
        ));
    }

    server.run(shutdown_token()).await
}

async fn connect(config: AgentConfig) -> Result<()> {
    info!("Relay: {}", config.relay_url);
    info!("Upstream: {}", config.upstream);

    let agent = Agent::new(config).context("failed to create agent")?;
    match agent.run(shutdown_token()).await {
        Ok(()) => {
            info!("Agent stopped");
            Ok(())
        }
        Err(e) => {
            error!("Agent gave up: {}", e);
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Serve {
            config,
            bind,
            jwt_secret,
            print_config,
        } => {
            if print_config {
                print!("{}", RelayConfig::template()?);
                return Ok(());
            }
            serve(config, bind, jwt_secret).await
        }
        Commands::Connect {
            relay,
            token,
            upstream,
            request_timeout,
            max_reconnect_attempts,
            max_reconnect_delay,
        } => {
            let mut config = AgentConfig {
                relay_url: relay,
                token,
                upstream,
                request_timeout: Duration::from_secs(request_timeout),
                ..AgentConfig::default()
            };
            config.reconnect.max_backoff = Duration::from_secs(max_reconnect_delay);
            config.reconnect.max_attempts =
                (max_reconnect_attempts > 0).then_some(max_reconnect_attempts);
            connect(config).await
        }
        Commands::GenerateToken {
            secret,
            user,
            tier,
            scopes,
            issuer,
            audience,
            valid_hours,
        } => {
            let validity = chrono::Duration::hours(valid_hours);
            let claims = JwtClaims::new(user, issuer, audience, validity)
                .with_tier(tier)
                .with_scopes(scopes);
            let token = JwtValidator::encode(secret.as_bytes(), &claims)
                .context("failed to sign token")?;
            println!("{}", token);
            Ok(())
        }
    }
}

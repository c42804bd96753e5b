//! `broker-gatewayd` — standalone interaction broker WebSocket daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use broker_core::audit::TracingAuditSink;
use broker_core::auth::SessionOwnershipVerifier;
use broker_core::types::{SessionId, UserId};
use broker_gateway::{GatewayConfig, GatewayServer};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the daemon.
#[derive(Debug, Parser)]
#[command(name = "broker-gatewayd", about = "Interaction broker WebSocket gateway")]
struct Cli {
    /// Path to a TOML configuration file. Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

/// Placeholder session-ownership verifier that trusts every caller.
///
/// Real session ownership verification belongs to the embedding
/// application's auth layer (out of scope here, spec §1) — this exists
/// purely so the standalone daemon is runnable on its own; anyone
/// embedding `broker-gateway` as a library should supply their own
/// [`SessionOwnershipVerifier`] via [`GatewayServer::start`] instead of
/// using this binary.
struct TrustAllVerifier;

#[async_trait]
impl SessionOwnershipVerifier for TrustAllVerifier {
    async fn verify(&self, _user_id: &UserId, _session_id: SessionId) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> Result<(), broker_gateway::GatewayError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,broker_gateway=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = GatewayConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    tracing::warn!(
        "running with a permissive session-ownership verifier that trusts every caller; \
         embed broker-gateway as a library with a real SessionOwnershipVerifier for production use"
    );

    let server = GatewayServer::start(config, Arc::new(TrustAllVerifier), Arc::new(TracingAuditSink)).await?;
    tracing::info!(addr = %server.local_addr, "broker-gatewayd ready");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
    server.broker.store().shutdown();
    server.shutdown().await;
    Ok(())
}

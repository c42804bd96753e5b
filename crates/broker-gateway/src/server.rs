//! Daemon bootstrap: binds the listener, wires the store/broker/registry/
//! router together, and spawns the background tasks.
//!
//! Grounded on `astrid_gateway::server::startup::DaemonServer::start`'s
//! shape (bind, build components, spawn background tasks, return a handle
//! carrying the shutdown broadcast) without that daemon's capsule/runtime
//! machinery, which this system has no counterpart for.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use broker_core::audit::AuditSink;
use broker_core::auth::ArcVerifier;
use broker_core::broker::Broker;
use broker_core::store::InteractionStore;

use crate::config::GatewayConfig;
use crate::connection;
use crate::error::Result;
use crate::heartbeat::run_heartbeat;
use crate::registry::SubscriberRegistry;
use crate::router::FanoutRouter;
use crate::sweeper::run_sweeper;

/// A running gateway instance: the bound listener plus every background
/// task, all torn down together when [`GatewayServer::shutdown`] is called.
pub struct GatewayServer {
    /// Address the listener actually bound to.
    pub local_addr: std::net::SocketAddr,
    /// Shared broker handle, for callers embedding the gateway as a library
    /// (e.g. tests that submit interactions directly).
    pub broker: Broker,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayServer {
    /// Bind the listener and start every background task. Returns once the
    /// listener is bound; connections are accepted on a spawned task.
    pub async fn start(
        config: GatewayConfig,
        verifier: ArcVerifier,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "gateway listening");

        let config = Arc::new(config);
        let (store, store_events) = InteractionStore::new(config.core.clone());
        let broker = Broker::new(store.clone());
        let registry = Arc::new(SubscriberRegistry::new(config.clone(), verifier, audit.clone()));
        let router = Arc::new(FanoutRouter::new(store.clone(), registry.clone(), audit, config.clone()));

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(router.clone().run_outbound(store_events)));

        tasks.push(tokio::spawn(run_sweeper(
            store.clone(),
            config.core.sweep_interval,
            shutdown_tx.subscribe(),
        )));

        let (zombie_tx, mut zombie_rx) = tokio::sync::mpsc::unbounded_channel();
        tasks.push(tokio::spawn(run_heartbeat(
            registry.clone(),
            config.heartbeat_interval,
            zombie_tx,
            shutdown_tx.subscribe(),
        )));

        {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(client_id) = zombie_rx.recv().await {
                    warn!(?client_id, "removing zombie subscriber");
                    registry.remove(client_id);
                }
            }));
        }

        {
            let router = router.clone();
            let registry = registry.clone();
            let mut accept_shutdown = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = accept_shutdown.recv() => {
                            info!("accept loop shutting down");
                            return;
                        }
                        accepted = listener.accept() => {
                            let Ok((stream, peer_addr)) = accepted else { continue };
                            let router = router.clone();
                            let registry = registry.clone();
                            let conn_shutdown = accept_shutdown.resubscribe();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    connection::handle_connection(stream, router, registry, conn_shutdown).await
                                {
                                    warn!(%peer_addr, error = %e, "connection task exited with error");
                                }
                            });
                        }
                    }
                }
            }));
        }

        Ok(Self {
            local_addr,
            broker,
            shutdown_tx,
            tasks,
        })
    }

    /// Broadcast shutdown to every background task and wait for them to
    /// exit. Per spec §5, pending interactions are rejected with `SHUTDOWN`
    /// by the caller before or after this, depending on desired ordering.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Subscribe to the shutdown broadcast (e.g. for an embedding
    /// application's own signal handler to fan in to).
    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_core::audit::NoopAuditSink;
    use broker_core::auth::SessionOwnershipVerifier;
    use broker_core::types::{SessionId, UserId};

    struct AllowAll;

    #[async_trait]
    impl SessionOwnershipVerifier for AllowAll {
        async fn verify(&self, _user_id: &UserId, _session_id: SessionId) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn starts_and_binds_an_ephemeral_port() {
        let mut config = GatewayConfig::default();
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        let server = GatewayServer::start(config, Arc::new(AllowAll), Arc::new(NoopAuditSink))
            .await
            .unwrap();
        assert_ne!(server.local_addr.port(), 0);
        server.shutdown().await;
    }
}

//! Gateway orchestrator: owns the listener, the shared collaborators and the
//! relay consumer, and coordinates shutdown.
//!
//! Shutdown order: stop accepting, let connection workers tear down, let the
//! relay consumer finish its record, then close listener, store and bus.

use crate::bus::Bus;
use crate::config::ServerConfig;
use crate::connection::serve_connection;
use crate::relay::RelayConsumer;
use crate::session::SessionTable;
use crate::store::Store;
use courier_core::CourierResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Pause after a failed accept (e.g. descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every connection worker and the relay consumer.
pub struct Shared {
    pub config: ServerConfig,
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn Bus>,
    pub sessions: Arc<SessionTable>,
}

/// The courier gateway instance.
pub struct GatewayServer {
    shared: Arc<Shared>,
}

impl GatewayServer {
    pub fn new(config: ServerConfig, store: Arc<dyn Store>, bus: Arc<dyn Bus>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                bus,
                sessions: Arc::new(SessionTable::new()),
            }),
        }
    }

    #[cfg(test)]
    pub fn sessions(&self) -> Arc<SessionTable> {
        self.shared.sessions.clone()
    }

    /// Serve `listener` until `shutdown` flips to true.
    ///
    /// Fails only if the store cannot be reached at startup.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> CourierResult<()> {
        let shared = self.shared;

        // Online flags left behind by an unclean stop would block every login.
        let cleared = shared.store.reset_presence().await?;
        if cleared > 0 {
            info!(cleared, "cleared stale online flags");
        }

        let consumer = RelayConsumer::new(
            shared.store.clone(),
            shared.bus.clone(),
            shared.sessions.clone(),
            shared.config.poll_timeout,
        );
        let consumer_task = tokio::spawn(consumer.run(shutdown.clone()));

        match listener.local_addr() {
            Ok(addr) => info!(addr = %addr, topic = %shared.config.topic, "gateway listening"),
            Err(e) => warn!(error = %e, "listener has no local address"),
        }

        let mut workers = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "connection accepted");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(remote = %remote, error = %e, "set_nodelay failed");
                        }
                        workers.spawn(serve_connection(
                            shared.clone(),
                            stream,
                            remote,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection worker failed");
                    }
                }
            }
        }

        let live_sessions = shared.sessions.count().await;
        info!(
            connections = workers.len(),
            sessions = live_sessions,
            "shutting down, draining connections"
        );
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "connection worker failed");
            }
        }
        if let Err(e) = consumer_task.await {
            warn!(error = %e, "relay consumer failed");
        }

        drop(listener);
        if let Err(e) = shared.store.close().await {
            warn!(error = %e, "store close failed");
        }
        if let Err(e) = shared.bus.close().await {
            warn!(error = %e, "bus close failed");
        }
        info!("gateway stopped");
        Ok(())
    }
}

/// Resolve once shutdown has been signalled, or the signal source is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let requested = *rx.borrow_and_update();
        if requested {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

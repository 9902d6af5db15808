//! Shared server state, background tasks, and the listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::connection::ConnectionRegistry;
use crate::handler::MessageHandler;
use crate::registry::Registry;
use crate::store::{PRESENCE_CHANNEL, Store};
use crate::web;

/// Everything a connection task needs, behind one `Arc`.
pub struct SharedState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub connections: Arc<ConnectionRegistry>,
    pub registry: Arc<Registry>,
    pub handler: MessageHandler,
}

impl SharedState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let store = Arc::new(Store::new());
        let connections = Arc::new(ConnectionRegistry::new(store.clone()));
        let registry = Arc::new(Registry::new());
        let handler = MessageHandler::new(
            store.clone(),
            connections.clone(),
            registry.clone(),
            config.prekey_batch,
        );
        Arc::new(Self {
            config,
            store,
            connections,
            registry,
            handler,
        })
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Run until the process is torn down.
    pub async fn run(self) -> Result<()> {
        let (addr, _state, handle) = self.start().await?;
        tracing::info!("listening on {addr}");
        handle.await?
    }

    /// Bind the listener and spawn the serve loop plus background tasks.
    /// Returns the bound address (useful with port 0) and the shared state.
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let state = SharedState::new(self.config.clone());

        let restored = state.registry.rehydrate(&state.store).await;
        if restored > 0 {
            tracing::info!(count = restored, "rehydrated users from the directory");
        }

        spawn_background_tasks(&state);

        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        let addr = listener.local_addr()?;

        let app = web::router(state.clone());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.map_err(Into::into)
        });
        Ok((addr, state, handle))
    }
}

/// The two persistent tasks: the self-destruct sweeper and the
/// presence-channel subscriber. Both end with the process.
pub fn spawn_background_tasks(state: &Arc<SharedState>) {
    let sweeper_state = state.clone();
    let sweep_interval = Duration::from_secs(state.config.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            match sweeper_state.handler.sweep_self_destruct().await {
                Ok(0) => {}
                Ok(count) => tracing::debug!(count, "self-destruct sweep expired messages"),
                Err(error) => {
                    tracing::warn!(%error, "self-destruct sweep failed; backing off");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });

    let mut presence_rx = state.store.subscribe(PRESENCE_CHANNEL);
    tokio::spawn(async move {
        loop {
            match presence_rx.recv().await {
                Ok(payload) => tracing::debug!(%payload, "presence update"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "presence subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for taskgate-core.
//!
//! [`TaskgateRuntime`] runs both QUIC servers plus the reaper and the
//! perpetual task rebalancer inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use taskgate_core::persistence;
//! use taskgate_core::runtime::TaskgateRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = persistence::connect("sqlite://taskgate.db?mode=rwc", 5).await?;
//!
//!     let runtime = TaskgateRuntime::builder()
//!         .persistence(persistence)
//!         .service_addr("0.0.0.0:9001".parse()?)
//!         .agent_addr("0.0.0.0:9002".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use taskgate_protocol::server::{ConnectionHandler, TaskgateServer};

use crate::callback::CallbackRegistry;
use crate::config::Config;
use crate::delegate::DelegateRegistry;
use crate::dispatcher::{DispatcherConfig, TaskBroadcaster, TaskDispatcher};
use crate::perpetual_scheduler::PerpetualTaskScheduler;
use crate::persistence::Persistence;
use crate::reaper::{TaskReaper, TaskReaperConfig};
use crate::rebalancer::{PerpetualTaskRebalancer, RebalancerConfig};
use crate::server::{agent_server, service_server};
use crate::service::DelegateService;

const DEFAULT_SERVICE_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 9001);
const DEFAULT_AGENT_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 9002);

/// Builder for creating a [`TaskgateRuntime`].
pub struct TaskgateRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    service_addr: SocketAddr,
    agent_addr: SocketAddr,
    dispatcher: DispatcherConfig,
    reaper: TaskReaperConfig,
    rebalancer: RebalancerConfig,
    broadcaster: Option<Arc<dyn TaskBroadcaster>>,
    background_workers: bool,
}

impl std::fmt::Debug for TaskgateRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskgateRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("service_addr", &self.service_addr)
            .field("agent_addr", &self.agent_addr)
            .field("dispatcher", &self.dispatcher)
            .field("reaper", &self.reaper)
            .field("rebalancer", &self.rebalancer)
            .field("background_workers", &self.background_workers)
            .finish()
    }
}

impl Default for TaskgateRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            service_addr: DEFAULT_SERVICE_ADDR,
            agent_addr: DEFAULT_AGENT_ADDR,
            dispatcher: DispatcherConfig::default(),
            reaper: TaskReaperConfig::default(),
            rebalancer: RebalancerConfig::default(),
            broadcaster: None,
            background_workers: true,
        }
    }
}

impl TaskgateRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses and worker settings from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            service_addr: config.service_addr,
            agent_addr: config.agent_addr,
            dispatcher: config.dispatcher_config(),
            reaper: config.reaper_config(),
            rebalancer: config.rebalancer_config(),
            ..Self::default()
        }
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Default: `0.0.0.0:9001`
    pub fn service_addr(mut self, addr: SocketAddr) -> Self {
        self.service_addr = addr;
        self
    }

    /// Default: `0.0.0.0:9002`
    pub fn agent_addr(mut self, addr: SocketAddr) -> Self {
        self.agent_addr = addr;
        self
    }

    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = config;
        self
    }

    pub fn reaper_config(mut self, config: TaskReaperConfig) -> Self {
        self.reaper = config;
        self
    }

    pub fn rebalancer_config(mut self, config: RebalancerConfig) -> Self {
        self.rebalancer = config;
        self
    }

    /// Replace the in-process broadcast hook.
    pub fn broadcaster(mut self, broadcaster: Arc<dyn TaskBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Run the reaper and rebalancer loops. Default: true.
    pub fn background_workers(mut self, enabled: bool) -> Self {
        self.background_workers = enabled;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<TaskgateRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        if self.service_addr == self.agent_addr && self.service_addr.port() != 0 {
            anyhow::bail!("service and agent addresses must differ");
        }

        Ok(TaskgateRuntimeConfig {
            persistence,
            service_addr: self.service_addr,
            agent_addr: self.agent_addr,
            dispatcher: self.dispatcher,
            reaper: self.reaper,
            rebalancer: self.rebalancer,
            broadcaster: self.broadcaster,
            background_workers: self.background_workers,
        })
    }
}

/// Configuration for a [`TaskgateRuntime`].
pub struct TaskgateRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    service_addr: SocketAddr,
    agent_addr: SocketAddr,
    dispatcher: DispatcherConfig,
    reaper: TaskReaperConfig,
    rebalancer: RebalancerConfig,
    broadcaster: Option<Arc<dyn TaskBroadcaster>>,
    background_workers: bool,
}

impl std::fmt::Debug for TaskgateRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskgateRuntimeConfig")
            .field("persistence", &"...")
            .field("service_addr", &self.service_addr)
            .field("agent_addr", &self.agent_addr)
            .field("background_workers", &self.background_workers)
            .finish()
    }
}

impl TaskgateRuntimeConfig {
    /// Wire the engine, bind both servers and spawn them with the workers.
    pub async fn start(self) -> Result<TaskgateRuntime> {
        let mut dispatcher = TaskDispatcher::new(self.persistence.clone(), self.dispatcher);
        if let Some(broadcaster) = self.broadcaster {
            dispatcher = dispatcher.with_broadcaster(broadcaster);
        }
        let dispatcher = Arc::new(dispatcher);
        let scheduler = Arc::new(PerpetualTaskScheduler::new(
            self.persistence.clone(),
            self.rebalancer.delegate_heartbeat_timeout,
        ));
        let service = Arc::new(DelegateService::new(
            dispatcher.clone(),
            scheduler.clone(),
            Arc::new(CallbackRegistry::new(self.persistence.clone())),
            Arc::new(DelegateRegistry::new(
                self.persistence.clone(),
                self.reaper.delegate_heartbeat_timeout,
            )),
        ));

        // Bind before spawning so address errors surface here.
        let service_server = TaskgateServer::localhost(self.service_addr)?;
        let agent_server = TaskgateServer::localhost(self.agent_addr)?;
        let service_addr = service_server.local_addr()?;
        let agent_addr = agent_server.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = service.clone();
        let service_handle = tokio::spawn(serve_until_shutdown(
            service_server,
            "Delegate service",
            shutdown_rx.clone(),
            move |conn: ConnectionHandler| {
                let state = state.clone();
                async move { service_server::handle_connection(conn, state).await }
            },
        ));
        let state = service.clone();
        let agent_handle = tokio::spawn(serve_until_shutdown(
            agent_server,
            "Agent",
            shutdown_rx,
            move |conn: ConnectionHandler| {
                let state = state.clone();
                async move { agent_server::handle_connection(conn, state).await }
            },
        ));

        let mut workers = Vec::new();
        if self.background_workers {
            let reaper = TaskReaper::new(dispatcher, self.reaper);
            let reaper_shutdown = reaper.shutdown_handle();
            workers.push((reaper_shutdown, tokio::spawn(async move { reaper.run().await })));

            let rebalancer = PerpetualTaskRebalancer::new(scheduler, self.rebalancer);
            let rebalancer_shutdown = rebalancer.shutdown_handle();
            workers.push((
                rebalancer_shutdown,
                tokio::spawn(async move { rebalancer.run().await }),
            ));
        }

        info!(
            service_addr = %service_addr,
            agent_addr = %agent_addr,
            workers = workers.len(),
            "TaskgateRuntime started"
        );

        Ok(TaskgateRuntime {
            service_handle,
            agent_handle,
            workers,
            shutdown_tx,
            service,
            persistence: self.persistence,
            service_addr,
            agent_addr,
        })
    }
}

/// A running taskgate-core instance that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct TaskgateRuntime {
    service_handle: JoinHandle<Result<()>>,
    agent_handle: JoinHandle<Result<()>>,
    workers: Vec<(Arc<Notify>, JoinHandle<()>)>,
    shutdown_tx: watch::Sender<bool>,
    service: Arc<DelegateService>,
    persistence: Arc<dyn Persistence>,
    service_addr: SocketAddr,
    agent_addr: SocketAddr,
}

impl TaskgateRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> TaskgateRuntimeBuilder {
        TaskgateRuntimeBuilder::new()
    }

    /// Bound address of the delegate service server.
    pub fn service_addr(&self) -> SocketAddr {
        self.service_addr
    }

    /// Bound address of the agent server.
    pub fn agent_addr(&self) -> SocketAddr {
        self.agent_addr
    }

    /// The facade both servers route to, for in-process callers.
    pub fn service(&self) -> &Arc<DelegateService> {
        &self.service
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Check if both servers are still running.
    pub fn is_running(&self) -> bool {
        !self.service_handle.is_finished() && !self.agent_handle.is_finished()
    }

    /// Gracefully shut down servers and workers.
    pub async fn shutdown(self) -> Result<()> {
        info!("TaskgateRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);
        for (shutdown, handle) in self.workers {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                error!("Background worker panicked: {}", e);
            }
        }

        let mut first_error = None;
        for (name, handle) in [("service", self.service_handle), ("agent", self.agent_handle)] {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("{} server task panicked: {}", name, e)),
            };
            if let Err(e) = outcome {
                error!(server = name, "TaskgateRuntime server error during shutdown: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("TaskgateRuntime shutdown complete");
                Ok(())
            }
        }
    }
}

/// Accept connections on `server` until shutdown is signalled.
async fn serve_until_shutdown<H, Fut>(
    server: TaskgateServer,
    name: &'static str,
    mut shutdown_rx: watch::Receiver<bool>,
    handler: H,
) -> Result<()>
where
    H: Fn(ConnectionHandler) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    info!(server = name, addr = ?server.local_addr().ok(), "QUIC server starting");

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!(server = name, "QUIC server received shutdown signal");
                    server.close();
                    break;
                }
            }

            incoming = server.accept() => {
                let Some(incoming) = incoming else {
                    // Endpoint closed
                    break;
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => {
                            debug!(remote_addr = %connection.remote_address(), "accepted connection");
                            handler(ConnectionHandler::new(connection)).await;
                        }
                        Err(e) => debug!("failed to accept connection: {}", e),
                    }
                });
            }
        }
    }

    info!(server = name, "QUIC server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;

    fn lazy_persistence() -> Arc<dyn Persistence> {
        Arc::new(SqlitePersistence::new(
            sqlx::sqlite::SqlitePoolOptions::new()
                .connect_lazy("sqlite::memory:")
                .unwrap(),
        ))
    }

    #[test]
    fn test_builder_default() {
        let builder = TaskgateRuntimeBuilder::default();
        assert!(builder.persistence.is_none());
        assert_eq!(builder.service_addr.port(), 9001);
        assert_eq!(builder.agent_addr.port(), 9002);
        assert!(builder.background_workers);
    }

    #[tokio::test]
    async fn test_builder_debug_hides_persistence() {
        let builder = TaskgateRuntime::builder().persistence(lazy_persistence());
        let debug_str = format!("{:?}", builder);
        assert!(debug_str.contains("TaskgateRuntimeBuilder"));
        assert!(debug_str.contains("..."));
    }

    #[test]
    fn test_build_missing_persistence() {
        let err = TaskgateRuntime::builder().build().unwrap_err();
        assert!(err.to_string().contains("persistence is required"));
    }

    #[tokio::test]
    async fn test_build_rejects_shared_port() {
        let addr: SocketAddr = "127.0.0.1:7500".parse().unwrap();
        let result = TaskgateRuntime::builder()
            .persistence(lazy_persistence())
            .service_addr(addr)
            .agent_addr(addr)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = TaskgateRuntime::builder()
            .persistence(lazy_persistence())
            .service_addr(any)
            .agent_addr(any)
            .background_workers(false)
            .build()
            .unwrap();

        // Start may fail in CI environments without network access
        if let Ok(runtime) = config.start().await {
            assert!(runtime.is_running());
            assert_ne!(runtime.service_addr().port(), 0);
            assert_ne!(runtime.service_addr(), runtime.agent_addr());
            runtime.shutdown().await.unwrap();
        }
    }
}

//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: storage worker → engine → listeners → console
//! - Shutdown order: listeners → engine (final flush) → storage worker

use crate::adapters::bus::BusGateway;
use crate::adapters::tcp::{ConnectionSettings, TcpGateway, TcpRole};
use crate::adapters::{AdapterEvent, ListenerHandle};
use crate::core::config::Config;
use crate::engine::Engine;
use crate::storage::StorageHandle;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// How long shutdown waits for the engine to flush.
const ENGINE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Starting,
    Healthy,
    Stopping,
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    pub storage: ComponentHealth,
    pub engine: ComponentHealth,
    pub listeners: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            storage: ComponentHealth::Starting,
            engine: ComponentHealth::Starting,
            listeners: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve clients.
    pub fn is_ready(&self) -> bool {
        [self.storage, self.engine, self.listeners]
            .iter()
            .all(|c| *c == ComponentHealth::Healthy)
    }
}

/// Sync server runtime holding all component handles.
pub struct Runtime {
    config: Arc<Config>,
    health: RuntimeHealth,
    storage: Option<StorageHandle>,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<AdapterEvent>>,
    engine_handle: Option<JoinHandle<()>>,
    listeners: Vec<(&'static str, ListenerHandle)>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config: Arc::new(config),
            health: RuntimeHealth::default(),
            storage: None,
            events_tx,
            events_rx: Some(events_rx),
            engine_handle: None,
            listeners: Vec::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Addresses the started listeners are bound to.
    pub fn local_addrs(&self) -> Vec<(&'static str, SocketAddr)> {
        self.listeners
            .iter()
            .map(|(name, handle)| (*name, handle.local_addr))
            .collect()
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Initialize and start all runtime components.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(database = %self.config.storage.database, "starting plotsync runtime");

        self.init_storage();
        self.init_engine().await?;
        self.start_listeners().await?;

        tracing::info!("plotsync runtime started");
        Ok(())
    }

    fn init_storage(&mut self) {
        let storage = StorageHandle::open(&self.config.storage);
        self.storage = Some(storage);
        self.health.storage = ComponentHealth::Healthy;
        tracing::info!(database = %self.config.storage.database, "storage worker started");
    }

    async fn init_engine(&mut self) -> Result<()> {
        let storage = self
            .storage
            .clone()
            .context("storage worker is not running")?;
        let events = self
            .events_rx
            .take()
            .context("engine already started")?;

        let engine = Engine::open(&self.config, storage).await;
        let console = self.config.admin.stdin.then(spawn_console);
        let shutdown = self.shutdown_rx.clone();
        self.engine_handle = Some(tokio::spawn(engine.run(events, console, shutdown)));
        self.health.engine = ComponentHealth::Healthy;
        Ok(())
    }

    async fn start_listeners(&mut self) -> Result<()> {
        let settings = ConnectionSettings::from(&self.config.protocol);
        let framed = [
            (TcpRole::Native, "native", self.config.listeners.native.clone()),
            (TcpRole::Tracker, "tracker", self.config.listeners.tracker.clone()),
        ];
        for (role, name, bind) in framed {
            let Some(bind) = bind else {
                continue;
            };
            let addr = parse_bind(name, &bind)?;
            let gateway = TcpGateway::new(
                role,
                addr,
                settings,
                self.events_tx.clone(),
                self.shutdown_rx.clone(),
            );
            let handle = gateway
                .start()
                .await
                .with_context(|| format!("failed to start {name} listener on {addr}"))?;
            self.listeners.push((name, handle));
        }

        if let Some(bind) = self.config.listeners.web.clone() {
            let addr = parse_bind("web", &bind)?;
            let gateway = BusGateway::new(addr, self.events_tx.clone(), self.shutdown_rx.clone());
            let handle = gateway
                .start()
                .await
                .with_context(|| format!("failed to start web listener on {addr}"))?;
            self.listeners.push(("web", handle));
        }

        self.health.listeners = ComponentHealth::Healthy;
        tracing::info!(count = self.listeners.len(), "network listeners started");
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the runtime until ctrl-c or a shutdown request.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Stop all runtime components in reverse start order.
    pub async fn stop(&mut self) {
        tracing::info!("stopping plotsync runtime");
        let _ = self.shutdown_tx.send(true);

        self.health.listeners = ComponentHealth::Stopping;
        for (name, handle) in self.listeners.drain(..) {
            if let Err(e) = handle.task.await {
                tracing::warn!(listener = name, error = %e, "listener task panicked");
            }
        }
        self.health.listeners = ComponentHealth::Stopped;

        self.health.engine = ComponentHealth::Stopping;
        if let Some(handle) = self.engine_handle.take() {
            match tokio::time::timeout(ENGINE_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "engine task panicked"),
                Err(_) => tracing::warn!("engine stop timed out"),
            }
        }
        self.health.engine = ComponentHealth::Stopped;

        // Dropping the last handle stops the worker thread.
        self.storage = None;
        self.health.storage = ComponentHealth::Stopped;
        tracing::info!("plotsync runtime stopped");
    }
}

fn parse_bind(name: &str, bind: &str) -> Result<SocketAddr> {
    bind.parse()
        .with_context(|| format!("invalid {name} bind address: {bind}"))
}

/// Forward stdin lines to the engine.
fn spawn_console() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "console read failed");
                    break;
                }
            }
        }
        tracing::debug!("console closed");
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_ready_only_when_all_healthy() {
        let mut health = RuntimeHealth::default();
        assert!(!health.is_ready());
        health.storage = ComponentHealth::Healthy;
        health.engine = ComponentHealth::Healthy;
        assert!(!health.is_ready());
        health.listeners = ComponentHealth::Healthy;
        assert!(health.is_ready());
    }

    #[tokio::test]
    async fn test_runtime_starts_and_stops_on_ephemeral_ports() {
        let mut config = Config::default();
        config.storage.database = ":memory:".into();
        config.listeners.native = Some("127.0.0.1:0".into());
        config.listeners.tracker = None;
        config.listeners.web = Some("127.0.0.1:0".into());

        let mut runtime = Runtime::new(config).unwrap();
        runtime.start().await.unwrap();
        assert!(runtime.health().is_ready());

        let names: Vec<&str> = runtime.local_addrs().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["native", "web"]);

        runtime.stop().await;
        assert_eq!(runtime.health().listeners, ComponentHealth::Stopped);
    }
}

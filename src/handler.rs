//! The device handler: sole owner of a device's lifecycle. It constructs the
//! memory map, model, and peer tables, binds every listener (fail fast),
//! spawns the simulation loop, peer links, and adapters, and tears them all
//! down again with a bounded grace period. It never participates in the data
//! path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use crate::adapters::{self, ProtocolAdapter};
use crate::config::DeviceConfig;
use crate::core::DeviceCore;
use crate::error::StartupError;
use crate::memory::MemoryMap;
use crate::models;
use crate::peer::{self, LinkConfig};
use crate::simproto::{Guid, PeerTable};

/// Lifecycle states. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Init,
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub struct DeviceHandler {
    guid: Guid,
    memory: Arc<MemoryMap>,
    sim_addr: SocketAddr,
    adapter_addrs: Vec<(&'static str, SocketAddr)>,
    grace: Duration,
    state_tx: watch::Sender<HandlerState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl DeviceHandler {
    /// Build and start a device from its configuration.
    ///
    /// Startup is fail-fast: configuration and model construction errors, or
    /// any listener that cannot bind, abort before anything runs; no partial
    /// device is ever left behind. On success the device is `Running`.
    pub async fn start(config: DeviceConfig) -> Result<Self, StartupError> {
        let (state_tx, _) = watch::channel(HandlerState::Init);
        state_tx.send_replace(HandlerState::Starting);

        config.validate()?;
        let model = models::build_model(&config.device, &config.parameters)?;
        let memory = Arc::new(MemoryMap::new(model.memory_layout()));
        let guid = config.guid;

        // Bind everything before spawning anything: a bind failure is the
        // only fatal startup error that is not a configuration rejection.
        let sim_listener =
            TcpListener::bind(config.sim_bind)
                .await
                .map_err(|source| StartupError::Bind {
                    role: "simproto",
                    addr: config.sim_bind,
                    source,
                })?;
        let sim_addr = sim_listener.local_addr().unwrap_or(config.sim_bind);

        let mut bound_adapters: Vec<(Box<dyn ProtocolAdapter>, TcpListener)> = Vec::new();
        let mut adapter_addrs = Vec::new();
        for adapter_config in &config.adapters {
            let listener =
                TcpListener::bind(adapter_config.bind)
                    .await
                    .map_err(|source| StartupError::Bind {
                        role: "adapter",
                        addr: adapter_config.bind,
                        source,
                    })?;
            let adapter = adapters::build_adapter(adapter_config, guid, model.kind(), &memory);
            let bound = listener.local_addr().unwrap_or(adapter_config.bind);
            adapter_addrs.push((adapter.name(), bound));
            bound_adapters.push((adapter, listener));
        }

        let freshness = config.freshness();
        let upstream_table = Arc::new(PeerTable::new(
            config.upstream.iter().map(|u| u.guid),
            freshness,
        ));
        let downstream_table = Arc::new(PeerTable::new(
            config.downstream.iter().copied(),
            freshness,
        ));

        let (export_down_tx, export_down_rx) = watch::channel(None);
        let (export_up_tx, export_up_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let core = DeviceCore::new(
            guid,
            Arc::clone(&memory),
            model,
            Arc::clone(&upstream_table),
            Arc::clone(&downstream_table),
            config.tick(),
            export_down_tx,
            export_up_tx,
        );

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        tasks.push(("simulation", tokio::spawn(core.run(shutdown_rx.clone()))));
        tasks.push((
            "simproto-acceptor",
            tokio::spawn(peer::run_acceptor(
                guid,
                sim_listener,
                downstream_table,
                export_down_rx,
                shutdown_rx.clone(),
            )),
        ));
        for up in &config.upstream {
            let link = LinkConfig {
                local: guid,
                peer: up.guid,
                addr: up.addr,
                max_backoff: config.max_backoff(),
            };
            tasks.push((
                "peer-dialer",
                tokio::spawn(peer::run_dialer(
                    link,
                    Arc::clone(&upstream_table),
                    export_up_rx.clone(),
                    shutdown_rx.clone(),
                )),
            ));
        }
        for (adapter, listener) in bound_adapters {
            let name = adapter.name();
            let handle = adapter.start(listener, Arc::clone(&memory), shutdown_rx.clone());
            tasks.push((name, handle));
        }

        state_tx.send_replace(HandlerState::Running);
        info!(
            guid = %guid,
            sim_addr = %sim_addr,
            adapters = adapter_addrs.len(),
            upstream = config.upstream.len(),
            downstream = config.downstream.len(),
            "device running"
        );

        Ok(Self {
            guid,
            memory,
            sim_addr,
            adapter_addrs,
            grace: config.grace(),
            state_tx,
            shutdown_tx,
            tasks,
        })
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// The device's memory map; adapters and tests read through this.
    pub fn memory(&self) -> Arc<MemoryMap> {
        Arc::clone(&self.memory)
    }

    /// Actual simproto listener address (useful when bound to port 0).
    pub fn sim_addr(&self) -> SocketAddr {
        self.sim_addr
    }

    /// Actual adapter listener addresses, in configuration order.
    pub fn adapter_addrs(&self) -> &[(&'static str, SocketAddr)] {
        &self.adapter_addrs
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<HandlerState> {
        self.state_tx.subscribe()
    }

    /// Coordinated shutdown: signal every component, then give the whole set
    /// the configured grace period. Components that do not stop in time are
    /// force-aborted and logged, never escalated to a process failure.
    pub async fn shutdown(mut self) {
        self.state_tx.send_replace(HandlerState::Stopping);
        info!(guid = %self.guid, "device stopping");
        self.shutdown_tx.send_replace(true);

        let deadline = Instant::now() + self.grace;
        for (name, mut handle) in self.tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(guid = %self.guid, component = name, "did not stop within grace period, aborting");
                    handle.abort();
                }
            }
        }

        self.state_tx.send_replace(HandlerState::Stopped);
        info!(guid = %self.guid, "device stopped");
    }
}

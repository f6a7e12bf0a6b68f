//! Transparent Modbus bridge
//!
//! Relays traffic between any pair of transports (TCP<->RTU, TCP<->TCP,
//! RTU<->RTU) through a hook pipeline with dual-stream PCAP capture. With
//! no hooks installed the relay is bit-transparent modulo framing
//! conversion, and the upstream transaction id survives end-to-end.
//!
//! ```rust,no_run
//! use umdt::core::bridge::{Bridge, BridgeConfig};
//! use umdt::core::transport::Endpoint;
//!
//! # async fn demo() -> umdt::Result<()> {
//! let bridge = Bridge::new(BridgeConfig {
//!     upstream: Endpoint::tcp("0.0.0.0", 1502),
//!     downstream: Endpoint::serial("/dev/ttyUSB0", 9600),
//!     ..Default::default()
//! })?;
//! bridge.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod downstream;
pub mod pipeline;
pub mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::core::bridge::downstream::DownstreamLink;
use crate::core::bridge::pipeline::BridgeStats;
use crate::core::events::{EventBus, EventKind, EventStream};
use crate::core::pcap::DualPcap;
use crate::core::script::{ScriptEngine, ScriptHook};
use crate::core::transport::{Endpoint, SerialTransport, TransportOptions};
use crate::utils::error::{Result, UmdtError};

/// Bridge wiring: where to listen, where to forward, what to capture.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Listener side facing the masters (TCP bind address or serial port)
    pub upstream: Endpoint,
    /// Client side facing the slave
    pub downstream: Endpoint,
    /// Per-request downstream deadline; a miss answers 0x0B upstream
    pub downstream_timeout: Duration,
    /// PCAP path for master<->bridge traffic
    pub upstream_pcap: Option<PathBuf>,
    /// PCAP path for bridge<->slave traffic
    pub downstream_pcap: Option<PathBuf>,
    /// Interval for the time-driven `on_periodic` hook
    pub periodic_interval: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            upstream: Endpoint::tcp("0.0.0.0", 502),
            downstream: Endpoint::tcp("127.0.0.1", 502),
            downstream_timeout: Duration::from_secs(2),
            upstream_pcap: None,
            downstream_pcap: None,
            periodic_interval: None,
        }
    }
}

/// Shared state for sessions and the pipeline.
pub(crate) struct BridgeCore {
    pub scripts: Arc<ScriptEngine>,
    pub events: EventBus,
    pub pcap: DualPcap,
    pub downstream: DownstreamLink,
    pub stats: SyncMutex<BridgeStats>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    listener_task: JoinHandle<()>,
    periodic_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// The transparent bridge.
pub struct Bridge {
    config: BridgeConfig,
    core: Arc<BridgeCore>,
    running: Mutex<Option<Running>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let events = EventBus::default();
        let pcap = DualPcap::open(
            config.upstream_pcap.as_deref(),
            config.downstream_pcap.as_deref(),
        )?;
        let scripts = ScriptEngine::new("bridge", events.clone());
        let downstream = DownstreamLink::new(config.downstream.clone(), config.downstream_timeout);

        Ok(Self {
            core: Arc::new(BridgeCore {
                scripts,
                events,
                pcap,
                downstream,
                stats: SyncMutex::new(BridgeStats::default()),
            }),
            config,
            running: Mutex::new(None),
        })
    }

    /// Attach a hook to the bridge pipeline.
    pub fn register_hook(&self, hook: Arc<dyn ScriptHook>) {
        self.core.scripts.register(hook);
    }

    /// The bridge's script engine (hot reload, stats, context state).
    pub fn script_engine(&self) -> Arc<ScriptEngine> {
        Arc::clone(&self.core.scripts)
    }

    pub fn events(&self) -> EventBus {
        self.core.events.clone()
    }

    pub fn subscribe(&self) -> EventStream {
        self.core.events.subscribe()
    }

    pub fn stats(&self) -> BridgeStats {
        self.core.stats.lock().clone()
    }

    /// Connect downstream and start accepting masters. Returns the bound
    /// TCP address when the upstream side is TCP.
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(UmdtError::invalid("bridge is already running"));
        }

        // Downstream first, so the first master request finds a live slave.
        self.core.downstream.connect().await?;
        self.core.scripts.start().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (listener_task, local_addr) = match &self.config.upstream {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .map_err(|e| {
                        UmdtError::transport(format!("bind {host}:{port} failed: {e}"))
                    })?;
                let local_addr = listener
                    .local_addr()
                    .map_err(|e| UmdtError::transport(e.to_string()))?;
                let task = tokio::spawn(upstream::run_tcp_listener(
                    Arc::clone(&self.core),
                    listener,
                    shutdown_rx,
                ));
                (task, Some(local_addr))
            }
            Endpoint::Serial { .. } => {
                let mut transport = SerialTransport::new(
                    self.config.upstream.clone(),
                    TransportOptions::default(),
                )?
                .expecting_requests();
                use crate::core::transport::ModbusTransport;
                transport.open().await?;
                let task = tokio::spawn(upstream::run_serial_listener(
                    Arc::clone(&self.core),
                    transport,
                    shutdown_rx,
                ));
                (task, None)
            }
        };

        let periodic_task = self
            .config
            .periodic_interval
            .map(|interval| self.core.scripts.spawn_periodic(interval));

        info!(
            "[Bridge] started: upstream {} -> downstream {}",
            self.config.upstream.describe(),
            self.config.downstream.describe()
        );
        self.core.events.publish(
            EventKind::Lifecycle,
            json!({
                "state": "started",
                "upstream": self.config.upstream.describe(),
                "downstream": self.config.downstream.describe(),
            }),
        );

        *running = Some(Running {
            shutdown: shutdown_tx,
            listener_task,
            periodic_task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Bound upstream TCP address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().and_then(|r| r.local_addr)
    }

    /// Stop accepting, close sessions and the downstream link, run script
    /// shutdown.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            running.listener_task.abort();
            let _ = running.listener_task.await;
            if let Some(periodic) = running.periodic_task {
                periodic.abort();
            }
            self.core.scripts.stop().await;
            self.core.downstream.disconnect().await;
            self.core
                .events
                .publish(EventKind::Lifecycle, json!({"state": "stopped"}));
            info!("[Bridge] stopped");
        }
    }
}

//! Mock Modbus server
//!
//! Emulates a Modbus endpoint from a rule-driven register store with fault
//! injection and a scriptable hook pipeline. The server listens on TCP
//! (many concurrent sessions) or a serial port (one session), dispatches by
//! function code, and exposes a live state API for REPLs, GUIs and scripts.
//!
//! ```rust,no_run
//! use umdt::core::server::{MockServer, MockServerConfig};
//! use umdt::core::server::models::{DataKind, RegisterGroup};
//!
//! # async fn demo() -> umdt::Result<()> {
//! let config = MockServerConfig::with_groups(vec![
//!     RegisterGroup::new("sensors", DataKind::Holding, 0, 32),
//! ]);
//! let server = MockServer::new(config)?;
//! let addr = server.start_tcp("127.0.0.1", 0).await?;
//! println!("listening on {addr}");
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod faults;
pub mod listener;
pub mod models;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::events::{EventBus, EventKind, EventStream};
use crate::core::pdu::DataKind;
use crate::core::script::{ScriptEngine, ScriptHook};
use crate::core::server::config::ScriptRef;
use crate::core::server::faults::FaultInjector;
use crate::core::server::models::{FaultProfile, RegisterRule};
use crate::core::server::store::{MockDevice, StoreSnapshot};
use crate::core::transport::{Endpoint, SerialTransport, TransportOptions};
use crate::utils::error::{Result, UmdtError};

/// Shared state the listeners and dispatch work against.
pub(crate) struct ServerCore {
    pub device_name: String,
    pub unit_id: u8,
    device: RwLock<Arc<MockDevice>>,
    pub faults: Arc<FaultInjector>,
    pub scripts: Arc<ScriptEngine>,
    pub events: EventBus,
}

impl ServerCore {
    pub(crate) fn device(&self) -> Arc<MockDevice> {
        Arc::clone(&self.device.read())
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    listener_task: JoinHandle<()>,
    periodic_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// The mock server: lifecycle plus the live state API.
pub struct MockServer {
    core: Arc<ServerCore>,
    script_refs: Vec<ScriptRef>,
    periodic_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl MockServer {
    /// Build a server from a validated configuration.
    pub fn new(config: MockServerConfig) -> Result<Self> {
        let events = EventBus::default();
        let device = MockDevice::new(config.groups, config.rules)?;
        let faults = Arc::new(FaultInjector::new(
            config.faults,
            config.random_seed,
            events.clone(),
        ));
        let scripts = ScriptEngine::new(format!("server:{}", config.device_name), events.clone());
        scripts.set_register_access(device.clone());

        Ok(Self {
            core: Arc::new(ServerCore {
                device_name: config.device_name,
                unit_id: config.unit_id,
                device: RwLock::new(device),
                faults,
                scripts,
                events,
            }),
            script_refs: config.scripts,
            periodic_interval: Duration::from_secs(1),
            running: Mutex::new(None),
        })
    }

    /// Load a YAML/JSON config file and build a server from it.
    pub fn from_config_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::new(MockServerConfig::load(path)?)
    }

    /// Script references listed in the config file; the embedding
    /// application resolves them to hooks and calls [`MockServer::register_hook`].
    pub fn script_refs(&self) -> &[ScriptRef] {
        &self.script_refs
    }

    /// Attach a hook to the server-side engine.
    pub fn register_hook(&self, hook: Arc<dyn ScriptHook>) {
        self.core.scripts.register(hook);
    }

    /// The server's script engine (hot reload, stats).
    pub fn script_engine(&self) -> Arc<ScriptEngine> {
        Arc::clone(&self.core.scripts)
    }

    /// Diagnostic event bus.
    pub fn events(&self) -> EventBus {
        self.core.events.clone()
    }

    /// Subscribe an observer to the event stream.
    pub fn subscribe(&self) -> EventStream {
        self.core.events.subscribe()
    }

    pub fn unit_id(&self) -> u8 {
        self.core.unit_id
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start listening on TCP. Returns the bound address (useful with
    /// port 0).
    pub async fn start_tcp(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(UmdtError::invalid("server is already running"));
        }

        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| UmdtError::transport(format!("bind {host}:{port} failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| UmdtError::transport(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let core = Arc::clone(&self.core);
        core.scripts.start().await;

        let accept_core = Arc::clone(&core);
        let listener_task = tokio::spawn(async move {
            let mut shutdown = shutdown_rx;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            tokio::spawn(listener::run_tcp_session(
                                Arc::clone(&accept_core),
                                stream,
                                peer.to_string(),
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!("[MockServer] accept error: {}", e);
                            break;
                        }
                    },
                }
            }
        });

        let periodic_task = Some(self.core.scripts.spawn_periodic(self.periodic_interval));

        info!(
            "[MockServer] '{}' listening on {} (unit {})",
            self.core.device_name, local_addr, self.core.unit_id
        );
        self.core.events.publish(
            EventKind::Lifecycle,
            json!({"state": "started", "addr": local_addr.to_string(), "unit": self.core.unit_id}),
        );

        *running = Some(Running {
            shutdown: shutdown_tx,
            listener_task,
            periodic_task,
            local_addr: Some(local_addr),
        });
        Ok(local_addr)
    }

    /// Start serving a single serial RTU session.
    pub async fn start_serial(&self, endpoint: Endpoint) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(UmdtError::invalid("server is already running"));
        }
        if !endpoint.is_serial() {
            return Err(UmdtError::invalid("serial listener requires a serial endpoint"));
        }

        let mut transport =
            SerialTransport::new(endpoint.clone(), TransportOptions::default())?
                .expecting_requests();
        use crate::core::transport::ModbusTransport;
        transport.open().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let core = Arc::clone(&self.core);
        core.scripts.start().await;

        let listener_task = tokio::spawn(listener::run_serial_session(
            Arc::clone(&core),
            transport,
            shutdown_rx,
        ));
        let periodic_task = Some(self.core.scripts.spawn_periodic(self.periodic_interval));

        info!(
            "[MockServer] '{}' serving {} (unit {})",
            self.core.device_name,
            endpoint.describe(),
            self.core.unit_id
        );
        self.core.events.publish(
            EventKind::Lifecycle,
            json!({"state": "started", "endpoint": endpoint.describe()}),
        );

        *running = Some(Running {
            shutdown: shutdown_tx,
            listener_task,
            periodic_task,
            local_addr: None,
        });
        Ok(())
    }

    /// Bound TCP address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().and_then(|r| r.local_addr)
    }

    /// Stop the listener, cancel sessions, run script shutdown.
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
            self.core
                .events
                .publish(EventKind::Lifecycle, json!({"state": "stopped"}));
            info!("[MockServer] '{}' stopped", self.core.device_name);
        }
    }

    // ========================================================================
    // State API
    // ========================================================================

    /// Read one cell as stored (rules bypassed).
    pub async fn get(&self, kind: DataKind, address: u16) -> Result<u16> {
        self.core.device().get(kind, address).await
    }

    /// Set one cell directly (live value mutation).
    pub async fn set(&self, kind: DataKind, address: u16, value: u16) -> Result<()> {
        self.core.device().set(kind, address, value).await
    }

    /// Install a per-address rule; applies from the next request.
    pub fn add_rule(&self, kind: DataKind, address: u16, rule: RegisterRule) {
        self.core.device().add_rule(kind, address, rule);
    }

    /// Remove a rule; true when one existed.
    pub fn remove_rule(&self, kind: DataKind, address: u16) -> bool {
        self.core.device().remove_rule(kind, address)
    }

    /// Swap the fault profile; applies from the next request.
    pub fn update_faults(&self, profile: FaultProfile) {
        self.core.faults.update(profile);
    }

    /// Full state dump.
    pub async fn snapshot(&self) -> StoreSnapshot {
        self.core.device().snapshot().await
    }

    /// Replace groups/rules/faults from a config file while running.
    /// Sessions started before the swap finish against the old store.
    pub fn load_config(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let config = MockServerConfig::load(path)?;
        let device = MockDevice::new(config.groups, config.rules)?;
        self.core.scripts.set_register_access(device.clone());
        *self.core.device.write() = device;
        self.core.faults.update(config.faults);
        if let Some(seed) = config.random_seed {
            self.core.faults.reseed(seed);
        }
        self.core
            .events
            .publish(EventKind::Lifecycle, json!({"state": "config_reloaded"}));
        Ok(())
    }
}

pub use config::MockServerConfig;

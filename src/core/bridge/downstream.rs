//! Bridge downstream link
//!
//! The single client-side connection to the slave device. All upstream
//! sessions funnel through one bus coordinator here, so downstream traffic
//! is strictly serialized. The link reconnects on demand after a transport
//! failure.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::bus::{BusCoordinator, BusPriority};
use crate::core::events::{EventBus, EventKind};
use crate::core::frame::{self, ModbusMode};
use crate::core::pcap::{Direction, DualPcap};
use crate::core::pdu::{Request, Response};
use crate::core::transport::{self, Endpoint, ModbusTransport, TransportOptions};
use crate::utils::error::{Result, UmdtError};

pub(crate) struct DownstreamLink {
    endpoint: Endpoint,
    timeout: Duration,
    bus: Arc<BusCoordinator>,
    transport: Mutex<Option<Box<dyn ModbusTransport>>>,
    next_txn: AtomicU16,
}

impl DownstreamLink {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self {
            endpoint,
            timeout,
            bus: BusCoordinator::new(),
            transport: Mutex::new(None),
            next_txn: AtomicU16::new(1),
        }
    }

    pub fn mode(&self) -> ModbusMode {
        self.endpoint.mode()
    }

    pub fn bus(&self) -> Arc<BusCoordinator> {
        Arc::clone(&self.bus)
    }

    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.transport.lock().await;
        if slot.is_none() {
            let options = TransportOptions::default().with_response_timeout(self.timeout);
            *slot = Some(transport::connect(&self.endpoint, options).await?);
            debug!("[Bridge] downstream connected: {}", self.endpoint.describe());
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        if let Some(mut t) = self.transport.lock().await.take() {
            let _ = t.close().await;
        }
    }

    /// Forward one request and wait for its reply. The caller's request is
    /// re-framed for the downstream side; the upstream transaction id is
    /// carried through when the downstream speaks TCP so the relay stays
    /// bit-transparent.
    pub async fn exchange(
        &self,
        request: &Request,
        pcap: &DualPcap,
        events: &EventBus,
    ) -> Result<Response> {
        let _guard = self.bus.acquire(BusPriority::Operator).await;
        let mut slot = self.transport.lock().await;
        if slot.is_none() {
            let options = TransportOptions::default().with_response_timeout(self.timeout);
            *slot = Some(transport::connect(&self.endpoint, options).await?);
        }
        let transport = slot.as_mut().expect("connected above");

        let mode = self.mode();
        let txn = request
            .transaction_id
            .unwrap_or_else(|| self.next_txn.fetch_add(1, Ordering::Relaxed));
        let wire = frame::build_frame(mode, request.unit_id, request.pdu(), txn);

        pcap.log_downstream(&wire, Direction::Outbound, mode.into()).await;
        events.publish(
            EventKind::Request,
            json!({"side": "downstream", "raw": hex::encode_upper(&wire)}),
        );

        if let Err(e) = transport.send(&wire).await {
            *slot = None;
            return Err(e);
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(UmdtError::timeout(self.timeout));
            }
            let captured = match transport.receive_frame(remaining).await {
                Ok(captured) => captured,
                Err(e @ UmdtError::Transport(_)) => {
                    *slot = None;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            pcap.log_downstream(&captured.raw, Direction::Inbound, mode.into())
                .await;
            events.publish(
                EventKind::Response,
                json!({"side": "downstream", "raw": hex::encode_upper(&captured.raw)}),
            );

            if !captured.valid {
                return Err(captured.into_error());
            }
            if mode == ModbusMode::Tcp {
                if let Some(rx_txn) = captured.transaction_id {
                    if rx_txn != txn {
                        warn!(
                            "[Bridge] downstream txn mismatch: got {} expected {}",
                            rx_txn, txn
                        );
                        continue;
                    }
                }
            }
            return Ok(Response::from_frame(&captured));
        }
    }
}

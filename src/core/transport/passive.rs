//! Passive (read-only) transport wrapper
//!
//! Decorates any transport and refuses to transmit, guaranteeing electrical
//! passivity for sniffer mode: connection and receive operations pass
//! through, `send` fails with the `Forbidden` error kind.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::frame::{CapturedFrame, ModbusMode};
use crate::core::transport::ModbusTransport;
use crate::utils::error::{Result, UmdtError};

/// Read-only wrapper around another transport.
pub struct PassiveTransport {
    inner: Box<dyn ModbusTransport>,
}

impl PassiveTransport {
    pub fn new(inner: Box<dyn ModbusTransport>) -> Self {
        Self { inner }
    }

    /// Access the wrapped transport.
    pub fn inner(&self) -> &dyn ModbusTransport {
        self.inner.as_ref()
    }
}

#[async_trait]
impl ModbusTransport for PassiveTransport {
    async fn open(&mut self) -> Result<()> {
        self.inner.open().await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    async fn send(&mut self, _data: &[u8]) -> Result<()> {
        Err(UmdtError::Forbidden(
            "send is forbidden in passive (sniffer) mode".to_string(),
        ))
    }

    async fn receive_frame(&mut self, timeout: Duration) -> Result<CapturedFrame> {
        self.inner.receive_frame(timeout).await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn mode(&self) -> ModbusMode {
        self.inner.mode()
    }

    fn describe(&self) -> String {
        format!("passive({})", self.inner.describe())
    }
}

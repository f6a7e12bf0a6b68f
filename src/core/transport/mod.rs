//! Transport abstraction
//!
//! A uniform async byte channel over TCP or serial. Each transport yields
//! whole frames via [`ModbusTransport::receive_frame`]; framing and CRC
//! verdicts ride along on the returned [`CapturedFrame`] instead of being
//! thrown as hard errors, so malformed traffic stays observable.

pub mod passive;
pub mod serial;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::frame::{CapturedFrame, ModbusMode};
use crate::utils::error::Result;

pub use passive::PassiveTransport;
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// Default deadline for a response frame.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Aggressive deadline used by the prober so one dead endpoint cannot stall
/// a combinatorial search.
pub const FAST_FAIL_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Where a transport connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    Tcp {
        host: String,
        port: u16,
    },
    Serial {
        path: String,
        baud: u32,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        /// Override for the RTU inter-byte gap, microseconds
        #[serde(default)]
        inter_byte_timeout_us: Option<u64>,
    },
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn serial(path: impl Into<String>, baud: u32) -> Self {
        Endpoint::Serial {
            path: path.into(),
            baud,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: 1,
            inter_byte_timeout_us: None,
        }
    }

    /// Framing implied by the endpoint.
    pub fn mode(&self) -> ModbusMode {
        match self {
            Endpoint::Tcp { .. } => ModbusMode::Tcp,
            Endpoint::Serial { .. } => ModbusMode::Rtu,
        }
    }

    pub fn is_serial(&self) -> bool {
        matches!(self, Endpoint::Serial { .. })
    }

    /// Short display form (`host:port` or `path@baud`).
    pub fn describe(&self) -> String {
        match self {
            Endpoint::Tcp { host, port } => format!("{host}:{port}"),
            Endpoint::Serial { path, baud, .. } => format!("{path}@{baud}"),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Connect/response deadlines for a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl TransportOptions {
    /// Prober configuration: everything bounded by the fast-fail deadline.
    pub fn fast_fail() -> Self {
        Self {
            connect_timeout: FAST_FAIL_TIMEOUT,
            response_timeout: FAST_FAIL_TIMEOUT,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

/// Uniform async byte channel carrying Modbus frames.
///
/// Reconnection is the caller's concern: after `closed`/error the transport
/// stays closed until `open` is called again.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Establish the connection / open the port.
    async fn open(&mut self) -> Result<()>;

    /// Tear the connection down. Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Write one frame's bytes to the wire.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for a complete frame. A frame that went silent
    /// mid-way comes back as a captured frame with `valid = false` rather
    /// than an error; `Timeout` means nothing arrived at all.
    async fn receive_frame(&mut self, timeout: Duration) -> Result<CapturedFrame>;

    fn is_open(&self) -> bool;

    /// Framing spoken on this channel.
    fn mode(&self) -> ModbusMode;

    /// Short display form for logs.
    fn describe(&self) -> String;
}

/// Open a transport for an endpoint.
pub async fn connect(
    endpoint: &Endpoint,
    options: TransportOptions,
) -> Result<Box<dyn ModbusTransport>> {
    match endpoint {
        Endpoint::Tcp { .. } => {
            let mut t = TcpTransport::new(endpoint.clone(), options);
            t.open().await?;
            Ok(Box::new(t))
        }
        Endpoint::Serial { .. } => {
            let mut t = SerialTransport::new(endpoint.clone(), options)?;
            t.open().await?;
            Ok(Box::new(t))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_describe() {
        assert_eq!(Endpoint::tcp("10.0.0.1", 502).describe(), "10.0.0.1:502");
        assert_eq!(
            Endpoint::serial("/dev/ttyUSB0", 9600).describe(),
            "/dev/ttyUSB0@9600"
        );
        assert_eq!(Endpoint::tcp("a", 1).mode(), ModbusMode::Tcp);
        assert_eq!(Endpoint::serial("b", 1).mode(), ModbusMode::Rtu);
    }

    #[test]
    fn test_endpoint_serde() {
        let ep: Endpoint =
            serde_yaml::from_str("kind: tcp\nhost: 127.0.0.1\nport: 1502\n").unwrap();
        assert_eq!(ep, Endpoint::tcp("127.0.0.1", 1502));

        let ep: Endpoint =
            serde_yaml::from_str("kind: serial\npath: COM3\nbaud: 19200\n").unwrap();
        match ep {
            Endpoint::Serial {
                data_bits,
                stop_bits,
                parity,
                ..
            } => {
                assert_eq!(data_bits, 8);
                assert_eq!(stop_bits, 1);
                assert_eq!(parity, Parity::None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_fast_fail_options() {
        let opts = TransportOptions::fast_fail();
        assert_eq!(opts.connect_timeout, FAST_FAIL_TIMEOUT);
        assert_eq!(opts.response_timeout, FAST_FAIL_TIMEOUT);
    }
}

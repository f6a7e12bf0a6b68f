//! # UMDT - Universal Modbus Diagnostic Tool (core engine)
//!
//! Diagnostic and integration engine for the Modbus protocol family
//! (RTU over serial, TCP over IP). The crate bundles three tools that share
//! one transport and framing stack:
//!
//! - A **client engine** with permissive framing (malformed frames are
//!   captured and surfaced, never silently discarded), endian-aware
//!   multi-register decoding, periodic monitoring, address scanning and a
//!   combinatorial endpoint prober.
//! - A **mock server** that emulates Modbus endpoints from a rule-driven
//!   register store with fault injection (latency, drop, bit flips, forced
//!   exceptions) and a scriptable hook pipeline.
//! - A **transparent bridge** relaying traffic between any pair of
//!   transports (TCP<->RTU, TCP<->TCP, RTU<->RTU) through an
//!   ingress/egress/response hook pipeline with dual-stream PCAP capture.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use umdt::core::client::{ClientEngine, ReadRequest};
//! use umdt::core::server::models::DataKind;
//! use umdt::core::transport::Endpoint;
//! use umdt::utils::error::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let endpoint = Endpoint::tcp("127.0.0.1", 1502);
//!     let client = ClientEngine::connect(endpoint, Duration::from_secs(2)).await?;
//!
//!     let outcome = client
//!         .read(ReadRequest::registers(1, DataKind::Holding, 100, 2))
//!         .await?;
//!     println!("registers: {:?}", outcome.registers);
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Supported function codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x02 | Read Discrete Inputs |
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x05 | Write Single Coil |
//! | 0x06 | Write Single Register |
//! | 0x0F | Write Multiple Coils |
//! | 0x10 | Write Multiple Registers |
//! | 0x17 | Read/Write Multiple Registers |
//! | 0x2B | Encapsulated Interface / Device Identification |

// ============================================================================
// Modules
// ============================================================================

/// Error types, logging bootstrap and small parsing helpers
pub mod utils;

/// The engine: codec, transports, client, server, bridge, capture
pub mod core;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use crate::core::bridge::{Bridge, BridgeConfig};
pub use crate::core::client::{ClientEngine, ReadRequest, WriteRequest};
pub use crate::core::decoding::{Endian, EndianMode};
pub use crate::core::events::{Event, EventBus, EventKind};
pub use crate::core::frame::{CapturedFrame, ModbusMode};
pub use crate::core::pcap::{Direction, PcapWriter, ProtocolHint};
pub use crate::core::prober::{ProbeResult, Prober};
pub use crate::core::server::MockServer;
pub use crate::core::transport::Endpoint;
pub use crate::utils::error::{FrameReason, Result, UmdtError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Modbus TCP default port.
pub const DEFAULT_TCP_PORT: u16 = 502;

//! The UMDT engine.
//!
//! Leaves first: frame codec and PDU handling, then transports and the bus
//! coordinator, then the three tools built on top of them (client engine,
//! mock server, bridge) and the cross-cutting services (event bus, PCAP
//! capture, script hooks, sniffer, transaction log).

pub mod bridge;
pub mod bus;
pub mod client;
pub mod decoding;
pub mod encoding;
pub mod events;
pub mod frame;
pub mod pcap;
pub mod pdu;
pub mod prober;
pub mod script;
pub mod server;
pub mod sniffer;
pub mod translog;
pub mod transport;

//! PCAP capture for forensic logging
//!
//! Standard libpcap files with link type `DLT_USER0` (147), so raw Modbus
//! frames land in Wireshark without fake Ethernet/IP headers. Every record
//! body starts with a 4-byte UMDT metadata prefix:
//!
//! - byte 0: direction (0 = unknown, 1 = inbound, 2 = outbound)
//! - byte 1: protocol hint (0 = unknown, 1 = Modbus RTU, 2 = Modbus TCP)
//! - bytes 2-3: reserved, zero
//!
//! Writes are flushed record-by-record so a crash loses at most the frame in
//! flight.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::core::frame::ModbusMode;
use crate::utils::error::Result;

const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN: u32 = 65535;

/// libpcap link type reserved for user-defined protocols.
pub const DLT_USER0: u32 = 147;

/// Packet direction stored in metadata byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Unknown = 0,
    /// Request from master / upstream
    Inbound = 1,
    /// Response from slave / downstream
    Outbound = 2,
}

/// Protocol hint stored in metadata byte 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolHint {
    Unknown = 0,
    ModbusRtu = 1,
    ModbusTcp = 2,
}

impl From<ModbusMode> for ProtocolHint {
    fn from(mode: ModbusMode) -> Self {
        match mode {
            ModbusMode::Rtu => ProtocolHint::ModbusRtu,
            ModbusMode::Tcp => ProtocolHint::ModbusTcp,
        }
    }
}

#[derive(Debug)]
struct WriterState {
    file: File,
    packet_count: u64,
    bytes_written: u64,
}

/// Append-only PCAP writer. All writes go through one mutex whose hold time
/// is bounded to a single write + flush.
#[derive(Debug)]
pub struct PcapWriter {
    path: PathBuf,
    state: Mutex<WriterState>,
}

impl PcapWriter {
    /// Create (truncate) `path` and write the global header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::create(&path)?;

        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
        header.extend_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
        header.extend_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // thiszone (GMT)
        header.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        header.extend_from_slice(&PCAP_SNAPLEN.to_le_bytes());
        header.extend_from_slice(&DLT_USER0.to_le_bytes());
        file.write_all(&header)?;
        file.flush()?;

        tracing::debug!("[Pcap] opened {} (DLT_USER0)", path.display());
        Ok(Self {
            path,
            state: Mutex::new(WriterState {
                file,
                packet_count: 0,
                bytes_written: 24,
            }),
        })
    }

    /// Append one record: metadata prefix + frame bytes, flushed.
    pub async fn write_packet(
        &self,
        data: &[u8],
        direction: Direction,
        protocol: ProtocolHint,
    ) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let ts_sec = now.as_secs() as u32;
        let ts_usec = now.subsec_micros();

        let full_len = 4 + data.len();
        let captured = full_len.min(PCAP_SNAPLEN as usize);

        let mut record = Vec::with_capacity(16 + captured);
        record.extend_from_slice(&ts_sec.to_le_bytes());
        record.extend_from_slice(&ts_usec.to_le_bytes());
        record.extend_from_slice(&(captured as u32).to_le_bytes());
        record.extend_from_slice(&(full_len as u32).to_le_bytes());
        record.push(direction as u8);
        record.push(protocol as u8);
        record.push(0);
        record.push(0);
        record.extend_from_slice(&data[..captured - 4]);

        let mut state = self.state.lock().await;
        state.file.write_all(&record)?;
        state.file.flush()?;
        state.packet_count += 1;
        state.bytes_written += record.len() as u64;
        Ok(())
    }

    /// Number of records written so far.
    pub async fn packet_count(&self) -> u64 {
        self.state.lock().await.packet_count
    }

    /// Total bytes written including headers.
    pub async fn bytes_written(&self) -> u64 {
        self.state.lock().await.bytes_written
    }

    /// Path of the capture file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Two independent writers for the bridge: one per side of the relay.
#[derive(Debug)]
pub struct DualPcap {
    /// master <-> bridge traffic
    pub upstream: Option<PcapWriter>,
    /// bridge <-> slave traffic
    pub downstream: Option<PcapWriter>,
}

impl DualPcap {
    /// Open whichever sides have paths configured.
    pub fn open(
        upstream_path: Option<&Path>,
        downstream_path: Option<&Path>,
    ) -> Result<Self> {
        Ok(Self {
            upstream: upstream_path.map(PcapWriter::create).transpose()?,
            downstream: downstream_path.map(PcapWriter::create).transpose()?,
        })
    }

    pub async fn log_upstream(
        &self,
        data: &[u8],
        direction: Direction,
        protocol: ProtocolHint,
    ) {
        if let Some(writer) = &self.upstream {
            if let Err(e) = writer.write_packet(data, direction, protocol).await {
                tracing::warn!("[Pcap] upstream write failed: {}", e);
            }
        }
    }

    pub async fn log_downstream(
        &self,
        data: &[u8],
        direction: Direction,
        protocol: ProtocolHint,
    ) {
        if let Some(writer) = &self.downstream {
            if let Err(e) = writer.write_packet(data, direction, protocol).await {
                tracing::warn!("[Pcap] downstream write failed: {}", e);
            }
        }
    }
}

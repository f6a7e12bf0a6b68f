//! Passive RTU sniffer
//!
//! Reassembles Modbus RTU frames from a raw byte stream captured off a
//! shared RS-485 bus, where frame boundaries are unknown and the capture
//! may join mid-frame. A sliding window tries candidate start positions:
//! plausible unit id, candidate lengths from the function-code table, CRC
//! confirmation. On success the frame is consumed; on failure the window
//! advances one byte. A traffic analyzer pairs read requests with their
//! responses and parses writes to maintain a shadow image of the bus's
//! register state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::events::{EventBus, EventKind};
use crate::core::frame::{self, CapturedFrame, MAX_RTU_FRAME};
use crate::core::pdu::DataKind;
use crate::core::transport::PassiveTransport;
use crate::utils::error::UmdtError;

/// Highest legal unit id; anything above cannot start a frame.
const MAX_UNIT_ID: u8 = 247;

/// Buffer growth limit before the oldest byte is forced out.
const STALL_LIMIT: usize = MAX_RTU_FRAME + 4;

/// Heuristic decoder for continuous RTU byte streams.
#[derive(Debug, Default)]
pub struct SlidingWindowDecoder {
    buffer: Vec<u8>,
}

impl SlidingWindowDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed captured bytes.
    pub fn ingest(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes currently buffered.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Extract every CRC-confirmed frame currently decodable.
    pub fn parse(&mut self) -> Vec<CapturedFrame> {
        let mut frames = Vec::new();

        while self.buffer.len() >= 4 {
            if self.buffer[0] > MAX_UNIT_ID {
                self.buffer.remove(0);
                continue;
            }

            let candidates = frame::candidate_rtu_lens(&self.buffer);
            let mut matched = false;
            let mut awaiting_bytes = false;

            for len in &candidates {
                if *len > self.buffer.len() {
                    awaiting_bytes = true;
                    continue;
                }
                let candidate = frame::decode_rtu(&self.buffer[..*len]);
                if candidate.crc_valid {
                    debug!(
                        "[Sniffer] frame: unit={} fc=0x{:02X} len={}",
                        candidate.unit_id, candidate.function, len
                    );
                    frames.push(candidate);
                    self.buffer.drain(..*len);
                    matched = true;
                    break;
                }
            }

            if matched {
                continue;
            }
            if awaiting_bytes {
                // A plausible long frame is still arriving; but a garbage
                // start byte must not wedge the decoder forever.
                if self.buffer.len() > STALL_LIMIT {
                    self.buffer.remove(0);
                    continue;
                }
                break;
            }
            // Unknown function code or every candidate failed CRC: slide.
            self.buffer.remove(0);
        }

        frames
    }
}

/// A register/coil value inferred from observed traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub unit_id: u8,
    pub kind: DataKind,
    pub address: u16,
    pub value: u16,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct PendingRead {
    function: u8,
    address: u16,
    count: u16,
}

/// Maintains a shadow state of bus devices by matching read
/// requests/responses and parsing writes.
#[derive(Debug, Default)]
pub struct TrafficAnalyzer {
    pending_reads: HashMap<u8, PendingRead>,
}

impl TrafficAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest one CRC-valid frame.
    pub fn process(&mut self, frame: &CapturedFrame) -> Vec<StateUpdate> {
        if !frame.crc_valid || frame.raw.len() < 4 {
            return Vec::new();
        }
        let now = Utc::now();
        let unit = frame.unit_id;
        let fc = frame.function;
        let payload = &frame.payload;
        let mut updates = Vec::new();

        match fc {
            0x01..=0x04 => {
                if frame.raw.len() == 8 && payload.len() == 4 {
                    // Request: remember what was asked
                    self.pending_reads.insert(
                        unit,
                        PendingRead {
                            function: fc,
                            address: u16::from_be_bytes([payload[0], payload[1]]),
                            count: u16::from_be_bytes([payload[2], payload[3]]),
                        },
                    );
                } else if let Some(pending) = self.pending_reads.remove(&unit) {
                    // Response: decode against the matching request
                    if pending.function == fc && !payload.is_empty() {
                        let byte_count = payload[0] as usize;
                        if payload.len() >= 1 + byte_count {
                            let data = &payload[1..1 + byte_count];
                            updates.extend(Self::decode_read(&pending, unit, data, now));
                        }
                    }
                }
            }
            0x05 if payload.len() >= 4 => {
                let address = u16::from_be_bytes([payload[0], payload[1]]);
                let raw = u16::from_be_bytes([payload[2], payload[3]]);
                updates.push(StateUpdate {
                    unit_id: unit,
                    kind: DataKind::Coil,
                    address,
                    value: u16::from(raw == 0xFF00),
                    timestamp: now,
                });
            }
            0x06 if payload.len() >= 4 => {
                let address = u16::from_be_bytes([payload[0], payload[1]]);
                let value = u16::from_be_bytes([payload[2], payload[3]]);
                updates.push(StateUpdate {
                    unit_id: unit,
                    kind: DataKind::Holding,
                    address,
                    value,
                    timestamp: now,
                });
            }
            0x0F if frame.raw.len() > 8 && payload.len() >= 5 => {
                let address = u16::from_be_bytes([payload[0], payload[1]]);
                let count = u16::from_be_bytes([payload[2], payload[3]]) as usize;
                let byte_count = payload[4] as usize;
                if payload.len() >= 5 + byte_count {
                    let bits =
                        crate::core::pdu::unpack_bits(&payload[5..5 + byte_count], count);
                    for (i, bit) in bits.iter().enumerate() {
                        updates.push(StateUpdate {
                            unit_id: unit,
                            kind: DataKind::Coil,
                            address: address.wrapping_add(i as u16),
                            value: u16::from(*bit),
                            timestamp: now,
                        });
                    }
                }
            }
            0x10 if frame.raw.len() > 8 && payload.len() >= 5 => {
                let address = u16::from_be_bytes([payload[0], payload[1]]);
                let byte_count = payload[4] as usize;
                if payload.len() >= 5 + byte_count {
                    let values = crate::core::pdu::bytes_to_registers(
                        &payload[5..5 + byte_count],
                    );
                    for (i, value) in values.iter().enumerate() {
                        updates.push(StateUpdate {
                            unit_id: unit,
                            kind: DataKind::Holding,
                            address: address.wrapping_add(i as u16),
                            value: *value,
                            timestamp: now,
                        });
                    }
                }
            }
            _ => {}
        }

        updates
    }

    fn decode_read(
        pending: &PendingRead,
        unit: u8,
        data: &[u8],
        now: DateTime<Utc>,
    ) -> Vec<StateUpdate> {
        let mut updates = Vec::new();
        match pending.function {
            0x01 | 0x02 => {
                let kind = if pending.function == 0x01 {
                    DataKind::Coil
                } else {
                    DataKind::Discrete
                };
                let bits = crate::core::pdu::unpack_bits(data, pending.count as usize);
                for (i, bit) in bits.iter().enumerate() {
                    updates.push(StateUpdate {
                        unit_id: unit,
                        kind,
                        address: pending.address.wrapping_add(i as u16),
                        value: u16::from(*bit),
                        timestamp: now,
                    });
                }
            }
            0x03 | 0x04 => {
                let kind = if pending.function == 0x03 {
                    DataKind::Holding
                } else {
                    DataKind::Input
                };
                let values = crate::core::pdu::bytes_to_registers(data);
                for (i, value) in values.iter().take(pending.count as usize).enumerate() {
                    updates.push(StateUpdate {
                        unit_id: unit,
                        kind,
                        address: pending.address.wrapping_add(i as u16),
                        value: *value,
                        timestamp: now,
                    });
                }
            }
            _ => {}
        }
        updates
    }
}

/// Passive bus listener: decoder + analyzer over a passive transport.
pub struct Sniffer {
    frames_rx: mpsc::Receiver<(CapturedFrame, Vec<StateUpdate>)>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Sniffer {
    /// Start sniffing. Frames and their inferred state updates arrive on
    /// the returned handle; everything is also mirrored to `events`.
    pub fn start(mut transport: PassiveTransport, events: EventBus) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            use crate::core::transport::ModbusTransport;
            let mut decoder = SlidingWindowDecoder::new();
            let mut analyzer = TrafficAnalyzer::new();
            let idle = std::time::Duration::from_secs(3600);
            info!("[Sniffer] started on {}", transport.describe());

            loop {
                let captured = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    result = transport.receive_frame(idle) => match result {
                        Ok(captured) => captured,
                        Err(UmdtError::Timeout { .. }) => continue,
                        Err(e) => {
                            warn!("[Sniffer] capture error: {}", e);
                            break;
                        }
                    },
                };

                // The transport's gap detection already framed the bytes,
                // but a mid-frame join or collision leaves CRC failures;
                // those go through the sliding-window recovery.
                decoder.ingest(&captured.raw);
                for frame in decoder.parse() {
                    let updates = analyzer.process(&frame);
                    events.publish(
                        EventKind::Request,
                        json!({
                            "sniffed": true,
                            "unit": frame.unit_id,
                            "function": frame.function,
                            "raw": hex::encode_upper(&frame.raw),
                            "updates": updates.len(),
                        }),
                    );
                    if frames_tx.send((frame, updates)).await.is_err() {
                        return;
                    }
                }
            }
            let _ = transport.close().await;
        });

        Self {
            frames_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Next reassembled frame with its state updates.
    pub async fn next(&mut self) -> Option<(CapturedFrame, Vec<StateUpdate>)> {
        self.frames_rx.recv().await
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
        let _ = self.task.await;
    }
}

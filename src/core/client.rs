//! Modbus client engine
//!
//! Read/write/monitor/scan operations over one transport, serialized through
//! the bus coordinator. User-initiated commands acquire the bus at operator
//! priority; the periodic monitor runs as a scanner and yields to them.
//! Every operation emits request/response/error events, and frame errors
//! carry the raw bytes so a front-end can show exactly what the wire said.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::bus::{BusCoordinator, BusPriority};
use crate::core::decoding::{self, DecodingResult, Endian, EndianMode};
use crate::core::encoding::{self, EncodedValue};
use crate::core::events::{EventBus, EventKind};
use crate::core::frame::{self, CapturedFrame, ModbusMode};
use crate::core::pdu::{self, DataKind, ExceptionCode, FunctionCode, MAX_REGISTERS_PER_REQUEST};
use crate::core::transport::{self, Endpoint, ModbusTransport, TransportOptions};
use crate::utils::error::{Result, UmdtError};

/// Parameters for a read operation.
///
/// `count` is the number of *logical values*; with `long` set each value
/// spans two registers.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub unit: u8,
    pub kind: DataKind,
    pub address: u16,
    pub count: u16,
    pub long: bool,
    pub endian: EndianMode,
}

impl ReadRequest {
    pub fn registers(unit: u8, kind: DataKind, address: u16, count: u16) -> Self {
        Self {
            unit,
            kind,
            address,
            count,
            long: false,
            endian: EndianMode::One(Endian::Big),
        }
    }

    pub fn long(mut self) -> Self {
        self.long = true;
        self
    }

    pub fn endian(mut self, endian: EndianMode) -> Self {
        self.endian = endian;
        self
    }

    /// Registers (or bits) actually requested on the wire.
    fn wire_quantity(&self) -> u16 {
        if self.long && !self.kind.is_bit() {
            self.count.saturating_mul(2)
        } else {
            self.count
        }
    }
}

/// Result of a read: raw registers/bits plus per-value decodings.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub registers: Vec<u16>,
    pub bits: Vec<bool>,
    /// One decoding table per logical value (registers only)
    pub decoded: Vec<DecodingResult>,
    pub raw: Vec<u8>,
}

/// What to write.
#[derive(Debug, Clone)]
pub enum WriteValue {
    /// Operator text input, normalized per the encoding rules
    Text(String),
    /// Pre-encoded registers
    Registers(Vec<u16>),
    Coil(bool),
    Coils(Vec<bool>),
}

/// Parameters for a write operation.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub unit: u8,
    pub kind: DataKind,
    pub address: u16,
    pub value: WriteValue,
    pub long: bool,
    pub signed: bool,
    pub float: bool,
    pub endian: Endian,
}

impl WriteRequest {
    pub fn register_text(unit: u8, address: u16, text: impl Into<String>) -> Self {
        Self {
            unit,
            kind: DataKind::Holding,
            address,
            value: WriteValue::Text(text.into()),
            long: false,
            signed: false,
            float: false,
            endian: Endian::Big,
        }
    }

    pub fn coil(unit: u8, address: u16, value: bool) -> Self {
        Self {
            unit,
            kind: DataKind::Coil,
            address,
            value: WriteValue::Coil(value),
            long: false,
            signed: false,
            float: false,
            endian: Endian::Big,
        }
    }

    pub fn long(mut self) -> Self {
        self.long = true;
        self
    }

    pub fn float(mut self) -> Self {
        self.float = true;
        self
    }

    pub fn endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }
}

/// Result of a write, echoing the pre-flight interpretation.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub function: FunctionCode,
    pub registers: Vec<u16>,
    pub interpretation: String,
}

/// One monitor tick.
#[derive(Debug, Clone)]
pub struct MonitorSample {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub result: std::result::Result<ReadOutcome, UmdtError>,
}

/// Handle on a running monitor; dropping it stops the stream.
pub struct MonitorHandle {
    pub rx: mpsc::Receiver<MonitorSample>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Receive the next sample.
    pub async fn next(&mut self) -> Option<MonitorSample> {
        self.rx.recv().await
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Address/value pair found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHit {
    pub address: u16,
    pub value: u16,
}

/// Transport-abstracted Modbus client.
#[derive(Clone)]
pub struct ClientEngine {
    transport: Arc<Mutex<Box<dyn ModbusTransport>>>,
    bus: Arc<BusCoordinator>,
    events: EventBus,
    next_txn: Arc<AtomicU16>,
    response_timeout: Duration,
}

impl ClientEngine {
    /// Open a transport for `endpoint` and wrap it.
    pub async fn connect(endpoint: Endpoint, response_timeout: Duration) -> Result<Self> {
        let options = TransportOptions::default().with_response_timeout(response_timeout);
        let t = transport::connect(&endpoint, options).await?;
        let engine = Self::from_transport(t, response_timeout);
        engine.events.publish(
            EventKind::Connection,
            json!({"endpoint": endpoint.describe(), "state": "open"}),
        );
        Ok(engine)
    }

    /// Wrap an already-open transport.
    pub fn from_transport(transport: Box<dyn ModbusTransport>, response_timeout: Duration) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            bus: BusCoordinator::new(),
            events: EventBus::default(),
            next_txn: Arc::new(AtomicU16::new(1)),
            response_timeout,
        }
    }

    /// The diagnostic event stream shared by all operations.
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// The bus coordinator guarding this client's transport.
    pub fn bus(&self) -> Arc<BusCoordinator> {
        Arc::clone(&self.bus)
    }

    pub async fn close(&self) -> Result<()> {
        let result = self.transport.lock().await.close().await;
        self.events
            .publish(EventKind::Connection, json!({"state": "closed"}));
        result
    }

    // ========================================================================
    // Core exchange
    // ========================================================================

    /// One request/response exchange under the bus guard.
    async fn exchange(
        &self,
        unit: u8,
        request_pdu: Vec<u8>,
        priority: BusPriority,
    ) -> Result<CapturedFrame> {
        let _guard = self.bus.acquire(priority).await;
        let mut transport = self.transport.lock().await;

        let txn = self.next_txn.fetch_add(1, Ordering::Relaxed);
        let mode = transport.mode();
        let wire = frame::build_frame(mode, unit, request_pdu, txn);

        self.events.publish(
            EventKind::Request,
            json!({"unit": unit, "raw": hex::encode_upper(&wire)}),
        );
        transport.send(&wire).await?;

        let deadline = Instant::now() + self.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(UmdtError::timeout(self.response_timeout));
            }
            let captured = transport.receive_frame(remaining).await?;

            if !captured.valid {
                self.events.publish(
                    EventKind::Error,
                    json!({
                        "detail": "frame error",
                        "reason": captured.reason,
                        "raw": hex::encode_upper(&captured.raw),
                    }),
                );
                return Err(captured.into_error());
            }

            // Stale TCP replies (previous transaction) are skipped
            if mode == ModbusMode::Tcp {
                if let Some(rx_txn) = captured.transaction_id {
                    if rx_txn != txn {
                        warn!(
                            "[Client] ignoring stale transaction {} (expected {})",
                            rx_txn, txn
                        );
                        continue;
                    }
                }
            }

            self.events.publish(
                EventKind::Response,
                json!({
                    "unit": captured.unit_id,
                    "function": captured.function,
                    "raw": hex::encode_upper(&captured.raw),
                }),
            );
            return Ok(captured);
        }
    }

    fn check_exception(captured: &CapturedFrame) -> Result<()> {
        if let Some(code) = captured.exception_code() {
            debug!(
                "[Client] exception 0x{:02X} ({})",
                code,
                ExceptionCode::describe(code)
            );
            return Err(UmdtError::Exception(code));
        }
        Ok(())
    }

    // ========================================================================
    // Read
    // ========================================================================

    pub async fn read(&self, request: ReadRequest) -> Result<ReadOutcome> {
        self.read_with_priority(request, BusPriority::Operator).await
    }

    async fn read_with_priority(
        &self,
        request: ReadRequest,
        priority: BusPriority,
    ) -> Result<ReadOutcome> {
        let quantity = request.wire_quantity();
        if quantity == 0 {
            return Err(UmdtError::invalid("count must be at least 1"));
        }
        if !request.kind.is_bit() && quantity > MAX_REGISTERS_PER_REQUEST {
            return Err(UmdtError::invalid(format!(
                "{quantity} registers exceeds the Modbus limit of {MAX_REGISTERS_PER_REQUEST} per request"
            )));
        }
        if request.kind.is_bit() && quantity > pdu::MAX_COILS_PER_REQUEST {
            return Err(UmdtError::invalid(format!(
                "{quantity} coils exceeds the Modbus limit of {} per request",
                pdu::MAX_COILS_PER_REQUEST
            )));
        }
        if request.address as u32 + quantity as u32 > 0x1_0000 {
            return Err(UmdtError::invalid("address range exceeds 65535"));
        }

        let fc = request.kind.read_function();
        let request_pdu = pdu::build_read_request(fc, request.address, quantity);
        let captured = self.exchange(request.unit, request_pdu, priority).await?;
        Self::check_exception(&captured)?;

        if request.kind.is_bit() {
            let byte_count = *captured.payload.first().unwrap_or(&0) as usize;
            if captured.payload.len() < 1 + byte_count {
                return Err(captured.into_error());
            }
            let bits = pdu::unpack_bits(&captured.payload[1..1 + byte_count], quantity as usize);
            return Ok(ReadOutcome {
                registers: Vec::new(),
                bits,
                decoded: Vec::new(),
                raw: captured.raw,
            });
        }

        let byte_count = *captured.payload.first().unwrap_or(&0) as usize;
        if captured.payload.len() < 1 + byte_count {
            return Err(captured.into_error());
        }
        let registers = pdu::bytes_to_registers(&captured.payload[1..1 + byte_count]);

        let per_value = if request.long { 2 } else { 1 };
        let decoded = registers
            .chunks(per_value)
            .map(|chunk| decoding::decode_registers(chunk, request.long, request.endian))
            .collect();

        Ok(ReadOutcome {
            registers,
            bits: Vec::new(),
            decoded,
            raw: captured.raw,
        })
    }

    // ========================================================================
    // Write
    // ========================================================================

    pub async fn write(&self, request: WriteRequest) -> Result<WriteOutcome> {
        if !request.kind.is_writable() {
            return Err(UmdtError::invalid(format!(
                "{} registers are read-only",
                request.kind.label()
            )));
        }

        // Coil paths first; they carry no numeric encoding.
        match &request.value {
            WriteValue::Coil(value) => {
                let raw = if *value { 0xFF00 } else { 0x0000 };
                let request_pdu = pdu::build_write_single_request(
                    FunctionCode::WriteSingleCoil,
                    request.address,
                    raw,
                );
                self.emit_preflight(&request, &[raw], &format!("{value}"));
                let captured = self
                    .exchange(request.unit, request_pdu, BusPriority::Operator)
                    .await?;
                Self::check_exception(&captured)?;
                return Ok(WriteOutcome {
                    function: FunctionCode::WriteSingleCoil,
                    registers: vec![raw],
                    interpretation: format!("{value}"),
                });
            }
            WriteValue::Coils(values) => {
                let request_pdu =
                    pdu::build_write_multiple_coils_request(request.address, values);
                self.emit_preflight(&request, &[], &format!("{} coils", values.len()));
                let captured = self
                    .exchange(request.unit, request_pdu, BusPriority::Operator)
                    .await?;
                Self::check_exception(&captured)?;
                return Ok(WriteOutcome {
                    function: FunctionCode::WriteMultipleCoils,
                    registers: Vec::new(),
                    interpretation: format!("{} coils", values.len()),
                });
            }
            _ => {}
        }

        let encoded: EncodedValue = match &request.value {
            WriteValue::Text(text) => encoding::encode_value(
                text,
                request.long,
                request.endian,
                request.float,
                request.signed,
            )?,
            WriteValue::Registers(regs) => EncodedValue {
                registers: regs.clone(),
                signed: request.signed,
                float: request.float,
                interpretation: format!("{regs:?}"),
            },
            WriteValue::Coil(_) | WriteValue::Coils(_) => unreachable!("handled above"),
        };

        if encoded.registers.len() > MAX_REGISTERS_PER_REQUEST as usize {
            return Err(UmdtError::invalid("write exceeds 125 registers"));
        }
        if request.address as u32 + encoded.registers.len() as u32 > 0x1_0000 {
            return Err(UmdtError::invalid("address range exceeds 65535"));
        }

        self.emit_preflight(&request, &encoded.registers, &encoded.interpretation);

        let (function, request_pdu) = if encoded.registers.len() == 1 {
            (
                FunctionCode::WriteSingleRegister,
                pdu::build_write_single_request(
                    FunctionCode::WriteSingleRegister,
                    request.address,
                    encoded.registers[0],
                ),
            )
        } else {
            (
                FunctionCode::WriteMultipleRegisters,
                pdu::build_write_multiple_registers_request(request.address, &encoded.registers),
            )
        };

        let captured = self
            .exchange(request.unit, request_pdu, BusPriority::Operator)
            .await?;
        Self::check_exception(&captured)?;

        Ok(WriteOutcome {
            function,
            registers: encoded.registers,
            interpretation: encoded.interpretation,
        })
    }

    fn emit_preflight(&self, request: &WriteRequest, registers: &[u16], interpretation: &str) {
        self.events.publish(
            EventKind::Request,
            json!({
                "preflight": true,
                "unit": request.unit,
                "address": request.address,
                "bytes_per_register": 2,
                "registers": registers,
                "interpretation": interpretation,
            }),
        );
    }

    // ========================================================================
    // Monitor
    // ========================================================================

    /// Repeat `request` every `interval`, compensating sleep drift against a
    /// wall-clock anchor so mean cadence matches the interval. Failures
    /// surface as error samples/events; the stream ends only when the
    /// transport closes or the handle is dropped.
    pub fn monitor(&self, request: ReadRequest, interval: Duration) -> MonitorHandle {
        let engine = self.clone();
        let (tx, rx) = mpsc::channel(32);

        let task = tokio::spawn(async move {
            let anchor = Instant::now();
            let mut sequence: u64 = 0;
            loop {
                sequence += 1;
                let target = anchor + interval.saturating_mul(sequence as u32);
                tokio::time::sleep_until(target).await;

                let result = engine
                    .read_with_priority(request.clone(), BusPriority::Scanner)
                    .await;

                let closed_transport = matches!(&result, Err(UmdtError::Transport(_)));
                if let Err(e) = &result {
                    engine.events.publish(
                        EventKind::Error,
                        json!({"monitor": true, "detail": e.to_string()}),
                    );
                }

                let sample = MonitorSample {
                    sequence,
                    timestamp: Utc::now(),
                    result,
                };
                if tx.send(sample).await.is_err() {
                    break;
                }
                if closed_transport {
                    break;
                }
            }
        });

        MonitorHandle { rx, task }
    }

    // ========================================================================
    // Scan
    // ========================================================================

    /// Read every address in `[start, end]`, batched up to the request
    /// limit. `IllegalDataAddress` replies are silently skipped; all other
    /// failures surface.
    pub async fn scan(
        &self,
        unit: u8,
        kind: DataKind,
        start: u16,
        end: u16,
    ) -> Result<Vec<ScanHit>> {
        if start > end {
            return Err(UmdtError::invalid("scan start must be <= end"));
        }

        let mut hits = Vec::new();
        let mut address = start as u32;
        let end = end as u32;
        let batch = MAX_REGISTERS_PER_REQUEST as u32;

        while address <= end {
            let count = batch.min(end - address + 1) as u16;
            let request = ReadRequest {
                unit,
                kind,
                address: address as u16,
                count,
                long: false,
                endian: EndianMode::One(Endian::Big),
            };
            match self.read_with_priority(request, BusPriority::Operator).await {
                Ok(outcome) => {
                    if kind.is_bit() {
                        for (i, bit) in outcome.bits.iter().enumerate() {
                            hits.push(ScanHit {
                                address: (address as u16).wrapping_add(i as u16),
                                value: u16::from(*bit),
                            });
                        }
                    } else {
                        for (i, reg) in outcome.registers.iter().enumerate() {
                            hits.push(ScanHit {
                                address: (address as u16).wrapping_add(i as u16),
                                value: *reg,
                            });
                        }
                    }
                }
                // Unmapped ranges answer IllegalDataAddress; fall back to
                // one-by-one so partially mapped batches still report.
                Err(UmdtError::Exception(code))
                    if code == u8::from(ExceptionCode::IllegalDataAddress) =>
                {
                    if count > 1 {
                        for single in address..address + count as u32 {
                            let request = ReadRequest {
                                unit,
                                kind,
                                address: single as u16,
                                count: 1,
                                long: false,
                                endian: EndianMode::One(Endian::Big),
                            };
                            match self
                                .read_with_priority(request, BusPriority::Operator)
                                .await
                            {
                                Ok(outcome) => {
                                    let value = if kind.is_bit() {
                                        u16::from(outcome.bits.first().copied().unwrap_or(false))
                                    } else {
                                        outcome.registers.first().copied().unwrap_or(0)
                                    };
                                    hits.push(ScanHit {
                                        address: single as u16,
                                        value,
                                    });
                                }
                                Err(UmdtError::Exception(code))
                                    if code == u8::from(ExceptionCode::IllegalDataAddress) => {}
                                Err(e) => return Err(e),
                            }
                        }
                    }
                }
                Err(e) => return Err(e),
            }
            address += count as u32;
        }

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_wire_quantity() {
        let req = ReadRequest::registers(1, DataKind::Holding, 0, 3);
        assert_eq!(req.wire_quantity(), 3);
        assert_eq!(req.clone().long().wire_quantity(), 6);
        let bits = ReadRequest::registers(1, DataKind::Coil, 0, 3).long();
        assert_eq!(bits.wire_quantity(), 3);
    }

    #[tokio::test]
    async fn test_read_rejects_over_limit() {
        // A transport that never gets used: validation fails first.
        struct NeverTransport;
        #[async_trait::async_trait]
        impl ModbusTransport for NeverTransport {
            async fn open(&mut self) -> Result<()> {
                Ok(())
            }
            async fn close(&mut self) -> Result<()> {
                Ok(())
            }
            async fn send(&mut self, _data: &[u8]) -> Result<()> {
                panic!("send should not be reached")
            }
            async fn receive_frame(&mut self, _t: Duration) -> Result<CapturedFrame> {
                panic!("receive should not be reached")
            }
            fn is_open(&self) -> bool {
                true
            }
            fn mode(&self) -> ModbusMode {
                ModbusMode::Tcp
            }
            fn describe(&self) -> String {
                "never".into()
            }
        }

        let engine =
            ClientEngine::from_transport(Box::new(NeverTransport), Duration::from_millis(100));
        let err = engine
            .read(ReadRequest::registers(1, DataKind::Holding, 0, 126))
            .await
            .unwrap_err();
        assert!(matches!(err, UmdtError::InvalidArgument(_)));

        // 63 long values = 126 registers
        let err = engine
            .read(ReadRequest::registers(1, DataKind::Holding, 0, 63).long())
            .await
            .unwrap_err();
        assert!(matches!(err, UmdtError::InvalidArgument(_)));

        let err = engine
            .read(ReadRequest::registers(1, DataKind::Holding, 65500, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, UmdtError::InvalidArgument(_)));

        let err = engine
            .write(WriteRequest {
                unit: 1,
                kind: DataKind::Input,
                address: 0,
                value: WriteValue::Text("1".into()),
                long: false,
                signed: false,
                float: false,
                endian: Endian::Big,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UmdtError::InvalidArgument(_)));
    }
}

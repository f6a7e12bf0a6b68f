//! Modbus RTU serial transport
//!
//! A `tokio-serial` stream with RTU frame delimiting: bytes accumulate until
//! the line goes quiet for the inter-byte timeout (3.5 character times,
//! floored at 1.75 ms), which declares the frame boundary. The known-length
//! table short-circuits the wait for well-formed responses.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use crate::core::frame::{self, CapturedFrame, ModbusMode, MAX_RTU_FRAME};
use crate::core::transport::{Endpoint, ModbusTransport, Parity, TransportOptions};
use crate::utils::error::{Result, UmdtError};

/// Serial transport for RTU-framed Modbus.
pub struct SerialTransport {
    endpoint: Endpoint,
    options: TransportOptions,
    inter_byte: Duration,
    stream: Option<SerialStream>,
    /// When set, the length predictor treats inbound traffic as responses
    /// (client side); otherwise as requests (server side).
    expect_responses: bool,
}

impl SerialTransport {
    pub fn new(endpoint: Endpoint, options: TransportOptions) -> Result<Self> {
        let inter_byte = match &endpoint {
            Endpoint::Serial {
                baud,
                inter_byte_timeout_us,
                ..
            } => inter_byte_timeout_us
                .map(Duration::from_micros)
                .unwrap_or_else(|| frame::rtu_inter_frame_gap(*baud)),
            Endpoint::Tcp { .. } => {
                return Err(UmdtError::invalid(
                    "serial transport requires a serial endpoint",
                ))
            }
        };
        Ok(Self {
            endpoint,
            options,
            inter_byte,
            stream: None,
            expect_responses: true,
        })
    }

    /// Switch the length predictor to request shapes (server/listener side).
    pub fn expecting_requests(mut self) -> Self {
        self.expect_responses = false;
        self
    }

    /// The configured inter-byte gap.
    pub fn inter_byte_timeout(&self) -> Duration {
        self.inter_byte
    }
}

#[async_trait]
impl ModbusTransport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let (path, baud, parity, data_bits, stop_bits) = match &self.endpoint {
            Endpoint::Serial {
                path,
                baud,
                parity,
                data_bits,
                stop_bits,
                ..
            } => (path.clone(), *baud, *parity, *data_bits, *stop_bits),
            Endpoint::Tcp { .. } => unreachable!("checked in new"),
        };

        let parity = match parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        };
        let data_bits = match data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let stream = tokio_serial::new(&path, baud)
            .parity(parity)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .timeout(self.options.response_timeout)
            .open_native_async()
            .map_err(|e| UmdtError::transport(format!("failed to open {path}: {e}")))?;

        info!(
            "[SerialTransport] opened {} (gap {:?})",
            self.endpoint.describe(),
            self.inter_byte
        );
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            debug!("[SerialTransport] closed {}", self.endpoint.describe());
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| UmdtError::transport("serial transport not open"))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| UmdtError::transport(format!("serial send error: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| UmdtError::transport(format!("serial flush error: {e}")))?;
        debug!("[SerialTransport] TX {}B: {}", data.len(), hex::encode_upper(data));
        Ok(())
    }

    async fn receive_frame(&mut self, overall: Duration) -> Result<CapturedFrame> {
        let inter_byte = self.inter_byte;
        let predicted = |buf: &[u8], expect_responses: bool| {
            if expect_responses {
                frame::expected_rtu_response_len(buf)
            } else {
                frame::expected_rtu_request_len(buf)
            }
        };
        let expect_responses = self.expect_responses;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| UmdtError::transport("serial transport not open"))?;

        let deadline = Instant::now() + overall;
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            // Until the first byte arrives, wait up to the overall deadline;
            // afterwards the inter-byte gap delimits the frame.
            let wait = if buf.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                inter_byte
            };
            if wait.is_zero() && buf.is_empty() {
                return Err(UmdtError::timeout(overall));
            }

            match timeout(wait, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    // Port vanished (USB unplug); surface what we have.
                    if buf.is_empty() {
                        return Err(UmdtError::transport("serial port closed"));
                    }
                    return Ok(frame::decode_rtu(&buf));
                }
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.len() > MAX_RTU_FRAME {
                        return Ok(frame::decode_rtu(&buf));
                    }
                    // Known-length shortcut: no need to wait out the gap
                    if let Some(len) = predicted(&buf, expect_responses) {
                        if buf.len() >= len {
                            return Ok(frame::decode_rtu(&buf[..len]));
                        }
                    }
                }
                Ok(Err(e)) => {
                    return Err(UmdtError::transport(format!("serial read error: {e}")))
                }
                Err(_) => {
                    if buf.is_empty() {
                        return Err(UmdtError::timeout(overall));
                    }
                    // Gap elapsed: frame boundary
                    return Ok(frame::decode_rtu(&buf));
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn mode(&self) -> ModbusMode {
        ModbusMode::Rtu
    }

    fn describe(&self) -> String {
        format!("serial://{}", self.endpoint.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_serial_endpoint() {
        let err = SerialTransport::new(Endpoint::tcp("h", 1), TransportOptions::default());
        assert!(err.is_err());
    }

    #[test]
    fn test_gap_override() {
        let mut ep = Endpoint::serial("/dev/null", 9600);
        if let Endpoint::Serial {
            inter_byte_timeout_us,
            ..
        } = &mut ep
        {
            *inter_byte_timeout_us = Some(12_000);
        }
        let t = SerialTransport::new(ep, TransportOptions::default()).unwrap();
        assert_eq!(t.inter_byte_timeout(), Duration::from_micros(12_000));
    }

    #[test]
    fn test_gap_derived_from_baud() {
        let t = SerialTransport::new(
            Endpoint::serial("/dev/null", 115_200),
            TransportOptions::default(),
        )
        .unwrap();
        assert_eq!(t.inter_byte_timeout(), Duration::from_micros(1750));
    }
}

//! Modbus TCP transport
//!
//! One `TcpStream` carrying MBAP frames. `receive_frame` reads the 7-byte
//! header and then the body under a single deadline; a stream that stalls or
//! closes mid-frame yields a truncated capture with whatever bytes arrived.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::core::frame::{self, CapturedFrame, ModbusMode, MBAP_HEADER_LEN};
use crate::core::transport::{Endpoint, ModbusTransport, TransportOptions};
use crate::utils::error::{FrameReason, Result, UmdtError};

/// TCP transport for MBAP-framed Modbus.
pub struct TcpTransport {
    endpoint: Endpoint,
    options: TransportOptions,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(endpoint: Endpoint, options: TransportOptions) -> Self {
        Self {
            endpoint,
            options,
            stream: None,
        }
    }

    fn addr(&self) -> String {
        self.endpoint.describe()
    }

    /// Accumulate exactly `want` more bytes into `buf`, bounded by
    /// `deadline`. Returns false when the peer closed before `want` arrived.
    async fn read_until(
        stream: &mut TcpStream,
        buf: &mut Vec<u8>,
        want: usize,
        deadline: Instant,
    ) -> Result<bool> {
        let target = buf.len() + want;
        let mut chunk = [0u8; 512];
        while buf.len() < target {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let max = (target - buf.len()).min(chunk.len());
            match timeout(remaining, stream.read(&mut chunk[..max])).await {
                Ok(Ok(0)) => return Ok(false),
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(UmdtError::transport(format!("TCP read error: {e}"))),
                Err(_) => return Ok(false),
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = self.addr();
        debug!("[TcpTransport] connecting to {}", addr);
        match timeout(self.options.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("[TcpTransport] TCP_NODELAY: {}", e);
                }
                info!("[TcpTransport] connected to {}", addr);
                self.stream = Some(stream);
                Ok(())
            }
            Ok(Err(e)) => Err(UmdtError::transport(format!(
                "failed to connect to {addr}: {e}"
            ))),
            Err(_) => Err(UmdtError::timeout(self.options.connect_timeout)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("[TcpTransport] disconnected from {}", self.addr());
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| UmdtError::transport("TCP transport not open"))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| UmdtError::transport(format!("TCP send error: {e}")))?;
        debug!("[TcpTransport] TX {}B: {}", data.len(), hex::encode_upper(data));
        Ok(())
    }

    async fn receive_frame(&mut self, timeout: Duration) -> Result<CapturedFrame> {
        let addr = self.addr();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| UmdtError::transport("TCP transport not open"))?;
        let deadline = Instant::now() + timeout;
        let mut buf: Vec<u8> = Vec::with_capacity(MBAP_HEADER_LEN + 8);

        let header_done = Self::read_until(stream, &mut buf, MBAP_HEADER_LEN, deadline).await?;
        if !header_done {
            if buf.is_empty() {
                return Err(UmdtError::timeout(timeout));
            }
            warn!(
                "[TcpTransport] truncated header from {}: {}",
                addr,
                hex::encode_upper(&buf)
            );
            return Ok(frame::decode_tcp(&buf));
        }

        let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        let body = length.max(1) - 1;
        let body_done = Self::read_until(stream, &mut buf, body, deadline).await?;
        if !body_done {
            warn!(
                "[TcpTransport] truncated body from {}: {}",
                addr,
                hex::encode_upper(&buf)
            );
            // Permissive decode marks it truncated since the header length
            // promises more bytes than arrived.
            let mut captured = frame::decode_tcp(&buf);
            captured.valid = false;
            captured.crc_valid = false;
            captured.reason = Some(FrameReason::Truncated);
            return Ok(captured);
        }

        debug!("[TcpTransport] RX {}B: {}", buf.len(), hex::encode_upper(&buf));
        Ok(frame::decode_tcp(&buf))
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn mode(&self) -> ModbusMode {
        ModbusMode::Tcp
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener_with(frame_bytes: Vec<u8>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&frame_bytes).await.unwrap();
            // hold the socket open briefly so the client read is clean
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_receive_complete_frame() {
        let frame_bytes = vec![
            0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0A,
        ];
        let addr = listener_with(frame_bytes.clone()).await;

        let mut transport = TcpTransport::new(
            Endpoint::tcp(addr.ip().to_string(), addr.port()),
            TransportOptions::default(),
        );
        transport.open().await.unwrap();
        let captured = transport
            .receive_frame(Duration::from_millis(500))
            .await
            .unwrap();
        assert!(captured.valid);
        assert_eq!(captured.transaction_id, Some(1));
        assert_eq!(captured.raw, frame_bytes);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_truncated_on_close() {
        // Server sends half a frame then closes
        let addr = listener_with(vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03]).await;

        let mut transport = TcpTransport::new(
            Endpoint::tcp(addr.ip().to_string(), addr.port()),
            TransportOptions::default(),
        );
        transport.open().await.unwrap();
        let captured = transport
            .receive_frame(Duration::from_millis(300))
            .await
            .unwrap();
        assert!(!captured.valid);
        assert_eq!(captured.reason, Some(FrameReason::Truncated));
        assert_eq!(captured.raw.len(), 8);
    }

    #[tokio::test]
    async fn test_receive_timeout_when_silent() {
        let addr = listener_with(Vec::new()).await;
        let mut transport = TcpTransport::new(
            Endpoint::tcp(addr.ip().to_string(), addr.port()),
            TransportOptions::default(),
        );
        transport.open().await.unwrap();
        let err = transport
            .receive_frame(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, UmdtError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on localhost is essentially never listening
        let mut transport = TcpTransport::new(
            Endpoint::tcp("127.0.0.1", 1),
            TransportOptions::fast_fail(),
        );
        assert!(transport.open().await.is_err());
        assert!(!transport.is_open());
    }
}

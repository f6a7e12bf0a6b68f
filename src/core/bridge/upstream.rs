//! Bridge upstream listener
//!
//! Accepts Modbus masters. TCP mode serves many concurrent sessions, each
//! with its own decoder; serial mode owns one port. Per session, requests
//! are handled in arrival order and responses leave in the same order.

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::core::bridge::{pipeline, BridgeCore};
use crate::core::events::EventKind;
use crate::core::frame::{self, MBAP_HEADER_LEN};
use crate::core::transport::{ModbusTransport, SerialTransport};
use crate::utils::error::UmdtError;

/// Accept loop for TCP upstream.
pub(crate) async fn run_tcp_listener(
    core: Arc<BridgeCore>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(run_tcp_session(
                        Arc::clone(&core),
                        stream,
                        peer.to_string(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("[Bridge] upstream accept error: {}", e);
                    break;
                }
            },
        }
    }
}

async fn read_mbap_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; MBAP_HEADER_LEN];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut full = header.to_vec();
    if length > 1 {
        let mut body = vec![0u8; length - 1];
        match stream.read_exact(&mut body).await {
            Ok(_) => full.extend_from_slice(&body),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(Some(full)),
            Err(e) => return Err(e),
        }
    }
    Ok(Some(full))
}

/// One master connection.
async fn run_tcp_session(
    core: Arc<BridgeCore>,
    mut stream: TcpStream,
    peer: String,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("[Bridge] master connected: {}", peer);
    core.events
        .publish(EventKind::Connection, json!({"peer": peer, "state": "open"}));

    loop {
        let frame_bytes = tokio::select! {
            _ = shutdown.changed() => break,
            result = read_mbap_frame(&mut stream) => match result {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(e) => {
                    warn!("[Bridge] session {} read error: {}", peer, e);
                    break;
                }
            },
        };

        let captured = frame::decode_tcp(&frame_bytes);
        if let Some(reply) = pipeline::handle_upstream_frame(&core, captured).await {
            if let Err(e) = stream.write_all(&reply).await {
                warn!("[Bridge] session {} write error: {}", peer, e);
                break;
            }
        }
    }

    info!("[Bridge] master disconnected: {}", peer);
    core.events
        .publish(EventKind::Connection, json!({"peer": peer, "state": "closed"}));
}

/// Single-session serial upstream (the bridge acts as an RTU slave).
pub(crate) async fn run_serial_listener(
    core: Arc<BridgeCore>,
    mut transport: SerialTransport,
    mut shutdown: watch::Receiver<bool>,
) {
    let idle = std::time::Duration::from_secs(3600);
    loop {
        let captured = tokio::select! {
            _ = shutdown.changed() => break,
            result = transport.receive_frame(idle) => match result {
                Ok(captured) => captured,
                Err(UmdtError::Timeout { .. }) => continue,
                Err(e) => {
                    warn!("[Bridge] upstream serial error: {}", e);
                    break;
                }
            },
        };

        if let Some(reply) = pipeline::handle_upstream_frame(&core, captured).await {
            if let Err(e) = transport.send(&reply).await {
                warn!("[Bridge] upstream serial write error: {}", e);
                break;
            }
        }
    }
    let _ = transport.close().await;
}

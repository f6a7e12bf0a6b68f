//! Mock-server request dispatch and session loops
//!
//! Each accepted TCP connection (or the single serial port) is a session
//! with its own decoder state; requests are processed in arrival order per
//! session and responses leave in the same order. Dispatch follows one
//! fixed sequence: drop roll, latency, forced exception, script request
//! hooks, rule-aware store access, script response hooks, bit flips.

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::events::EventKind;
use crate::core::frame::{self, CapturedFrame, ModbusMode, MBAP_HEADER_LEN};
use crate::core::pdu::{
    self, DataKind, ExceptionCode, PduRequest, Request, Response, MAX_REGISTERS_PER_REQUEST,
};
use crate::core::script::HookOutcome;
use crate::core::server::ServerCore;
use crate::core::transport::{ModbusTransport, SerialTransport};
use crate::utils::error::UmdtError;

/// Run one decoded frame through dispatch. `None` means no response leaves
/// the server (drop, broadcast, malformed, foreign unit).
pub(crate) async fn dispatch(core: &ServerCore, captured: CapturedFrame) -> Option<Response> {
    if !captured.valid {
        core.events.publish(
            EventKind::Error,
            json!({
                "detail": "malformed frame",
                "reason": captured.reason,
                "raw": hex::encode_upper(&captured.raw),
            }),
        );
        return None;
    }

    let broadcast = captured.unit_id == 0;
    if captured.unit_id != core.unit_id && !broadcast {
        debug!(
            "[MockServer] ignoring frame for unit {} (serving {})",
            captured.unit_id, core.unit_id
        );
        return None;
    }

    let request = Request::from_frame(&captured);
    core.events.publish(
        EventKind::Request,
        json!({
            "unit": request.unit_id,
            "function": request.function,
            "raw": hex::encode_upper(&request.raw),
        }),
    );

    // Fault profile, device and rule generation are pinned for this request.
    let profile = core.faults.profile();
    let device = core.device();
    let rules = device.rules_snapshot();

    if core.faults.should_drop(&profile) {
        debug!("[MockServer] dropped request (fault injection)");
        return None;
    }
    core.faults.apply_latency(&profile).await;

    let mut response = if let Some(code) = core.faults.forced_exception(&profile) {
        Response::exception_for(&request, code)
    } else {
        // Script request hooks may mutate, short-circuit, or drop.
        let request = match core.scripts.server_request(request).await {
            HookOutcome::Forward(request) => request,
            HookOutcome::Exception(code) => {
                let request = Request::from_frame(&captured);
                let response = Response::exception_for(&request, code);
                return finish(core, &profile, response).await;
            }
            HookOutcome::Drop => return None,
        };

        let response = execute(core, &device, &request, &rules).await;

        if broadcast {
            // Broadcast requests are executed but never answered.
            return None;
        }

        match core.scripts.server_response(response).await {
            Some(response) => response,
            None => return None,
        }
    };

    response = match finish(core, &profile, response).await {
        Some(response) => response,
        None => return None,
    };
    Some(response)
}

/// Apply bit flips and emit the response event.
async fn finish(
    core: &ServerCore,
    profile: &crate::core::server::models::FaultProfile,
    mut response: Response,
) -> Option<Response> {
    core.faults.apply_bit_flips(profile, &mut response.payload);
    core.events.publish(
        EventKind::Response,
        json!({
            "unit": response.unit_id,
            "function": response.function,
            "exception": response.exception_code(),
        }),
    );
    Some(response)
}

/// Execute the operation against the pinned store and rules.
async fn execute(
    core: &ServerCore,
    device: &crate::core::server::store::MockDevice,
    request: &Request,
    rules: &crate::core::server::store::RuleMap,
) -> Response {
    let op = match request.operation() {
        Ok(op) => op,
        Err(_) => {
            return Response::exception_for(request, ExceptionCode::IllegalFunction as u8);
        }
    };

    let result = match op {
        PduRequest::ReadBits {
            function,
            start,
            quantity,
        } => {
            if quantity == 0 || quantity > pdu::MAX_COILS_PER_REQUEST {
                Err(UmdtError::Exception(ExceptionCode::IllegalDataValue as u8))
            } else {
                let kind = DataKind::for_function(function.into()).expect("read fc");
                device
                    .read_range(kind, start, quantity, rules)
                    .await
                    .map(|values| {
                        let bits: Vec<bool> = values.iter().map(|&v| v != 0).collect();
                        Response::from_pdu(request, pdu::build_bits_response(function, &bits))
                    })
            }
        }
        PduRequest::ReadRegisters {
            function,
            start,
            quantity,
        } => {
            if quantity == 0 || quantity > MAX_REGISTERS_PER_REQUEST {
                Err(UmdtError::Exception(ExceptionCode::IllegalDataValue as u8))
            } else {
                let kind = DataKind::for_function(function.into()).expect("read fc");
                device
                    .read_range(kind, start, quantity, rules)
                    .await
                    .map(|values| {
                        Response::from_pdu(
                            request,
                            pdu::build_registers_response(function, &values),
                        )
                    })
            }
        }
        PduRequest::WriteSingleCoil { address, value } => device
            .write_range(DataKind::Coil, address, &[u16::from(value)], true, rules)
            .await
            .map(|()| {
                let echo = if value { 0xFF00 } else { 0x0000 };
                Response::from_pdu(
                    request,
                    pdu::build_write_echo_response(
                        pdu::FunctionCode::WriteSingleCoil,
                        address,
                        echo,
                    ),
                )
            }),
        PduRequest::WriteSingleRegister { address, value } => device
            .write_range(DataKind::Holding, address, &[value], true, rules)
            .await
            .map(|()| {
                Response::from_pdu(
                    request,
                    pdu::build_write_echo_response(
                        pdu::FunctionCode::WriteSingleRegister,
                        address,
                        value,
                    ),
                )
            }),
        PduRequest::WriteMultipleCoils { start, values } => {
            let raw: Vec<u16> = values.iter().map(|&b| u16::from(b)).collect();
            device
                .write_range(DataKind::Coil, start, &raw, true, rules)
                .await
                .map(|()| {
                    Response::from_pdu(
                        request,
                        pdu::build_write_echo_response(
                            pdu::FunctionCode::WriteMultipleCoils,
                            start,
                            values.len() as u16,
                        ),
                    )
                })
        }
        PduRequest::WriteMultipleRegisters { start, values } => device
            .write_range(DataKind::Holding, start, &values, true, rules)
            .await
            .map(|()| {
                Response::from_pdu(
                    request,
                    pdu::build_write_echo_response(
                        pdu::FunctionCode::WriteMultipleRegisters,
                        start,
                        values.len() as u16,
                    ),
                )
            }),
        PduRequest::ReadWriteMultipleRegisters {
            read_start,
            read_quantity,
            write_start,
            write_values,
        } => {
            // Per the protocol, the write executes before the read.
            let write = device
                .write_range(DataKind::Holding, write_start, &write_values, true, rules)
                .await;
            match write {
                Ok(()) => device
                    .read_range(DataKind::Holding, read_start, read_quantity, rules)
                    .await
                    .map(|values| {
                        Response::from_pdu(
                            request,
                            pdu::build_registers_response(
                                pdu::FunctionCode::ReadWriteMultipleRegisters,
                                &values,
                            ),
                        )
                    }),
                Err(e) => Err(e),
            }
        }
        PduRequest::DeviceIdentification { .. } => Ok(Response::from_pdu(
            request,
            pdu::build_device_identification_response(
                "UMDT",
                &core.device_name,
                crate::VERSION,
            ),
        )),
    };

    // Track applied writes for script notification.
    let applied_write = matches!(
        (&result, request.function),
        (Ok(_), 0x05 | 0x06 | 0x0F | 0x10)
    );
    if applied_write {
        if let Ok(PduRequest::WriteSingleRegister { address, value }) = request.operation() {
            core.scripts
                .notify_write(request.unit_id, address, value)
                .await;
        } else if let Ok(PduRequest::WriteSingleCoil { address, value }) = request.operation() {
            core.scripts
                .notify_write(request.unit_id, address, u16::from(value))
                .await;
        } else if let Ok(PduRequest::WriteMultipleRegisters { start, values }) =
            request.operation()
        {
            for (i, &value) in values.iter().enumerate() {
                core.scripts
                    .notify_write(request.unit_id, start.wrapping_add(i as u16), value)
                    .await;
            }
        }
    }

    match result {
        Ok(response) => response,
        Err(UmdtError::Exception(code)) => Response::exception_for(request, code),
        Err(e) => {
            // Internal failure: slave device failure plus a loud event.
            core.events.publish(
                EventKind::Error,
                json!({"detail": format!("internal error: {e}"), "priority": "high"}),
            );
            Response::exception_for(request, ExceptionCode::SlaveDeviceFailure as u8)
        }
    }
}

/// Read one complete MBAP frame off a session socket. `Ok(None)` is a clean
/// peer close between frames.
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
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Mid-frame close: hand the truncated bytes to dispatch so
                // the event stream still sees them.
                return Ok(Some(full));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Some(full))
}

/// Per-connection session loop (TCP).
pub(crate) async fn run_tcp_session(
    core: Arc<ServerCore>,
    mut stream: TcpStream,
    peer: String,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("[MockServer] session open: {}", peer);
    core.events
        .publish(EventKind::Connection, json!({"peer": peer, "state": "open"}));

    loop {
        let frame_bytes = tokio::select! {
            _ = shutdown.changed() => break,
            result = read_mbap_frame(&mut stream) => match result {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(e) => {
                    warn!("[MockServer] session {} read error: {}", peer, e);
                    break;
                }
            },
        };

        let captured = frame::decode_tcp(&frame_bytes);
        let txn = captured.transaction_id.unwrap_or(0);
        if let Some(response) = dispatch(&core, captured).await {
            let wire = frame::build_frame(ModbusMode::Tcp, response.unit_id, response.pdu(), txn);
            if let Err(e) = stream.write_all(&wire).await {
                warn!("[MockServer] session {} write error: {}", peer, e);
                break;
            }
        }
    }

    info!("[MockServer] session closed: {}", peer);
    core.events
        .publish(EventKind::Connection, json!({"peer": peer, "state": "closed"}));
}

/// Single-session serial loop (RTU).
pub(crate) async fn run_serial_session(
    core: Arc<ServerCore>,
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
                    warn!("[MockServer] serial read error: {}", e);
                    break;
                }
            },
        };

        if let Some(response) = dispatch(&core, captured).await {
            let wire = frame::build_frame(ModbusMode::Rtu, response.unit_id, response.pdu(), 0);
            if let Err(e) = transport.send(&wire).await {
                warn!("[MockServer] serial write error: {}", e);
                break;
            }
        }
    }
    let _ = transport.close().await;
}

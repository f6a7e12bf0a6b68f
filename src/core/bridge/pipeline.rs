//! Bridge request pipeline
//!
//! One upstream frame in, at most one upstream frame out. The stages are
//! fixed: decode, ingress hook, egress hook, downstream exchange, response
//! hook, upstream-response hook, re-encode. Hooks may mutate, short-circuit
//! with an exception, or drop; a downstream timeout becomes exception 0x0B
//! so the master is never left hanging. Both PCAP streams are fed at the
//! exact points traffic crosses the bridge boundary.

use serde_json::json;
use tracing::debug;

use crate::core::bridge::BridgeCore;
use crate::core::events::EventKind;
use crate::core::frame::{self, CapturedFrame};
use crate::core::pcap::Direction;
use crate::core::pdu::{ExceptionCode, Request, Response};
use crate::core::script::HookOutcome;
use crate::utils::error::UmdtError;

/// Statistics over the bridge's lifetime.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BridgeStats {
    pub requests_processed: u64,
    pub responses_relayed: u64,
    pub requests_blocked: u64,
    pub exceptions_short_circuited: u64,
    pub downstream_failures: u64,
    pub frame_errors: u64,
}

/// Process one upstream frame; returns the bytes to send back on the same
/// session, if any.
pub(crate) async fn handle_upstream_frame(
    core: &BridgeCore,
    captured: CapturedFrame,
) -> Option<Vec<u8>> {
    let upstream_mode = captured.mode;
    core.pcap
        .log_upstream(&captured.raw, Direction::Inbound, upstream_mode.into())
        .await;
    core.events.publish(
        EventKind::Request,
        json!({"side": "upstream", "raw": hex::encode_upper(&captured.raw)}),
    );

    if !captured.valid {
        core.stats.lock().frame_errors += 1;
        core.events.publish(
            EventKind::Error,
            json!({
                "detail": "malformed upstream frame",
                "reason": captured.reason,
                "raw": hex::encode_upper(&captured.raw),
            }),
        );
        return None;
    }

    let request = Request::from_frame(&captured);
    // The originating session's transaction id and unit survive the whole
    // round trip regardless of what hooks do to the forwarded copy.
    let origin = request.clone();
    core.stats.lock().requests_processed += 1;

    // Ingress hook
    let request = match core.scripts.ingress(request).await {
        HookOutcome::Forward(request) => request,
        HookOutcome::Exception(code) => {
            core.stats.lock().exceptions_short_circuited += 1;
            return encode_upstream(core, &origin, Response::exception_for(&origin, code)).await;
        }
        HookOutcome::Drop => {
            core.stats.lock().requests_blocked += 1;
            debug!("[Bridge] request dropped by ingress hook");
            return None;
        }
    };

    // Egress hook
    let request = match core.scripts.egress(request).await {
        HookOutcome::Forward(request) => request,
        HookOutcome::Exception(code) => {
            core.stats.lock().exceptions_short_circuited += 1;
            return encode_upstream(core, &origin, Response::exception_for(&origin, code)).await;
        }
        HookOutcome::Drop => {
            core.stats.lock().requests_blocked += 1;
            debug!("[Bridge] request dropped by egress hook");
            return None;
        }
    };

    // Downstream exchange (bus-serialized). A silent or unreachable slave
    // answers the master as a gateway would.
    let response = match core.downstream.exchange(&request, &core.pcap, &core.events).await {
        Ok(response) => response,
        Err(UmdtError::Timeout { .. }) => {
            core.stats.lock().downstream_failures += 1;
            Response::exception_for(&origin, ExceptionCode::GatewayTargetFailed as u8)
        }
        Err(e) => {
            core.stats.lock().downstream_failures += 1;
            core.events.publish(
                EventKind::Error,
                json!({"detail": format!("downstream error: {e}")}),
            );
            Response::exception_for(&origin, ExceptionCode::GatewayPathUnavailable as u8)
        }
    };

    // Response hook (sees the raw downstream reply)
    let response = match core.scripts.response(response).await {
        Some(response) => response,
        None => {
            core.stats.lock().requests_blocked += 1;
            return None;
        }
    };

    // Upstream-response hook (last look before the master)
    let response = match core.scripts.upstream_response(response).await {
        Some(response) => response,
        None => {
            core.stats.lock().requests_blocked += 1;
            return None;
        }
    };

    core.stats.lock().responses_relayed += 1;
    encode_upstream(core, &origin, response).await
}

/// Encode a response in the upstream framing with the original transaction
/// id and log it outbound.
async fn encode_upstream(
    core: &BridgeCore,
    origin: &Request,
    response: Response,
) -> Option<Vec<u8>> {
    let txn = origin.transaction_id.unwrap_or(0);
    let wire = frame::build_frame(origin.mode, response.unit_id, response.pdu(), txn);
    core.pcap
        .log_upstream(&wire, Direction::Outbound, origin.mode.into())
        .await;
    core.events.publish(
        EventKind::Response,
        json!({"side": "upstream", "raw": hex::encode_upper(&wire)}),
    );
    Some(wire)
}

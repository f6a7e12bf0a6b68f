//! Endpoint prober
//!
//! Sweeps a Cartesian product of connection parameters and reports which
//! combinations answer Modbus at all. Each combination gets a fast-fail
//! transport (aggressive timeouts) so dead endpoints cannot stall the
//! search. *Alive* means a Modbus reply arrived - data or an exception -
//! with one refinement: gateway exceptions (0x0A path unavailable, 0x0B
//! target failed) mean the path answered but the device did not, so they do
//! not count. Transport errors, timeouts and framing errors are never alive.
//!
//! TCP combinations are probed concurrently under a configurable fan-out;
//! serial combinations are strictly sequential since a physical port cannot
//! be shared.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::frame;
use crate::core::pdu::{self, DataKind};
use crate::core::transport::{self, Endpoint, ModbusTransport, TransportOptions};
use crate::utils::error::{Result, UmdtError};

/// Register the probe reads on each candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TargetSpec {
    pub kind: DataKind,
    pub address: u16,
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self {
            kind: DataKind::Holding,
            address: 0,
        }
    }
}

/// One endpoint/unit combination to try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCombo {
    pub endpoint: Endpoint,
    pub unit: u8,
}

impl ProbeCombo {
    pub fn new(endpoint: Endpoint, unit: u8) -> Self {
        Self { endpoint, unit }
    }

    /// Canonical URI form (`tcp://host:port?unit=N`).
    pub fn uri(&self) -> String {
        match &self.endpoint {
            Endpoint::Tcp { host, port } => format!("tcp://{host}:{port}?unit={}", self.unit),
            Endpoint::Serial { path, baud, .. } => {
                format!("serial://{path}:{baud}?unit={}", self.unit)
            }
        }
    }
}

/// Outcome of probing one combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub uri: String,
    pub unit: u8,
    pub alive: bool,
    /// `response:...`, `exception:0xNN`, `timeout`, `connect-error: ...`
    pub summary: String,
    pub elapsed_ms: f64,
}

/// Combinatorial endpoint prober.
#[derive(Debug, Clone)]
pub struct Prober {
    pub timeout: Duration,
    pub concurrency: usize,
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for Prober {
    fn default() -> Self {
        Self {
            timeout: transport::FAST_FAIL_TIMEOUT,
            concurrency: 64,
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl Prober {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_attempts(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Build the Cartesian product of endpoints and unit ids.
    pub fn combinations(endpoints: &[Endpoint], units: &[u8]) -> Vec<ProbeCombo> {
        let mut combos = Vec::with_capacity(endpoints.len() * units.len());
        for endpoint in endpoints {
            for &unit in units {
                combos.push(ProbeCombo::new(endpoint.clone(), unit));
            }
        }
        combos
    }

    /// Probe every combination; results arrive in completion order.
    pub async fn run(&self, combos: Vec<ProbeCombo>, target: TargetSpec) -> Vec<ProbeResult> {
        let (serial, tcp): (Vec<_>, Vec<_>) =
            combos.into_iter().partition(|c| c.endpoint.is_serial());

        let mut results = Vec::new();

        // Serial first, one at a time: a physical bus tolerates no overlap.
        for combo in serial {
            results.push(self.probe_one(combo, target).await);
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<ProbeResult> = JoinSet::new();
        for combo in tcp {
            let prober = self.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                prober.probe_one(combo, target).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Ok(result) = joined {
                results.push(result);
            }
        }

        let alive = results.iter().filter(|r| r.alive).count();
        info!("[Prober] {} of {} combinations alive", alive, results.len());
        results
    }

    /// The combinations that answered.
    pub async fn alive(&self, combos: Vec<ProbeCombo>, target: TargetSpec) -> Vec<ProbeResult> {
        self.run(combos, target)
            .await
            .into_iter()
            .filter(|r| r.alive)
            .collect()
    }

    async fn probe_one(&self, combo: ProbeCombo, target: TargetSpec) -> ProbeResult {
        let start = Instant::now();
        let mut summary = String::from("no-attempt");
        let mut alive = false;

        for attempt in 0..self.attempts {
            if attempt > 0 && !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff).await;
            }
            let (ok, text) = self.attempt(&combo, target).await;
            summary = text;
            if ok {
                alive = true;
                break;
            }
        }

        debug!("[Prober] {} -> {} ({})", combo.uri(), alive, summary);
        ProbeResult {
            uri: combo.uri(),
            unit: combo.unit,
            alive,
            summary,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        }
    }

    async fn attempt(&self, combo: &ProbeCombo, target: TargetSpec) -> (bool, String) {
        let options = TransportOptions {
            connect_timeout: self.timeout,
            response_timeout: self.timeout,
        };
        let mut t: Box<dyn ModbusTransport> =
            match transport::connect(&combo.endpoint, options).await {
                Ok(t) => t,
                Err(e) => return (false, format!("connect-error: {e}")),
            };

        let request_pdu =
            pdu::build_read_request(target.kind.read_function(), target.address, 1);
        let wire = frame::build_frame(t.mode(), combo.unit, request_pdu, 1);

        if let Err(e) = t.send(&wire).await {
            let _ = t.close().await;
            return (false, format!("send-error: {e}"));
        }

        let verdict = match t.receive_frame(self.timeout).await {
            Ok(captured) if !captured.valid => (false, "frame-error".to_string()),
            Ok(captured) => match captured.exception_code() {
                // Gateway exceptions: the path spoke, the device did not.
                Some(code @ (0x0A | 0x0B)) => (false, format!("gateway-error:0x{code:02X}")),
                Some(code) => (true, format!("exception:0x{code:02X}")),
                None => (
                    true,
                    format!("response:{}", hex::encode_upper(&captured.raw)),
                ),
            },
            Err(UmdtError::Timeout { .. }) => (false, "timeout".to_string()),
            Err(e) => (false, format!("error: {e}")),
        };

        let _ = t.close().await;
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cartesian_combinations() {
        let endpoints = vec![Endpoint::tcp("a", 1), Endpoint::tcp("b", 2)];
        let combos = Prober::combinations(&endpoints, &[1, 2, 3]);
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[0].uri(), "tcp://a:1?unit=1");
        assert_eq!(combos[5].uri(), "tcp://b:2?unit=3");
    }

    #[tokio::test]
    async fn test_closed_port_not_alive() {
        let prober = Prober::default();
        let combos = vec![ProbeCombo::new(Endpoint::tcp("127.0.0.1", 1), 1)];
        let results = prober.run(combos, TargetSpec::default()).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].alive);
        assert!(results[0].summary.starts_with("connect-error"));
    }
}

//! Fault injector
//!
//! Applies the configured fault profile to mock-server traffic: latency
//! with percent jitter, request drops, payload bit flips, forced
//! exceptions. The RNG is seedable so test runs reproduce. Profile updates
//! swap atomically; a request uses the profile it sampled at dispatch.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::debug;

use crate::core::events::{EventBus, EventKind};
use crate::core::server::models::FaultProfile;

/// Seedable fault injection engine.
pub struct FaultInjector {
    profile: RwLock<Arc<FaultProfile>>,
    rng: Mutex<StdRng>,
    events: EventBus,
}

impl FaultInjector {
    pub fn new(profile: FaultProfile, seed: Option<u64>, events: EventBus) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            profile: RwLock::new(Arc::new(profile)),
            rng: Mutex::new(rng),
            events,
        }
    }

    /// Profile generation for one request.
    pub fn profile(&self) -> Arc<FaultProfile> {
        Arc::clone(&self.profile.read())
    }

    /// Swap in a new profile; takes effect for the next dispatched request.
    pub fn update(&self, profile: FaultProfile) {
        debug!("[Faults] profile updated: {:?}", profile);
        *self.profile.write() = Arc::new(profile);
    }

    /// Reseed the RNG (reproducible test runs).
    pub fn reseed(&self, seed: u64) {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
    }

    /// Roll for a request drop.
    pub fn should_drop(&self, profile: &FaultProfile) -> bool {
        if profile.drop_rate <= 0.0 {
            return false;
        }
        let hit = self.rng.lock().gen::<f32>() < profile.drop_rate;
        if hit {
            self.events.publish(
                EventKind::FaultInjected,
                json!({"kind": "drop", "rate": profile.drop_rate}),
            );
        }
        hit
    }

    /// Sleep out the configured latency (with jitter).
    pub async fn apply_latency(&self, profile: &FaultProfile) {
        if profile.latency_ms == 0 {
            return;
        }
        let base = profile.latency_ms as f64;
        let jitter = base * (profile.latency_jitter_pct as f64 / 100.0);
        let delta = if jitter > 0.0 {
            (self.rng.lock().gen::<f64>() - 0.5) * 2.0 * jitter
        } else {
            0.0
        };
        let ms = (base + delta).max(0.0);
        self.events.publish(
            EventKind::FaultInjected,
            json!({"kind": "latency", "ms": ms}),
        );
        tokio::time::sleep(std::time::Duration::from_secs_f64(ms / 1000.0)).await;
    }

    /// XOR random bits into the payload; returns how many bytes were hit.
    pub fn apply_bit_flips(&self, profile: &FaultProfile, payload: &mut [u8]) -> u32 {
        if profile.bit_flip_rate <= 0.0 || payload.is_empty() {
            return 0;
        }
        let mut rng = self.rng.lock();
        let mut flips = 0u32;
        for byte in payload.iter_mut() {
            if rng.gen::<f32>() < profile.bit_flip_rate {
                *byte ^= 1 << rng.gen_range(0..8);
                flips += 1;
            }
        }
        drop(rng);
        if flips > 0 {
            self.events.publish(
                EventKind::FaultInjected,
                json!({"kind": "bit_flip", "bytes": flips}),
            );
        }
        flips
    }

    /// Exception code forced on every request, if configured.
    pub fn forced_exception(&self, profile: &FaultProfile) -> Option<u8> {
        let code = profile.forced_exception?;
        self.events.publish(
            EventKind::FaultInjected,
            json!({"kind": "forced_exception", "code": code}),
        );
        Some(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn injector(profile: FaultProfile) -> FaultInjector {
        FaultInjector::new(profile, Some(42), EventBus::default())
    }

    #[test]
    fn test_drop_rates() {
        let never = injector(FaultProfile::default());
        let profile = never.profile();
        for _ in 0..100 {
            assert!(!never.should_drop(&profile));
        }

        let always = injector(FaultProfile {
            drop_rate: 1.0,
            ..Default::default()
        });
        let profile = always.profile();
        for _ in 0..100 {
            assert!(always.should_drop(&profile));
        }
    }

    #[test]
    fn test_bit_flips_all_or_nothing() {
        let always = injector(FaultProfile {
            bit_flip_rate: 1.0,
            ..Default::default()
        });
        let profile = always.profile();
        let original = [0u8; 8];
        let mut payload = original;
        let flips = always.apply_bit_flips(&profile, &mut payload);
        assert_eq!(flips, 8);
        for (a, b) in original.iter().zip(&payload) {
            // Exactly one bit differs per byte
            assert_eq!((a ^ b).count_ones(), 1);
        }

        let never = injector(FaultProfile::default());
        let profile = never.profile();
        let mut payload = original;
        assert_eq!(never.apply_bit_flips(&profile, &mut payload), 0);
        assert_eq!(payload, original);
    }

    #[test]
    fn test_seed_reproducibility() {
        let a = injector(FaultProfile {
            drop_rate: 0.5,
            ..Default::default()
        });
        let b = injector(FaultProfile {
            drop_rate: 0.5,
            ..Default::default()
        });
        let profile = a.profile();
        let seq_a: Vec<bool> = (0..32).map(|_| a.should_drop(&profile)).collect();
        let seq_b: Vec<bool> = (0..32).map(|_| b.should_drop(&profile)).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn test_update_swaps_profile() {
        let injector = injector(FaultProfile::default());
        let before = injector.profile();
        injector.update(FaultProfile {
            latency_ms: 500,
            drop_rate: 1.0,
            ..Default::default()
        });
        // The old generation is untouched
        assert_eq!(before.latency_ms, 0);
        assert_eq!(injector.profile().latency_ms, 500);
    }

    #[test]
    fn test_forced_exception() {
        let injector = injector(FaultProfile {
            forced_exception: Some(0x04),
            ..Default::default()
        });
        let profile = injector.profile();
        assert_eq!(injector.forced_exception(&profile), Some(0x04));
    }

    #[tokio::test]
    async fn test_latency_sleeps() {
        let injector = injector(FaultProfile {
            latency_ms: 30,
            ..Default::default()
        });
        let profile = injector.profile();
        let start = std::time::Instant::now();
        injector.apply_latency(&profile).await;
        assert!(start.elapsed() >= std::time::Duration::from_millis(25));
    }
}

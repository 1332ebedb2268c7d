//! Simulated Control Plane with Fault Injection
//!
//! Wraps any control plane and injects failures with per-operation
//! probabilities driven by a seeded RNG, so a failing seed replays exactly.
//! Injected failures never reach the wrapped plane, which therefore only
//! ever records calls that would have succeeded on the wire.

use crate::control::{Container, ControlPlane, StreamHandle};
use crate::error::FeedError;
use crate::transport::TransportError;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::{Rng as _, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Deterministic RNG
// ============================================================================

/// Deterministic RNG for simulations
///
/// ChaCha8 is seedable and fast; the same seed always produces the same
/// sequence, which makes failures reproducible.
pub struct SimulatedRng {
    inner: ChaCha8Rng,
}

impl SimulatedRng {
    pub fn new(seed: u64) -> Self {
        SimulatedRng {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// True with the given probability (clamped to [0, 1])
    pub fn gen_bool(&mut self, probability: f64) -> bool {
        self.inner.gen_bool(probability.clamp(0.0, 1.0))
    }

    /// Uniform value in [min, max)
    pub fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.inner.gen_range(min..max)
    }

    pub fn next_u64(&mut self) -> u64 {
        use rand::RngCore;
        self.inner.next_u64()
    }
}

// ============================================================================
// Fault configuration and stats
// ============================================================================

/// Per-operation failure probabilities
#[derive(Debug, Clone)]
pub struct SimulatedFaults {
    pub provision_fail_prob: f64,
    pub upload_fail_prob: f64,
    pub push_fail_prob: f64,
    pub open_fail_prob: f64,
    pub close_fail_prob: f64,
    /// Probability an injected failure reports an exhausted rate limit
    /// instead of a server error
    pub rate_limited_prob: f64,
}

impl Default for SimulatedFaults {
    fn default() -> Self {
        SimulatedFaults {
            provision_fail_prob: 0.02,
            upload_fail_prob: 0.02,
            push_fail_prob: 0.02,
            open_fail_prob: 0.01,
            close_fail_prob: 0.01,
            rate_limited_prob: 0.25,
        }
    }
}

impl SimulatedFaults {
    /// No fault injection; pure passthrough
    pub fn no_faults() -> Self {
        SimulatedFaults {
            provision_fail_prob: 0.0,
            upload_fail_prob: 0.0,
            push_fail_prob: 0.0,
            open_fail_prob: 0.0,
            close_fail_prob: 0.0,
            rate_limited_prob: 0.0,
        }
    }

    /// Aggressive fault injection for chaos runs
    pub fn high_chaos() -> Self {
        SimulatedFaults {
            provision_fail_prob: 0.10,
            upload_fail_prob: 0.10,
            push_fail_prob: 0.10,
            open_fail_prob: 0.05,
            close_fail_prob: 0.05,
            rate_limited_prob: 0.5,
        }
    }
}

/// Counters for attempted and injected-failed operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedStats {
    pub provision_attempts: u64,
    pub provision_failures: u64,
    pub upload_attempts: u64,
    pub upload_failures: u64,
    pub push_attempts: u64,
    pub push_failures: u64,
    pub open_attempts: u64,
    pub open_failures: u64,
    pub close_attempts: u64,
    pub close_failures: u64,
}

impl SimulatedStats {
    pub fn total_attempts(&self) -> u64 {
        self.provision_attempts
            + self.upload_attempts
            + self.push_attempts
            + self.open_attempts
            + self.close_attempts
    }

    pub fn total_failures(&self) -> u64 {
        self.provision_failures
            + self.upload_failures
            + self.push_failures
            + self.open_failures
            + self.close_failures
    }
}

// ============================================================================
// Simulated control plane
// ============================================================================

struct SimulatedInner {
    rng: SimulatedRng,
    stats: SimulatedStats,
    /// Remaining number of faults to inject; None means unlimited
    fault_budget: Option<u64>,
}

/// Control plane wrapper that injects faults
pub struct SimulatedControlPlane<P: ControlPlane + Clone> {
    inner: P,
    faults: SimulatedFaults,
    state: Arc<Mutex<SimulatedInner>>,
}

impl<P: ControlPlane + Clone> SimulatedControlPlane<P> {
    pub fn new(inner: P, seed: u64, faults: SimulatedFaults) -> Self {
        SimulatedControlPlane {
            inner,
            faults,
            state: Arc::new(Mutex::new(SimulatedInner {
                rng: SimulatedRng::new(seed),
                stats: SimulatedStats::default(),
                fault_budget: None,
            })),
        }
    }

    /// Cap the total number of injected faults, after which the plane
    /// behaves like a passthrough
    pub fn with_fault_budget(self, budget: u64) -> Self {
        self.state.lock().fault_budget = Some(budget);
        self
    }

    /// Snapshot of the counters so far
    pub fn stats(&self) -> SimulatedStats {
        self.state.lock().stats.clone()
    }

    /// Decide one injection; consumes RNG state and the fault budget
    fn inject(&self, probability: f64) -> Option<FeedError> {
        let mut state = self.state.lock();
        if probability <= 0.0 {
            return None;
        }
        if let Some(0) = state.fault_budget {
            return None;
        }
        if !state.rng.gen_bool(probability) {
            return None;
        }
        if let Some(budget) = state.fault_budget.as_mut() {
            *budget -= 1;
        }

        let rate_limited = state.rng.gen_bool(self.faults.rate_limited_prob);
        Some(if rate_limited {
            FeedError::Transport(TransportError::RateLimitExhausted {
                retries: 3,
                body: "simulated rate limit".to_string(),
            })
        } else {
            FeedError::Transport(TransportError::Status {
                status: 503,
                body: "simulated outage".to_string(),
            })
        })
    }
}

impl<P: ControlPlane + Clone> Clone for SimulatedControlPlane<P> {
    fn clone(&self) -> Self {
        SimulatedControlPlane {
            inner: self.inner.clone(),
            faults: self.faults.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<P: ControlPlane + Clone> ControlPlane for SimulatedControlPlane<P> {
    fn provision_container<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<Container, FeedError>> {
        Box::pin(async move {
            self.state.lock().stats.provision_attempts += 1;
            if let Some(err) = self.inject(self.faults.provision_fail_prob) {
                self.state.lock().stats.provision_failures += 1;
                return Err(err);
            }
            self.inner.provision_container().await
        })
    }

    fn upload_content<'a>(
        &'a self,
        upload_target: &'a str,
        required_headers: &'a HashMap<String, String>,
        json_payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            self.state.lock().stats.upload_attempts += 1;
            if let Some(err) = self.inject(self.faults.upload_fail_prob) {
                self.state.lock().stats.upload_failures += 1;
                return Err(err);
            }
            self.inner
                .upload_content(upload_target, required_headers, json_payload)
                .await
        })
    }

    fn push_container<'a>(
        &'a self,
        source_id: &'a str,
        container_id: &'a str,
    ) -> BoxFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            self.state.lock().stats.push_attempts += 1;
            if let Some(err) = self.inject(self.faults.push_fail_prob) {
                self.state.lock().stats.push_failures += 1;
                return Err(err);
            }
            self.inner.push_container(source_id, container_id).await
        })
    }

    fn open_stream_session<'a>(
        &'a self,
        source_id: &'a str,
    ) -> BoxFuture<'a, Result<StreamHandle, FeedError>> {
        Box::pin(async move {
            self.state.lock().stats.open_attempts += 1;
            if let Some(err) = self.inject(self.faults.open_fail_prob) {
                self.state.lock().stats.open_failures += 1;
                return Err(err);
            }
            self.inner.open_stream_session(source_id).await
        })
    }

    fn close_stream_session<'a>(
        &'a self,
        source_id: &'a str,
        handle: &'a StreamHandle,
    ) -> BoxFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            self.state.lock().stats.close_attempts += 1;
            if let Some(err) = self.inject(self.faults.close_fail_prob) {
                self.state.lock().stats.close_failures += 1;
                return Err(err);
            }
            self.inner.close_stream_session(source_id, handle).await
        })
    }
}

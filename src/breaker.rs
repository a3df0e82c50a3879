//! Failure-rate circuit breaker for outbound HTTP calls.
//!
//! Success and failure counts share one `AtomicU64` (successes in the low
//! 32 bits, failures in the high 32 bits) so every update is a single
//! compare-and-swap and [`RateBreaker::ready`] always sees a consistent
//! pair.  When the combined count reaches the window both halves are
//! halved, letting old observations decay.
//!
//! The breaker is not ready once at least `min_samples` observations exist
//! and the failure rate exceeds `failure_threshold`.  While not ready,
//! calls are skipped without touching the network, except for one probe
//! per cooldown period.  A streak of `recovery_successes` consecutive
//! successes after a trip resets the counters.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::metrics::{BACKEND_CALLS_TOTAL, BREAKER_REJECTIONS_TOTAL};

const LOW_MASK: u64 = 0xFFFF_FFFF;

/// Errors returned by [`BreakerClient::execute`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The breaker is open; no request was sent.
    #[error("circuit breaker open, request to {0} skipped")]
    Tripped(String),

    /// The request failed before a response arrived.
    #[error("backend transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Rolling success/failure counters with a failure-rate trip condition.
#[derive(Debug)]
pub struct RateBreaker {
    counts: AtomicU64,
    streak: AtomicU32,
    tripped: AtomicBool,
    /// Milliseconds since `epoch` of the last trip or probe.
    last_probe: AtomicU64,
    epoch: Instant,
    failure_threshold: f64,
    min_samples: u64,
    window: u64,
    cooldown: Duration,
    recovery_successes: u32,
}

impl RateBreaker {
    /// Create a breaker from configuration.
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            counts: AtomicU64::new(0),
            streak: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
            last_probe: AtomicU64::new(0),
            epoch: Instant::now(),
            failure_threshold: config.failure_threshold,
            min_samples: config.min_samples,
            window: config.window.clamp(2, LOW_MASK),
            cooldown: config.cooldown(),
            recovery_successes: config.recovery_successes.max(1),
        }
    }

    /// Whether calls should be attempted.
    pub fn ready(&self) -> bool {
        let (successes, failures) = self.counts();
        !self.over_threshold(successes, failures)
    }

    /// Whether the next call may go out: ready, or the single probe
    /// permitted once the cooldown has elapsed.
    pub fn allow(&self) -> bool {
        if self.ready() {
            return true;
        }
        let now = self.elapsed_ms();
        let last = self.last_probe.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.cooldown.as_millis() as u64 {
            return false;
        }
        // Only the caller that wins the swap sends the probe.
        self.last_probe
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Current `(successes, failures)`.
    pub fn counts(&self) -> (u64, u64) {
        unpack(self.counts.load(Ordering::Acquire))
    }

    /// Record a completed call that succeeded.
    pub fn record_success(&self) {
        self.record(false);
        if !self.tripped.load(Ordering::Acquire) {
            return;
        }
        let streak = self.streak.fetch_add(1, Ordering::AcqRel) + 1;
        if streak >= self.recovery_successes {
            self.reset();
            info!(streak, "circuit breaker recovered, counters reset");
        }
    }

    /// Record a completed call that failed.
    pub fn record_failure(&self) {
        self.streak.store(0, Ordering::Release);
        let (successes, failures) = self.record(true);
        if self.over_threshold(successes, failures) && !self.tripped.swap(true, Ordering::AcqRel) {
            self.last_probe.store(self.elapsed_ms(), Ordering::Release);
            warn!(successes, failures, "circuit breaker tripped");
        }
    }

    /// Clear counters and the tripped flag.
    pub fn reset(&self) {
        self.counts.store(0, Ordering::Release);
        self.streak.store(0, Ordering::Release);
        self.tripped.store(false, Ordering::Release);
    }

    fn record(&self, failure: bool) -> (u64, u64) {
        let mut current = self.counts.load(Ordering::Acquire);
        loop {
            let (mut successes, mut failures) = unpack(current);
            if failure {
                failures += 1;
            } else {
                successes += 1;
            }
            if successes + failures >= self.window {
                successes /= 2;
                failures /= 2;
            }
            match self.counts.compare_exchange_weak(
                current,
                pack(successes, failures),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (successes, failures),
                Err(actual) => current = actual,
            }
        }
    }

    fn over_threshold(&self, successes: u64, failures: u64) -> bool {
        let samples = successes + failures;
        if samples == 0 || samples < self.min_samples {
            return false;
        }
        failures as f64 / samples as f64 > self.failure_threshold
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

fn pack(successes: u64, failures: u64) -> u64 {
    (failures.min(LOW_MASK) << 32) | successes.min(LOW_MASK)
}

fn unpack(value: u64) -> (u64, u64) {
    (value & LOW_MASK, value >> 32)
}

/// HTTP client whose calls are gated by a [`RateBreaker`].
///
/// Cloning shares both the connection pool and the breaker.
#[derive(Clone, Debug)]
pub struct BreakerClient {
    client: reqwest::Client,
    breaker: Arc<RateBreaker>,
}

impl BreakerClient {
    /// Build a client with the configured timeout and thresholds.
    pub fn new(config: &BreakerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            breaker: Arc::new(RateBreaker::new(config)),
        })
    }

    /// Underlying client, for building requests.
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// The breaker gating this client.
    pub fn breaker(&self) -> &RateBreaker {
        &self.breaker
    }

    /// Whether calls are currently being attempted.
    pub fn ready(&self) -> bool {
        self.breaker.ready()
    }

    /// Send `request` if the breaker allows it.
    ///
    /// Transport errors and 5xx responses count as failures; every other
    /// response counts as a success and is returned as-is, 5xx included.
    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, BackendError> {
        let target = format!("{} {}", request.method(), request.url().path());
        if !self.breaker.allow() {
            warn!(target = %target, "backend call skipped, circuit breaker open");
            counter!(BREAKER_REJECTIONS_TOTAL).increment(1);
            counter!(BACKEND_CALLS_TOTAL, "outcome" => "rejected").increment(1);
            return Err(BackendError::Tripped(target));
        }

        match self.client.execute(request).await {
            Ok(response) if response.status().is_server_error() => {
                debug!(target = %target, status = response.status().as_u16(), "backend call failed");
                self.breaker.record_failure();
                counter!(BACKEND_CALLS_TOTAL, "outcome" => "failure").increment(1);
                Ok(response)
            }
            Ok(response) => {
                self.breaker.record_success();
                counter!(BACKEND_CALLS_TOTAL, "outcome" => "success").increment(1);
                Ok(response)
            }
            Err(err) => {
                debug!(target = %target, error = %err, "backend call failed");
                self.breaker.record_failure();
                counter!(BACKEND_CALLS_TOTAL, "outcome" => "failure").increment(1);
                Err(BackendError::Transport(err))
            }
        }
    }
}

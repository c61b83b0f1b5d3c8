//! Circuit breaker guarding connection attempts.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │ now >= open_until
//!     │ probe succeeds                 ▼
//!     └──────────────────────────── HalfOpen ──▶ Open (probe fails)
//! ```
//!
//! The breaker holds no clock and no lock. Every transition takes the
//! current instant, and the pool calls it from inside its own critical
//! section.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::PoolError;

/// Default consecutive failures that open the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time the circuit stays open before allowing a probe.
pub const DEFAULT_OPEN_DURATION: Duration = Duration::from_secs(3);

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct CircuitBreakerConfig {
    /// Consecutive infrastructure failures that open the circuit.
    pub failure_threshold: u32,

    /// How long the circuit stays open.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_duration: DEFAULT_OPEN_DURATION,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold.
    #[must_use]
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the open duration.
    #[must_use]
    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.failure_threshold == 0 {
            return Err(PoolError::Configuration(
                "failure_threshold must be greater than 0".into(),
            ));
        }
        if self.open_duration.is_zero() {
            return Err(PoolError::Configuration(
                "open_duration must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected without touching the network.
    Open,
    /// One probe request is let through to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Three-state circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failures: u32,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: 0,
            open_until: None,
            probe_in_flight: false,
        }
    }

    /// Current state, without advancing time.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures counted so far.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether a half-open probe has been admitted and not yet resolved.
    #[must_use]
    pub fn probe_in_flight(&self) -> bool {
        self.probe_in_flight
    }

    /// Decide whether a request may proceed at `now`.
    ///
    /// An expired open circuit moves to half-open here, and the first request
    /// admitted in half-open becomes the probe.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.open_until.is_some_and(|until| now < until) {
                    return false;
                }
                tracing::info!("circuit breaker half-open; admitting probe");
                self.state = CircuitState::HalfOpen;
                self.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a healthy outcome of ordinary work.
    ///
    /// Only resets the counter; closing a half-open circuit is up to the
    /// probe.
    pub fn on_success(&mut self) {
        self.failures = 0;
    }

    /// Record an infrastructure failure of ordinary work at `now`.
    ///
    /// Trips a closed circuit at the threshold. Open and half-open circuits
    /// keep their state.
    pub fn on_failure(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        if self.state == CircuitState::Closed && self.failures >= self.config.failure_threshold {
            self.trip(now);
        }
    }

    /// Record the probe's healthy outcome, closing a half-open circuit.
    pub fn on_probe_success(&mut self) {
        self.failures = 0;
        if self.state == CircuitState::HalfOpen {
            tracing::info!("circuit breaker closed");
            self.state = CircuitState::Closed;
            self.open_until = None;
            self.probe_in_flight = false;
        }
    }

    /// Record the probe's failure at `now`, reopening a half-open circuit
    /// with a fresh deadline.
    pub fn on_probe_failure(&mut self, now: Instant) {
        if self.state == CircuitState::HalfOpen {
            self.failures = self.config.failure_threshold;
            self.trip(now);
        } else {
            self.on_failure(now);
        }
    }

    /// Record an outcome, routed by whether it came from the probe.
    pub fn record(&mut self, success: bool, probe: bool, now: Instant) {
        match (success, probe) {
            (true, true) => self.on_probe_success(),
            (true, false) => self.on_success(),
            (false, true) => self.on_probe_failure(now),
            (false, false) => self.on_failure(now),
        }
    }

    /// Give back an admitted probe that never reached the database.
    ///
    /// The breaker stays half-open so the next request can probe instead.
    pub fn release_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.open_until = Some(now + self.config.open_duration);
        self.probe_in_flight = false;
        tracing::warn!(
            failures = self.failures,
            open_for = ?self.config.open_duration,
            "circuit breaker opened"
        );
    }
}

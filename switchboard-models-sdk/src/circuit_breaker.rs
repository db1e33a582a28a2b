//! # Circuit Breaker
//!
//! A per-provider three-state guard that fails fast when a provider has
//! recently failed too often, so one degraded upstream cannot drag every
//! request through its timeout.
//!
//! ## States
//!
//! - **Closed**: normal operation. Failures increment a counter; each
//!   success decrements it (floor 0). Hitting the failure threshold opens
//!   the circuit.
//! - **Open**: calls are rejected immediately. Once the recovery timeout
//!   has elapsed, the next `before_call` moves the circuit to half-open.
//! - **Half-open**: probe traffic is allowed through. A configured number
//!   of consecutive successes closes the circuit; any failure reopens it.
//!
//! ## Auth-block
//!
//! Authentication failures (401/403) are tracked separately from the
//! failure counter: retrying cannot fix a bad credential, so the provider
//! is soft-disabled for a long cooldown instead. `before_call` consults
//! both the breaker state and the auth-block flag.
//!
//! The dispatcher is the only caller of the mutating methods; state lives
//! behind one mutex per provider, so transitions are linearizable.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tuning parameters for a per-provider breaker.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive-ish failures before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit waits before allowing a probe
    pub recovery_timeout: Duration,
    /// Consecutive successes required to close from half-open
    pub half_open_success_threshold: u32,
    /// Cooldown applied on authentication failures
    pub auth_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_success_threshold: 2,
            auth_cooldown: Duration::from_secs(600),
        }
    }
}

/// Circuit breaker operational states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls allowed
    Closed,
    /// Failing, calls rejected
    Open,
    /// Probing recovery, calls allowed
    HalfOpen,
}

/// Why `before_call` rejected an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerRejection {
    /// Circuit is open; retry after the given delay
    Open { retry_in: Duration },
    /// Provider is auth-blocked; clears after the given delay
    AuthBlocked { retry_in: Duration },
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    auth_blocked_until: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            auth_blocked_until: None,
        }
    }
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub auth_blocked: bool,
}

/// Per-provider circuit breaker with an independent auth-block flag.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    /// Consult the breaker before dispatching an attempt.
    ///
    /// An open circuit whose recovery timeout has elapsed transitions to
    /// half-open here and admits the call as a probe.
    pub fn before_call(&self) -> Result<(), BreakerRejection> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        if let Some(until) = inner.auth_blocked_until {
            if now < until {
                return Err(BreakerRejection::AuthBlocked {
                    retry_in: until - now,
                });
            }
            inner.auth_blocked_until = None;
            tracing::info!("provider {} auth-block expired", self.name);
        }

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                // An open circuit without a failure timestamp should not
                // happen; keep blocking rather than guess.
                let Some(opened_at) = inner.last_failure_at else {
                    return Err(BreakerRejection::Open {
                        retry_in: self.config.recovery_timeout,
                    });
                };
                let recovers_at = opened_at + self.config.recovery_timeout;
                if now >= recovers_at {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    tracing::info!("circuit breaker {} transitioning to HALF-OPEN", self.name);
                    Ok(())
                } else {
                    Err(BreakerRejection::Open {
                        retry_in: recovers_at - now,
                    })
                }
            }
        }
    }

    /// Record a successful attempt.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    tracing::info!("circuit breaker {} transitioning to CLOSED", self.name);
                }
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened may still complete.
                tracing::warn!(
                    "late success recorded while circuit breaker {} is OPEN",
                    self.name
                );
            }
        }
    }

    /// Record a failed attempt (non-auth).
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        "circuit breaker {} transitioning to OPEN after {} failures",
                        self.name,
                        inner.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.failure_count = 1;
                inner.success_count = 0;
                tracing::warn!("circuit breaker {} transitioning back to OPEN", self.name);
            }
            CircuitState::Open => {
                inner.failure_count += 1;
            }
        }
    }

    /// Record an authentication failure: soft-disable the provider for the
    /// configured cooldown without touching the failure counter.
    pub fn record_auth_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.auth_blocked_until = Some(Instant::now() + self.config.auth_cooldown);
        tracing::warn!(
            "provider {} auth-blocked for {:?}",
            self.name,
            self.config.auth_cooldown
        );
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// True while the circuit is open and the recovery timeout has not
    /// elapsed, without mutating state.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Open => match inner.last_failure_at {
                Some(at) => Instant::now() < at + self.config.recovery_timeout,
                None => true,
            },
            _ => false,
        }
    }

    pub fn is_auth_blocked(&self) -> bool {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        matches!(inner.auth_blocked_until, Some(until) if Instant::now() < until)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            auth_blocked: matches!(inner.auth_blocked_until, Some(u) if Instant::now() < u),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, recovery_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
            half_open_success_threshold: 2,
            auth_cooldown: Duration::from_millis(200),
        }
    }

    #[test]
    fn opens_on_exactly_the_nth_failure() {
        let breaker = CircuitBreaker::new("test", config(3, 1000));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.before_call(),
            Err(BreakerRejection::Open { .. })
        ));
    }

    #[test]
    fn success_decrements_failure_count_in_closed() {
        let breaker = CircuitBreaker::new("test", config(2, 1000));

        breaker.record_failure();
        breaker.record_success();
        // The decrement means one more failure is not enough to open.
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_requires_consecutive_successes() {
        let breaker = CircuitBreaker::new("test", config(1, 20));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.before_call().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", config(1, 20));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.before_call().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.before_call().is_err());
    }

    #[test]
    fn auth_block_is_independent_of_failure_count() {
        let breaker = CircuitBreaker::new("test", config(5, 1000));

        breaker.record_auth_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
        assert!(matches!(
            breaker.before_call(),
            Err(BreakerRejection::AuthBlocked { .. })
        ));

        std::thread::sleep(Duration::from_millis(250));
        assert!(breaker.before_call().is_ok());
    }
}

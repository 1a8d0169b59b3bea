//! # Circuit Breaker
//!
//! Per-dependency circuit breakers for preventing cascading failures.
//!
//! Every dependency key (typically `"{worker}:{model}"`) owns an independent
//! state machine behind its own mutex, so a failing dependency never blocks or
//! trips calls to another one:
//!
//! - `CLOSED`: calls flow; consecutive failures are counted and the circuit
//!   opens once `failure_threshold` is reached.
//! - `OPEN`: calls fail fast until `cool_down` has elapsed since opening.
//! - `HALF_OPEN`: one trial call at a time is admitted; `success_threshold`
//!   consecutive successes close the circuit, any failure reopens it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use config_rs::ResilienceSettings;
use dashmap::DashMap;
use metrics::{gauge, increment_counter};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::{Error, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery, one trial request at a time
    HalfOpen,
}

impl CircuitState {
    fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration shared by every circuit in a registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN before the circuit closes
    pub success_threshold: u32,
    /// Time to keep the circuit open before admitting a trial call
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cool_down: Duration::from_secs(60),
        }
    }
}

impl From<&ResilienceSettings> for CircuitBreakerConfig {
    fn from(settings: &ResilienceSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            cool_down: settings.cool_down(),
        }
    }
}

/// Observable state of one dependency's circuit.
///
/// At most one of `consecutive_failures` and `consecutive_successes` is
/// non-zero at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }
}

/// Proof that a call was admitted by the breaker. Handed back when the
/// outcome is recorded so a half-open trial slot is always released.
///
/// A trial permit dropped without an outcome (the caller was cancelled)
/// counts as a failed trial and reopens the circuit.
#[derive(Debug)]
#[must_use = "the outcome of an admitted call must be recorded"]
pub struct BreakerPermit {
    key: String,
    circuit: Arc<Mutex<Circuit>>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    /// True when this call is the single trial admitted in HALF_OPEN
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    fn settle(mut self) -> Arc<Mutex<Circuit>> {
        self.settled = true;
        Arc::clone(&self.circuit)
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.settled || !self.trial {
            return;
        }
        let mut c = lock(&self.circuit);
        c.trial_in_flight = false;
        if c.public.state == CircuitState::HalfOpen {
            c.public.consecutive_failures += 1;
            c.open();
            drop(c);
            warn!(circuit = %self.key, "Circuit OPEN: half-open trial abandoned");
            record_transition(&self.key, CircuitState::HalfOpen, CircuitState::Open);
        }
    }
}

#[derive(Debug, Default)]
struct Circuit {
    public: CircuitBreakerState,
    /// Monotonic time the circuit last opened
    opened_instant: Option<Instant>,
    trial_in_flight: bool,
}

impl Circuit {
    fn open(&mut self) {
        self.public.state = CircuitState::Open;
        self.public.consecutive_successes = 0;
        self.public.opened_at = Some(Utc::now());
        self.opened_instant = Some(Instant::now());
    }

    fn close(&mut self) {
        self.public = CircuitBreakerState::default();
        self.opened_instant = None;
    }
}

/// Registry of independent circuit breakers keyed by dependency
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Arc<Mutex<Circuit>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    // The map entry guard is dropped before the per-circuit mutex is taken,
    // so no cross-key lock is ever held while a circuit is mutated.
    fn circuit(&self, key: &str) -> Arc<Mutex<Circuit>> {
        if let Some(existing) = self.circuits.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.circuits
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Circuit::default())))
                .value(),
        )
    }

    /// Asks the breaker for `key` whether a call may proceed.
    ///
    /// Fails with `CircuitOpen` while the circuit is open and cooling down,
    /// or while a half-open trial is already in flight.
    pub fn try_acquire(&self, key: &str) -> Result<BreakerPermit> {
        let circuit = self.circuit(key);
        let permit = |trial| BreakerPermit {
            key: key.to_string(),
            circuit: Arc::clone(&circuit),
            trial,
            settled: false,
        };
        let mut c = lock(&circuit);

        match c.public.state {
            CircuitState::Closed => Ok(permit(false)),
            CircuitState::Open => {
                let elapsed = c
                    .opened_instant
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.cool_down);

                if elapsed >= self.config.cool_down {
                    c.public.state = CircuitState::HalfOpen;
                    c.public.consecutive_successes = 0;
                    c.trial_in_flight = true;
                    drop(c);
                    record_transition(key, CircuitState::Open, CircuitState::HalfOpen);
                    Ok(permit(true))
                } else {
                    let remaining = self.config.cool_down - elapsed;
                    debug!(
                        circuit = %key,
                        remaining_ms = %remaining.as_millis(),
                        "Circuit open, request rejected"
                    );
                    increment_counter!("circuit_breaker_rejections_total", "dependency" => key.to_string());
                    Err(Error::circuit_open(key).context("retry_after_ms", remaining.as_millis() as u64))
                }
            }
            CircuitState::HalfOpen => {
                if c.trial_in_flight {
                    increment_counter!("circuit_breaker_rejections_total", "dependency" => key.to_string());
                    Err(Error::circuit_open(key).context("half_open_trial_in_flight", true))
                } else {
                    c.trial_in_flight = true;
                    Ok(permit(true))
                }
            }
        }
    }

    /// Records a successful call admitted by `permit`
    pub fn record_success(&self, key: &str, permit: BreakerPermit) {
        let trial = permit.trial;
        let circuit = permit.settle();
        let mut c = lock(&circuit);
        if trial {
            c.trial_in_flight = false;
        }

        match c.public.state {
            CircuitState::Closed => {
                c.public.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                c.public.consecutive_failures = 0;
                c.public.consecutive_successes += 1;
                if c.public.consecutive_successes >= self.config.success_threshold {
                    c.close();
                    drop(c);
                    info!(circuit = %key, "Circuit CLOSED: dependency recovered");
                    record_transition(key, CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late.
                debug!(circuit = %key, "ignoring late success while circuit is open");
            }
        }
    }

    /// Records a failed call admitted by `permit`
    pub fn record_failure(&self, key: &str, permit: BreakerPermit) {
        let trial = permit.trial;
        let circuit = permit.settle();
        let mut c = lock(&circuit);
        if trial {
            c.trial_in_flight = false;
        }

        match c.public.state {
            CircuitState::Closed => {
                c.public.consecutive_successes = 0;
                c.public.consecutive_failures += 1;
                if c.public.consecutive_failures >= self.config.failure_threshold {
                    c.open();
                    let failures = c.public.consecutive_failures;
                    drop(c);
                    warn!(
                        circuit = %key,
                        failures = failures,
                        threshold = self.config.failure_threshold,
                        "Circuit OPEN: failure threshold reached"
                    );
                    record_transition(key, CircuitState::Closed, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                c.public.consecutive_failures += 1;
                c.open();
                drop(c);
                warn!(circuit = %key, "Circuit OPEN: half-open trial failed");
                record_transition(key, CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Open => {
                c.public.consecutive_failures += 1;
            }
        }
    }

    /// Releases a permit without counting the outcome, used for failures
    /// that say nothing about the dependency's health.
    pub fn release(&self, key: &str, permit: BreakerPermit) {
        let trial = permit.trial;
        let circuit = permit.settle();
        if trial {
            lock(&circuit).trial_in_flight = false;
            debug!(circuit = %key, "half-open trial released without an outcome");
        }
    }

    /// Read-only copy of the state for `key` (CLOSED if never used)
    pub fn snapshot(&self, key: &str) -> CircuitBreakerState {
        match self.circuits.get(key) {
            Some(entry) => {
                let circuit = Arc::clone(entry.value());
                drop(entry);
                let c = lock(&circuit);
                c.public.clone()
            }
            None => CircuitBreakerState::default(),
        }
    }

    /// Convenience accessor for the current state of `key`
    pub fn state(&self, key: &str) -> CircuitState {
        self.snapshot(key).state
    }

    /// Forces the circuit for `key` back to CLOSED
    pub fn reset(&self, key: &str) {
        let circuit = self.circuit(key);
        let previous = {
            let mut c = lock(&circuit);
            let previous = c.public.state;
            c.close();
            c.trial_in_flight = false;
            previous
        };
        if previous != CircuitState::Closed {
            info!(circuit = %key, "Circuit manually reset");
            record_transition(key, previous, CircuitState::Closed);
        }
    }

    /// Dependency keys that have been seen so far
    pub fn keys(&self) -> Vec<String> {
        self.circuits.iter().map(|e| e.key().clone()).collect()
    }
}

fn record_transition(key: &str, from: CircuitState, to: CircuitState) {
    increment_counter!(
        "circuit_breaker_transitions_total",
        "dependency" => key.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    );
    gauge!("circuit_breaker_state", to.as_gauge(), "dependency" => key.to_string());
}

fn lock(circuit: &Mutex<Circuit>) -> MutexGuard<'_, Circuit> {
    circuit.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(failures: u32, successes: u32, cool_down: Duration) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            cool_down,
        })
    }

    fn fail(reg: &CircuitBreakerRegistry, key: &str) {
        let permit = reg.try_acquire(key).expect("call should be admitted");
        reg.record_failure(key, permit);
    }

    fn succeed(reg: &CircuitBreakerRegistry, key: &str) {
        let permit = reg.try_acquire(key).expect("call should be admitted");
        reg.record_success(key, permit);
    }

    #[test]
    fn test_initial_state_is_closed() {
        let reg = CircuitBreakerRegistry::default();
        assert_eq!(reg.snapshot("dep"), CircuitBreakerState::default());
        assert!(reg.try_acquire("dep").is_ok());
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let reg = registry(3, 2, Duration::from_secs(60));
        fail(&reg, "dep");
        fail(&reg, "dep");
        assert_eq!(reg.state("dep"), CircuitState::Closed);
        fail(&reg, "dep");

        let snapshot = reg.snapshot("dep");
        assert_eq!(snapshot.state, CircuitState::Open);
        assert!(snapshot.opened_at.is_some());

        let err = reg.try_acquire("dep").unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::CircuitOpen);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let reg = registry(3, 2, Duration::from_secs(60));
        fail(&reg, "dep");
        fail(&reg, "dep");
        succeed(&reg, "dep");
        let snapshot = reg.snapshot("dep");
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.consecutive_successes, 0);
        fail(&reg, "dep");
        fail(&reg, "dep");
        assert_eq!(reg.state("dep"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let reg = registry(1, 2, Duration::from_secs(10));
        fail(&reg, "dep");
        assert_eq!(reg.state("dep"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;

        let permit = reg.try_acquire("dep").unwrap();
        assert!(permit.is_trial());
        assert_eq!(reg.state("dep"), CircuitState::HalfOpen);
        reg.record_success("dep", permit);

        let snapshot = reg.snapshot("dep");
        assert_eq!(snapshot.state, CircuitState::HalfOpen);
        assert_eq!(snapshot.consecutive_successes, 1);
        assert_eq!(snapshot.consecutive_failures, 0);

        succeed(&reg, "dep");
        assert_eq!(reg.snapshot("dep"), CircuitBreakerState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let reg = registry(1, 2, Duration::from_secs(10));
        fail(&reg, "dep");
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&reg, "dep");
        assert_eq!(reg.state("dep"), CircuitState::HalfOpen);
        fail(&reg, "dep");

        let snapshot = reg.snapshot("dep");
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_successes, 0);
        assert!(reg.try_acquire("dep").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_trial_at_a_time() {
        let reg = registry(1, 2, Duration::from_secs(1));
        fail(&reg, "dep");
        tokio::time::advance(Duration::from_secs(2)).await;

        let trial = reg.try_acquire("dep").unwrap();
        assert!(reg.try_acquire("dep").is_err());
        reg.release("dep", trial);
        assert!(reg.try_acquire("dep").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_permit_reopens_circuit() {
        let reg = registry(1, 1, Duration::from_secs(10));
        fail(&reg, "dep");
        tokio::time::advance(Duration::from_secs(11)).await;

        let trial = reg.try_acquire("dep").unwrap();
        drop(trial);

        let snapshot = reg.snapshot("dep");
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_successes, 0);
        assert!(reg.try_acquire("dep").is_err());

        tokio::time::advance(Duration::from_secs(11)).await;
        succeed(&reg, "dep");
        assert_eq!(reg.state("dep"), CircuitState::Closed);
    }

    #[test]
    fn test_dropped_closed_permit_changes_nothing() {
        let reg = registry(1, 1, Duration::from_secs(10));
        drop(reg.try_acquire("dep").unwrap());
        assert_eq!(reg.snapshot("dep"), CircuitBreakerState::default());
    }

    #[test]
    fn test_keys_are_isolated() {
        let reg = registry(2, 1, Duration::from_secs(60));
        fail(&reg, "planner:llama3");
        fail(&reg, "planner:llama3");
        assert_eq!(reg.state("planner:llama3"), CircuitState::Open);
        assert_eq!(reg.state("scheduler:llama3"), CircuitState::Closed);
        assert!(reg.try_acquire("scheduler:llama3").is_ok());
    }

    #[test]
    fn test_reset_closes_circuit() {
        let reg = registry(1, 1, Duration::from_secs(60));
        fail(&reg, "dep");
        assert_eq!(reg.state("dep"), CircuitState::Open);
        reg.reset("dep");
        assert_eq!(reg.state("dep"), CircuitState::Closed);
        assert!(reg.try_acquire("dep").is_ok());
    }
}

use crate::config::CircuitBreakerConfig;
use crate::resilience::Dependency;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls flow through.
    Closed,
    /// Dependency is failing, calls are rejected immediately.
    Open,
    /// Cooldown elapsed, a single probe call decides what happens next.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal mutable state for a single circuit breaker.
struct CircuitData {
    state: CircuitState,
    /// Rolling window of `(recorded_at, succeeded)` outcomes while closed.
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    /// Only one probe may run while half-open.
    probe_in_flight: bool,
}

impl CircuitData {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            outcomes: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, ok)| !ok).count()
    }
}

/// Circuit breaker guarding one dependency.
///
/// - `Closed` -> `Open` once the window holds at least `minimum_calls`
///   outcomes and the failure ratio reaches `failure_ratio`
/// - `Open` -> `HalfOpen` when the cooldown has elapsed and a call arrives
/// - `HalfOpen` -> `Closed` when the probe succeeds
/// - `HalfOpen` -> `Open` when the probe fails, restarting the cooldown
///
/// Time is read from the tokio clock so paused-time tests drive it
/// deterministically.
pub struct CircuitBreaker {
    dependency: Dependency,
    config: CircuitBreakerConfig,
    data: Mutex<CircuitData>,
}

/// Admission ticket for one call through the breaker.
///
/// Report the outcome with [`BreakerPermit::succeeded`] or
/// [`BreakerPermit::failed`]. A permit dropped without a verdict (the caller
/// was cancelled) records nothing but frees the half-open probe slot.
#[must_use = "report the call outcome through the permit"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record(self.probe, true);
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.record(self.probe, false);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            let mut data = self.breaker.data.lock();
            if data.state == CircuitState::HalfOpen {
                data.probe_in_flight = false;
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(dependency: Dependency, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency,
            config,
            data: Mutex::new(CircuitData::new()),
        }
    }

    /// Ask to let a call through.
    ///
    /// Returns `None` when the call must fail fast. May move an open circuit
    /// to half-open if its cooldown has elapsed, in which case the returned
    /// permit is the probe.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        let mut data = self.data.lock();

        let probe = match data.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled_down = data
                    .opened_at
                    .map_or(true, |opened| opened.elapsed() >= self.config.cooldown());
                if !cooled_down {
                    return None;
                }
                self.transition(&mut data, CircuitState::HalfOpen);
                data.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if data.probe_in_flight {
                    return None;
                }
                data.probe_in_flight = true;
                true
            }
        };

        Some(BreakerPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn record(&self, probe: bool, success: bool) {
        let mut data = self.data.lock();
        let now = Instant::now();

        match data.state {
            CircuitState::Closed => {
                data.outcomes.push_back((now, success));
                self.evict_stale(&mut data, now);

                let total = data.outcomes.len();
                if total < self.config.minimum_calls {
                    return;
                }
                let ratio = data.failures() as f64 / total as f64;
                if ratio >= self.config.failure_ratio {
                    warn!(
                        dependency = %self.dependency,
                        failures = data.failures(),
                        calls = total,
                        threshold = self.config.failure_ratio,
                        "circuit breaker opening"
                    );
                    data.opened_at = Some(now);
                    self.transition(&mut data, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if probe => {
                data.probe_in_flight = false;
                if success {
                    data.outcomes.clear();
                    data.opened_at = None;
                    self.transition(&mut data, CircuitState::Closed);
                } else {
                    info!(
                        dependency = %self.dependency,
                        "circuit breaker re-opening after failed probe"
                    );
                    data.opened_at = Some(now);
                    self.transition(&mut data, CircuitState::Open);
                }
            }
            // Calls admitted before the circuit opened may finish late; the
            // probe alone decides recovery.
            CircuitState::HalfOpen | CircuitState::Open => {
                debug!(
                    dependency = %self.dependency,
                    success,
                    "ignoring outcome of a call admitted before the circuit opened"
                );
            }
        }
    }

    fn evict_stale(&self, data: &mut CircuitData, now: Instant) {
        let window = self.config.window();
        while let Some(&(at, _)) = data.outcomes.front() {
            if data.outcomes.len() > self.config.window_size || now.duration_since(at) > window {
                data.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, data: &mut CircuitData, to: CircuitState) {
        let from = data.state;
        data.state = to;

        info!(
            dependency = %self.dependency,
            from = %from,
            to = %to,
            "circuit breaker state change"
        );
        metrics::counter!(
            "picture.circuit.transitions",
            "dependency" => self.dependency.as_str(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        metrics::gauge!("picture.circuit.state", "dependency" => self.dependency.as_str())
            .set(to.gauge_value());
    }

    /// Current state without triggering transitions.
    pub fn state(&self) -> CircuitState {
        self.data.lock().state
    }

    /// Failure ratio of the outcomes currently in the window.
    pub fn failure_ratio(&self) -> f64 {
        let data = self.data.lock();
        if data.outcomes.is_empty() {
            0.0
        } else {
            data.failures() as f64 / data.outcomes.len() as f64
        }
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Force the breaker back to `Closed` with an empty window.
    pub fn reset(&self) {
        let mut data = self.data.lock();
        data.outcomes.clear();
        data.opened_at = None;
        data.probe_in_flight = false;
        if data.state != CircuitState::Closed {
            self.transition(&mut data, CircuitState::Closed);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.lock();
        f.debug_struct("CircuitBreaker")
            .field("dependency", &self.dependency)
            .field("config", &self.config)
            .field("state", &data.state)
            .field("window", &data.outcomes.len())
            .finish_non_exhaustive()
    }
}

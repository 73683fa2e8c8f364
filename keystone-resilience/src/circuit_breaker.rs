//! Circuit breaker used by breaker policies
//!
//! A breaker is created per composed chain, so its state only spans the
//! attempts made while recovering from one failure occurrence.

use keystone_core::{Failure, PolicyDefinition};
use keystone_logging::Logger;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    /// Calls are rejected until the break duration has passed
    Open,
    /// The next call decides between closing and breaking again
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// When a closed circuit opens
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerMode {
    /// Open once consecutive failures exceed `failures_allowed`
    Consecutive { failures_allowed: u32 },
    /// Open once the failure ratio inside `sampling` reaches `failure_threshold`,
    /// provided at least `min_throughput` calls were sampled
    Sampled {
        failure_threshold: f64,
        sampling: Duration,
        min_throughput: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub mode: BreakerMode,
    /// How long the circuit stays open before a trial call
    pub break_duration: Duration,
}

impl CircuitBreakerConfig {
    /// Breaker configuration of a breaker policy, `None` for other policies
    pub fn for_policy(definition: &PolicyDefinition) -> Option<Self> {
        match definition {
            PolicyDefinition::CircuitBreaker {
                failures_allowed,
                break_duration,
            } => Some(Self {
                mode: BreakerMode::Consecutive {
                    failures_allowed: *failures_allowed,
                },
                break_duration: *break_duration,
            }),
            PolicyDefinition::AdvancedCircuitBreaker {
                failure_threshold,
                sampling,
                min_throughput,
                break_duration,
            } => Some(Self {
                mode: BreakerMode::Sampled {
                    failure_threshold: *failure_threshold,
                    sampling: *sampling,
                    min_throughput: *min_throughput,
                },
                break_duration: *break_duration,
            }),
            _ => None,
        }
    }
}

/// Counters kept for one breaker
#[derive(Debug, Clone, Default)]
pub struct CircuitMetrics {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    /// Calls refused with a `CircuitOpen` failure
    pub rejected: u64,
    pub breaks: u32,
    pub failure_streak: u32,
}

/// Breaker shared by the layers of one chain
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: Arc<CircuitBreakerConfig>,
    cell: Arc<Mutex<BreakerCell>>,
    logger: Arc<dyn Logger>,
}

struct BreakerCell {
    state: CircuitState,
    metrics: CircuitMetrics,
    opened_at: Option<Instant>,
    /// Outcomes inside the sampling window, `true` for success
    samples: Vec<(Instant, bool)>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, logger: Arc<dyn Logger>) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
            cell: Arc::new(Mutex::new(BreakerCell {
                state: CircuitState::Closed,
                metrics: CircuitMetrics::default(),
                opened_at: None,
                samples: Vec::new(),
            })),
            logger,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let mut cell = self.cell.lock();
        self.refresh(&mut cell);
        cell.state
    }

    /// Let a call through, or reject it with a `CircuitOpen` failure
    pub fn try_acquire(&self) -> Result<(), Failure> {
        let mut cell = self.cell.lock();
        self.refresh(&mut cell);

        if cell.state == CircuitState::Open {
            cell.metrics.rejected += 1;
            let remaining = cell
                .opened_at
                .map(|at| self.config.break_duration.saturating_sub(at.elapsed()))
                .unwrap_or_default();
            return Err(Failure::circuit_open(format!(
                "circuit '{}' is open for another {} ms",
                self.name,
                remaining.as_millis()
            )));
        }

        Ok(())
    }

    pub fn record_success(&self) {
        let mut cell = self.cell.lock();
        self.refresh(&mut cell);

        cell.metrics.calls += 1;
        cell.metrics.successes += 1;
        cell.metrics.failure_streak = 0;
        cell.samples.push((Instant::now(), true));

        if cell.state == CircuitState::HalfOpen {
            self.close(&mut cell);
        }
        self.forget_old_samples(&mut cell);
    }

    pub fn record_failure(&self, failure: &Failure) {
        let mut cell = self.cell.lock();
        self.refresh(&mut cell);

        cell.metrics.calls += 1;
        cell.metrics.failures += 1;
        cell.metrics.failure_streak += 1;
        cell.samples.push((Instant::now(), false));

        match cell.state {
            CircuitState::Closed => {
                self.forget_old_samples(&mut cell);
                if self.tripped(&cell) {
                    self.break_circuit(&mut cell, failure);
                }
            }
            CircuitState::HalfOpen => self.break_circuit(&mut cell, failure),
            CircuitState::Open => {}
        }
    }

    pub fn metrics(&self) -> CircuitMetrics {
        self.cell.lock().metrics.clone()
    }

    /// Move an open circuit to half-open once the break has elapsed
    fn refresh(&self, cell: &mut BreakerCell) {
        let elapsed = match (cell.state, cell.opened_at) {
            (CircuitState::Open, Some(opened_at)) => opened_at.elapsed(),
            _ => return,
        };
        if elapsed >= self.config.break_duration {
            cell.state = CircuitState::HalfOpen;
            self.logger.info(&format!(
                "Breaker '{}': half-open, next call is a trial",
                self.name
            ));
        }
    }

    fn tripped(&self, cell: &BreakerCell) -> bool {
        match &self.config.mode {
            BreakerMode::Consecutive { failures_allowed } => cell.metrics.failure_streak > *failures_allowed,
            BreakerMode::Sampled {
                failure_threshold,
                min_throughput,
                ..
            } => {
                let sampled = cell.samples.len();
                if sampled == 0 || (sampled as u64) < u64::from(*min_throughput) {
                    return false;
                }
                let failed = cell.samples.iter().filter(|(_, ok)| !*ok).count();
                failed as f64 / sampled as f64 >= *failure_threshold
            }
        }
    }

    fn forget_old_samples(&self, cell: &mut BreakerCell) {
        let BreakerMode::Sampled { sampling, .. } = &self.config.mode else {
            cell.samples.clear();
            return;
        };
        let now = Instant::now();
        cell.samples.retain(|(at, _)| now.duration_since(*at) < *sampling);
    }

    fn break_circuit(&self, cell: &mut BreakerCell, failure: &Failure) {
        cell.state = CircuitState::Open;
        cell.opened_at = Some(Instant::now());
        cell.metrics.breaks += 1;
        self.logger.error(
            Some(failure),
            &format!(
                "Breaker '{}': breaking the circuit for {} ms",
                self.name,
                self.config.break_duration.as_millis()
            ),
        );
    }

    fn close(&self, cell: &mut BreakerCell) {
        cell.state = CircuitState::Closed;
        cell.opened_at = None;
        cell.metrics.failure_streak = 0;
        cell.samples.clear();
        self.logger.info(&format!(
            "Breaker '{}': call ok, closed the circuit again",
            self.name
        ));
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

//! Sampling-window circuit breaker.
//!
//! Every guarded execution contributes one sample. Once the window holds at
//! least `minimum_throughput` samples and the failure ratio reaches
//! `failure_ratio`, the circuit opens for `break_duration`. After that a
//! single trial call is let through; its outcome closes or re-opens the circuit.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::time::Instant;
use tracing::{info, warn};

use super::CircuitBreakerOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
    /// Cancelled executions say nothing about the health of the operation.
    Ignored,
}

#[derive(Debug)]
enum Circuit {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    circuit: Circuit,
    samples: VecDeque<(Instant, bool)>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    options: CircuitBreakerOptions,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(options: CircuitBreakerOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(Inner {
                circuit: Circuit::Closed,
                samples: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.circuit {
            Circuit::Closed => CircuitState::Closed,
            Circuit::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
            Circuit::Open { .. } => CircuitState::Open,
            Circuit::HalfOpen => CircuitState::HalfOpen,
        }
    }

    /// Ask to run one execution. Returns `None` while the circuit is open
    /// or while a half-open trial call is already in flight.
    ///
    /// The permit must be completed with an outcome; a permit dropped
    /// without one counts as [`Outcome::Ignored`], so an abandoned trial call
    /// hands the next caller its turn.
    pub(crate) fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        let admitted = match inner.circuit {
            Circuit::Closed => true,
            Circuit::Open { until } if Instant::now() >= until => {
                inner.circuit = Circuit::HalfOpen;
                true
            }
            Circuit::Open { .. } | Circuit::HalfOpen => false,
        };
        admitted.then_some(Permit {
            breaker: self,
            recorded: false,
        })
    }

    pub(crate) fn record(&self, outcome: Outcome) {
        let now = Instant::now();
        let mut inner = self.lock();

        if matches!(inner.circuit, Circuit::HalfOpen) {
            match outcome {
                Outcome::Success => {
                    info!("Circuit closed after successful trial call");
                    inner.circuit = Circuit::Closed;
                    inner.samples.clear();
                }
                Outcome::Failure => {
                    warn!(break_ms = self.options.break_duration_ms, "Trial call failed, circuit re-opened");
                    inner.circuit = Circuit::Open {
                        until: now + self.options.break_duration(),
                    };
                }
                // Let the next caller try again.
                Outcome::Ignored => inner.circuit = Circuit::Open { until: now },
            }
            return;
        }

        let failed = match outcome {
            Outcome::Success => false,
            Outcome::Failure => true,
            Outcome::Ignored => return,
        };

        inner.samples.push_back((now, failed));
        let window = self.options.sampling_duration();
        while let Some((at, _)) = inner.samples.front() {
            if now.duration_since(*at) > window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }

        let total = inner.samples.len();
        if total == 0 || total < self.options.minimum_throughput {
            return;
        }
        let failures = inner.samples.iter().filter(|(_, failed)| *failed).count();
        let ratio = failures as f64 / total as f64;
        if ratio >= self.options.failure_ratio {
            warn!(
                failures,
                total,
                ratio,
                break_ms = self.options.break_duration_ms,
                "Failure ratio exceeded, circuit opened"
            );
            inner.circuit = Circuit::Open {
                until: now + self.options.break_duration(),
            };
            inner.samples.clear();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One admitted execution.
#[must_use]
pub(crate) struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    recorded: bool,
}

impl Permit<'_> {
    pub(crate) fn complete(mut self, outcome: Outcome) {
        self.recorded = true;
        self.breaker.record(outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.record(Outcome::Ignored);
        }
    }
}

//! Step-by-step execution with compensation.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Result, SagaError};

/// One unit of work and how to undo it.
#[async_trait]
pub trait SagaStep<S: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, state: &mut S) -> Result<()>;

    /// Undo a completed [`execute`](Self::execute). Defaults to nothing.
    async fn compensate(&self, _state: &mut S) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStatus {
    Running,
    Completed,
    Compensating,
    /// A step failed and every completed step was undone.
    Compensated,
    /// A step failed and at least one compensation also failed.
    Failed,
}

/// Outcome of [`SagaExecution::run`].
#[derive(Debug, Clone)]
pub struct SagaExecutionReport {
    pub status: SagaStatus,
    /// Steps that executed successfully, in order.
    pub completed: Vec<String>,
    /// Steps compensated, in the order compensations ran.
    pub compensated: Vec<String>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
}

impl SagaExecutionReport {
    pub fn is_completed(&self) -> bool {
        self.status == SagaStatus::Completed
    }
}

/// Ordered steps run against a shared state.
///
/// When a step fails, or the token is cancelled between steps, the steps
/// already completed are compensated in reverse order.
pub struct SagaExecution<S: Send> {
    steps: Vec<Box<dyn SagaStep<S>>>,
}

impl<S: Send> Default for SagaExecution<S> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<S: Send> fmt::Debug for SagaExecution<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|step| step.name()).collect();
        f.debug_struct("SagaExecution").field("steps", &names).finish()
    }
}

impl<S: Send> SagaExecution<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: impl SagaStep<S> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub async fn run(&self, state: &mut S, cancel: &CancellationToken) -> SagaExecutionReport {
        let mut report = SagaExecutionReport {
            status: SagaStatus::Running,
            completed: Vec::new(),
            compensated: Vec::new(),
            failed_step: None,
            error: None,
        };

        let mut done = 0;
        for step in &self.steps {
            let result = if cancel.is_cancelled() {
                Err(SagaError::Cancelled)
            } else {
                step.execute(state).await
            };

            match result {
                Ok(()) => {
                    debug!(step = step.name(), "Saga step completed");
                    report.completed.push(step.name().to_string());
                    done += 1;
                }
                Err(e) => {
                    warn!(step = step.name(), error = %e, "Saga step failed, compensating");
                    report.failed_step = Some(step.name().to_string());
                    report.error = Some(e.to_string());
                    report.status = SagaStatus::Compensating;
                    break;
                }
            }
        }

        if report.status == SagaStatus::Running {
            info!(steps = done, "Saga execution completed");
            report.status = SagaStatus::Completed;
            return report;
        }

        let mut all_compensated = true;
        for step in self.steps[..done].iter().rev() {
            match step.compensate(state).await {
                Ok(()) => {
                    debug!(step = step.name(), "Saga step compensated");
                    report.compensated.push(step.name().to_string());
                }
                Err(e) => {
                    error!(step = step.name(), error = %e, "Saga compensation failed");
                    all_compensated = false;
                }
            }
        }

        report.status = if all_compensated {
            SagaStatus::Compensated
        } else {
            SagaStatus::Failed
        };
        report
    }
}

//! Retry and circuit-breaker policies for transport operations.
//!
//! A [`ResiliencePipeline`] is built from [`TransportResilienceOptions`]. The
//! circuit breaker wraps the retry loop, so one guarded execution (with all
//! of its retries) counts as a single breaker sample. With both policies
//! disabled the pipeline is empty and [`wrap_send`]/[`wrap_publish`] return
//! the inner transport unchanged.

mod backoff;
mod circuit_breaker;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::message::TransportMessage;
use crate::transport::{PublishTransport, Result, SendTransport, TransportError};

pub use circuit_breaker::{CircuitBreaker, CircuitState};
use circuit_breaker::Outcome;

// ============================================================================
// Options
// ============================================================================

/// Shape of the delay between retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffType {
    Constant,
    Linear,
    #[default]
    Exponential,
}

/// Retry policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Retries after the first attempt.
    pub max_retry_attempts: usize,
    /// Base delay in milliseconds.
    pub delay_ms: u64,
    pub backoff: BackoffType,
    pub use_jitter: bool,
    /// Upper bound on a single delay in milliseconds.
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            delay_ms: 200,
            backoff: BackoffType::Exponential,
            use_jitter: true,
            max_delay_ms: None,
        }
    }
}

impl RetryOptions {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_ms.map(Duration::from_millis)
    }
}

/// Circuit breaker policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerOptions {
    /// Failure ratio (0.0 to 1.0) within the sampling window that opens the circuit.
    pub failure_ratio: f64,
    /// Samples required in the window before the ratio is evaluated.
    pub minimum_throughput: usize,
    pub sampling_duration_ms: u64,
    pub break_duration_ms: u64,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            minimum_throughput: 10,
            sampling_duration_ms: 30_000,
            break_duration_ms: 10_000,
        }
    }
}

impl CircuitBreakerOptions {
    pub fn sampling_duration(&self) -> Duration {
        Duration::from_millis(self.sampling_duration_ms)
    }

    pub fn break_duration(&self) -> Duration {
        Duration::from_millis(self.break_duration_ms)
    }
}

/// Resilience settings for a host or a single receive endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransportResilienceOptions {
    pub enable_retry: bool,
    pub enable_circuit_breaker: bool,
    pub retry: RetryOptions,
    pub circuit_breaker: CircuitBreakerOptions,
}

impl Default for TransportResilienceOptions {
    fn default() -> Self {
        Self {
            enable_retry: true,
            enable_circuit_breaker: true,
            retry: RetryOptions::default(),
            circuit_breaker: CircuitBreakerOptions::default(),
        }
    }
}

impl TransportResilienceOptions {
    /// Both policies off.
    pub fn disabled() -> Self {
        Self {
            enable_retry: false,
            enable_circuit_breaker: false,
            ..Self::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.enable_retry = true;
        self.retry = retry;
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.enable_retry = false;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerOptions) -> Self {
        self.enable_circuit_breaker = true;
        self.circuit_breaker = breaker;
        self
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.enable_circuit_breaker = false;
        self
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug)]
struct Policies {
    retry: Option<RetryOptions>,
    breaker: Option<CircuitBreaker>,
}

/// Executes operations under the configured retry and circuit-breaker
/// policies. Clones share one breaker.
#[derive(Debug, Clone, Default)]
pub struct ResiliencePipeline {
    policies: Option<Arc<Policies>>,
}

impl ResiliencePipeline {
    /// Build a pipeline; `None` or both policies disabled yields an empty one.
    pub fn new(options: Option<&TransportResilienceOptions>) -> Self {
        let Some(options) = options else {
            return Self::empty();
        };
        if !options.enable_retry && !options.enable_circuit_breaker {
            return Self::empty();
        }

        Self {
            policies: Some(Arc::new(Policies {
                retry: options.enable_retry.then(|| options.retry.clone()),
                breaker: options
                    .enable_circuit_breaker
                    .then(|| CircuitBreaker::new(options.circuit_breaker.clone())),
            })),
        }
    }

    pub fn empty() -> Self {
        Self { policies: None }
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_none()
    }

    /// Breaker state, or `None` when no breaker is configured.
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.policies
            .as_ref()
            .and_then(|p| p.breaker.as_ref())
            .map(CircuitBreaker::state)
    }

    /// Run `operation` under the pipeline.
    ///
    /// An empty pipeline calls `operation` exactly once and returns its
    /// result untouched.
    pub async fn execute<T, F, Fut>(&self, mut operation: F, cancel: &CancellationToken) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(policies) = &self.policies else {
            return operation().await;
        };

        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let permit = match &policies.breaker {
            Some(breaker) => Some(breaker.try_acquire().ok_or_else(|| {
                TransportError::CircuitOpen("circuit is open, call rejected".to_string())
            })?),
            None => None,
        };

        let result = run_with_retry(policies.retry.as_ref(), &mut operation, cancel).await;

        if let Some(permit) = permit {
            permit.complete(match &result {
                Ok(_) => Outcome::Success,
                Err(TransportError::Cancelled) => Outcome::Ignored,
                Err(_) => Outcome::Failure,
            });
        }
        result
    }
}

async fn run_with_retry<T, F, Fut>(
    retry: Option<&RetryOptions>,
    operation: &mut F,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = retry.map(backoff::delays);
    let mut attempt = 1usize;

    loop {
        match operation().await {
            Err(error) if error.is_retryable() => {
                let Some(delay) = delays.as_mut().and_then(|d| d.next()) else {
                    return Err(error);
                };
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying operation");
                attempt += 1;
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            other => return other,
        }
    }
}

// ============================================================================
// Transport wrappers
// ============================================================================

struct ResilientSendTransport {
    inner: Arc<dyn SendTransport>,
    pipeline: ResiliencePipeline,
}

#[async_trait]
impl SendTransport for ResilientSendTransport {
    async fn send(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        self.pipeline
            .execute(move || inner.send(message, cancel), cancel)
            .await
    }
}

struct ResilientPublishTransport {
    inner: Arc<dyn PublishTransport>,
    pipeline: ResiliencePipeline,
}

#[async_trait]
impl PublishTransport for ResilientPublishTransport {
    async fn publish(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        self.pipeline
            .execute(move || inner.publish(message, cancel), cancel)
            .await
    }
}

/// Decorate a send transport; an empty pipeline returns `transport` itself.
pub fn wrap_send(
    transport: Arc<dyn SendTransport>,
    pipeline: &ResiliencePipeline,
) -> Arc<dyn SendTransport> {
    if pipeline.is_empty() {
        return transport;
    }
    Arc::new(ResilientSendTransport {
        inner: transport,
        pipeline: pipeline.clone(),
    })
}

/// Decorate a publish transport; an empty pipeline returns `transport` itself.
pub fn wrap_publish(
    transport: Arc<dyn PublishTransport>,
    pipeline: &ResiliencePipeline,
) -> Arc<dyn PublishTransport> {
    if pipeline.is_empty() {
        return transport;
    }
    Arc::new(ResilientPublishTransport {
        inner: transport,
        pipeline: pipeline.clone(),
    })
}

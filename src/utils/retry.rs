//! Backoff schedules shared by the saga orchestrator and the broker hosts.
//!
//! Both are `backon` builders. Callers walk the built iterator themselves
//! and inspect each failure before taking the next delay.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Wait before re-reading a saga instance whose save lost a version race:
/// 10ms up to 2s, jittered. After ten retries the orchestrator reports
/// `ConcurrencyConflict`.
pub fn saga_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(10)
        .with_jitter()
}

/// Wait between broker reconnects, at bootstrap and after a consumer loses
/// its channel. 100ms up to 5s, for at most 30 retries.
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Delays between attempts, first attempt immediate.
pub fn attempt_delays(backoff: ExponentialBuilder) -> impl Iterator<Item = Duration> {
    use backon::BackoffBuilder;
    std::iter::once(Duration::ZERO).chain(backoff.build())
}

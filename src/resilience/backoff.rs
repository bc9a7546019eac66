//! Retry delay schedules.

use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};
use rand::Rng;

use super::{BackoffType, RetryOptions};

/// Delays between attempts; yields one item per permitted retry.
pub(crate) type Delays = Box<dyn Iterator<Item = Duration> + Send>;

/// Delays for `options`. `max_delay`, when set, bounds every delay after
/// jitter is applied.
pub(crate) fn delays(options: &RetryOptions) -> Delays {
    let schedule = schedule(options);
    match options.max_delay() {
        Some(max) => Box::new(schedule.map(move |delay| delay.min(max))),
        None => schedule,
    }
}

fn schedule(options: &RetryOptions) -> Delays {
    let base = options.delay();
    let times = options.max_retry_attempts;

    match options.backoff {
        BackoffType::Exponential => {
            let mut builder = ExponentialBuilder::default()
                .with_min_delay(base)
                .with_max_times(times);
            if let Some(max) = options.max_delay() {
                builder = builder.with_max_delay(max);
            }
            if options.use_jitter {
                builder = builder.with_jitter();
            }
            Box::new(builder.build())
        }
        BackoffType::Constant => {
            let mut builder = ConstantBuilder::default()
                .with_delay(base)
                .with_max_times(times);
            if options.use_jitter {
                builder = builder.with_jitter();
            }
            Box::new(builder.build())
        }
        BackoffType::Linear => Box::new(LinearBackoff {
            base,
            jitter: options.use_jitter,
            attempt: 0,
            times,
        }),
    }
}

/// `base * n` for the n-th retry, optionally jittered.
#[derive(Debug)]
struct LinearBackoff {
    base: Duration,
    jitter: bool,
    attempt: usize,
    times: usize,
}

impl Iterator for LinearBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.times {
            return None;
        }
        self.attempt += 1;

        let factor = u32::try_from(self.attempt).unwrap_or(u32::MAX);
        let mut delay = self.base.saturating_mul(factor);
        if self.jitter && !self.base.is_zero() {
            let extra = rand::rng().random_range(0..=self.base.as_millis() as u64);
            delay += Duration::from_millis(extra);
        }
        Some(delay)
    }
}

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Per-platform retry budget and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retry_max: u32,
    min_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(retry_max: u32) -> Self {
        Self { retry_max, min_delay: DEFAULT_MIN_DELAY, max_delay: DEFAULT_MAX_DELAY }
    }

    #[must_use]
    pub const fn with_delays(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay;
        self
    }

    /// A fresh delay schedule for one job.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        let delays = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.retry_max as usize)
            .build();
        Backoff { delays, last: Duration::ZERO, max: self.max_delay }
    }
}

/// Delays between the attempts of one job. Never shrinks and never exceeds the policy maximum.
pub struct Backoff {
    delays: ExponentialBackoff,
    last: Duration,
    max: Duration,
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff").field("last", &self.last).field("max", &self.max).finish_non_exhaustive()
    }
}

impl Backoff {
    /// Returns the wait before the next attempt, or `None` once the retry budget is spent.
    ///
    /// A gateway supplied `retry_after` can raise the delay up to the maximum but never lower it.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Option<Duration> {
        let scheduled = self.delays.next()?;
        let hinted = retry_after.unwrap_or_default().min(self.max);
        let delay = scheduled.max(hinted).max(self.last);
        self.last = delay;
        Some(delay)
    }
}

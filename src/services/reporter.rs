use crate::domain::job::{Platform, mask_token};
use crate::domain::outcome::{FailureKind, PushResult, PushStatus};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{KeyValue, global};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives the terminal outcome of every job.
pub trait ResultReporter: Send + Sync + fmt::Debug {
    fn report(&self, result: &PushResult);
}

#[derive(Clone, Debug)]
pub(crate) struct Metrics {
    pub(crate) sent: Counter<u64>,
    pub(crate) errors: Counter<u64>,
    pub(crate) invalidated_tokens: Counter<u64>,
    pub(crate) retries: Counter<u64>,
    pub(crate) jobs_submitted: Counter<u64>,
    pub(crate) jobs_rejected: Counter<u64>,
    pub(crate) send_duration: Histogram<f64>,
}

impl Metrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("pushgate");
        Self {
            sent: meter
                .u64_counter("push_sent_total")
                .with_description("Total number of push notifications successfully sent")
                .build(),
            errors: meter
                .u64_counter("push_errors_total")
                .with_description("Total number of push notification delivery errors")
                .build(),
            invalidated_tokens: meter
                .u64_counter("push_invalidated_tokens_total")
                .with_description("Total number of device tokens reported invalid by a gateway")
                .build(),
            retries: meter
                .u64_counter("push_retries_total")
                .with_description("Total number of send attempts beyond the first")
                .build(),
            jobs_submitted: meter
                .u64_counter("push_jobs_submitted_total")
                .with_description("Total number of jobs accepted into the queue")
                .build(),
            jobs_rejected: meter
                .u64_counter("push_jobs_rejected_total")
                .with_description("Total number of jobs refused at submission")
                .build(),
            send_duration: meter
                .f64_histogram("push_send_duration_seconds")
                .with_description("Duration of one send attempt against a gateway")
                .with_unit("s")
                .build(),
        }
    }
}

/// Default reporter: one log line per outcome plus OpenTelemetry counters.
#[derive(Debug)]
pub struct LogReporter {
    metrics: Metrics,
}

impl Default for LogReporter {
    fn default() -> Self {
        Self { metrics: Metrics::new() }
    }
}

impl LogReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultReporter for LogReporter {
    fn report(&self, result: &PushResult) {
        let platform = KeyValue::new("platform", result.platform.as_str());
        self.metrics.sent.add(result.delivered.len() as u64, std::slice::from_ref(&platform));

        for failure in &result.failures {
            self.metrics
                .errors
                .add(1, &[platform.clone(), KeyValue::new("reason", failure.kind.as_str())]);
            if failure.kind == FailureKind::InvalidToken {
                self.metrics.invalidated_tokens.add(1, std::slice::from_ref(&platform));
            }
            tracing::warn!(
                job_id = %result.job_id,
                platform = %result.platform,
                token = %mask_token(&failure.token),
                kind = %failure.kind,
                reason = %failure.reason,
                "Push delivery failed"
            );
        }

        match result.status() {
            PushStatus::Delivered => tracing::info!(
                job_id = %result.job_id,
                identifier = result.identifier.as_deref(),
                platform = %result.platform,
                tokens = result.delivered.len(),
                attempts = result.attempts,
                "Push delivered"
            ),
            status => tracing::warn!(
                job_id = %result.job_id,
                identifier = result.identifier.as_deref(),
                platform = %result.platform,
                delivered = result.delivered.len(),
                failed = result.failures.len(),
                attempts = result.attempts,
                ?status,
                "Push finished with failures"
            ),
        }
    }
}

#[derive(Debug, Default)]
struct PlatformCounters {
    success: AtomicU64,
    error: AtomicU64,
}

/// Per-platform token counters exposed through the stats endpoint.
#[derive(Debug, Default)]
pub struct DispatchStats {
    android: PlatformCounters,
    ios: PlatformCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformStats {
    pub push_success: u64,
    pub push_error: u64,
}

impl DispatchStats {
    const fn counters(&self, platform: Platform) -> &PlatformCounters {
        match platform {
            Platform::Android => &self.android,
            Platform::Ios => &self.ios,
        }
    }

    pub fn record(&self, result: &PushResult) {
        let counters = self.counters(result.platform);
        counters.success.fetch_add(result.delivered.len() as u64, Ordering::Relaxed);
        counters.error.fetch_add(result.failures.len() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self, platform: Platform) -> PlatformStats {
        let counters = self.counters(platform);
        PlatformStats {
            push_success: counters.success.load(Ordering::Relaxed),
            push_error: counters.error.load(Ordering::Relaxed),
        }
    }
}

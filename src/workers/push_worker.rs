use crate::adapters::push::{PushError, PushProvider, SendReport};
use crate::domain::job::PushJob;
use crate::domain::outcome::{FailureKind, PushResult, TokenFailure};
use crate::services::dispatcher::{EngineCore, PlatformSender};
use futures::FutureExt;
use opentelemetry::KeyValue;
use std::any::Any;
use std::borrow::Cow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// One long-lived member of the worker pool.
#[derive(Debug)]
pub struct PushWorker {
    id: usize,
    core: Arc<EngineCore>,
}

/// Accumulates the outcome of a job across its attempts.
#[derive(Debug)]
struct Progress {
    result: PushResult,
    /// Tokens that have not reached a terminal outcome yet.
    pending: Vec<String>,
}

impl Progress {
    fn new(job: &PushJob) -> Self {
        Self { result: PushResult::for_job(job), pending: job.tokens.clone() }
    }

    fn fail(&mut self, token: String, error: &PushError) {
        self.result.failures.push(TokenFailure { token, kind: error.kind(), reason: error.to_string() });
    }

    /// Folds one attempt into the result. Returns the failures worth retrying.
    fn absorb(&mut self, outcome: Result<SendReport, PushError>) -> Vec<(String, PushError)> {
        let pending = std::mem::take(&mut self.pending);
        let failures = match outcome {
            Ok(report) => {
                self.result.delivered.extend(report.delivered);
                report.failures
            }
            Err(e) => pending.into_iter().map(|token| (token, e.clone())).collect(),
        };

        let (retryable, terminal): (Vec<_>, Vec<_>) = failures.into_iter().partition(|(_, e)| e.is_retryable());
        for (token, error) in terminal {
            self.fail(token, &error);
        }
        self.pending = retryable.iter().map(|(token, _)| token.clone()).collect();
        retryable
    }

    fn give_up(&mut self, retryable: Vec<(String, PushError)>) {
        self.pending.clear();
        for (token, error) in retryable {
            self.fail(token, &error);
        }
    }

    fn abandon(&mut self) {
        for token in std::mem::take(&mut self.pending) {
            self.result.failures.push(TokenFailure {
                token,
                kind: FailureKind::Shutdown,
                reason: "abandoned at shutdown deadline".to_string(),
            });
        }
    }
}

impl PushWorker {
    pub(crate) const fn new(id: usize, core: Arc<EngineCore>) -> Self {
        Self { id, core }
    }

    pub async fn run(self) {
        tracing::debug!(worker = self.id, "Push worker started");
        loop {
            let job = tokio::select! {
                biased;
                () = self.core.abort.cancelled() => break,
                job = self.core.queue.dequeue() => job,
            };
            let Some(job) = job else { break };

            let span = tracing::info_span!("dispatch_push", job_id = %job.id, platform = %job.platform());
            let result = self.process(&job).instrument(span).await;
            self.core.finish(&result);
        }
        tracing::debug!(worker = self.id, "Push worker shutting down...");
    }

    async fn process(&self, job: &PushJob) -> PushResult {
        let Some(sender) = self.core.senders.get(job.platform()) else {
            tracing::error!("No sender configured for platform");
            return PushResult::failed(job, 0, FailureKind::Internal, "platform is disabled");
        };

        let mut progress = Progress::new(job);
        let finished = tokio::select! {
            biased;
            () = self.core.abort.cancelled() => false,
            () = self.deliver(job, sender, &mut progress) => true,
        };
        if !finished {
            tracing::warn!(attempts = progress.result.attempts, "Send abandoned at shutdown");
            progress.abandon();
        }
        progress.result
    }

    /// Runs the retry loop while holding one admission slot for the whole sequence.
    async fn deliver(&self, job: &PushJob, sender: &PlatformSender, progress: &mut Progress) {
        let _permit = self.core.admission.acquire().await;
        let platform = KeyValue::new("platform", job.platform().as_str());
        let mut backoff = sender.retry.backoff();

        loop {
            let attempt = if progress.result.attempts == 0 {
                Cow::Borrowed(job)
            } else {
                Cow::Owned(job.with_tokens(progress.pending.clone()))
            };
            progress.result.attempts += 1;

            let outcome = self.attempt(sender.provider.as_ref(), &attempt, &platform).await;
            let retryable = progress.absorb(outcome);
            if retryable.is_empty() {
                return;
            }

            if self.core.draining.is_cancelled() {
                tracing::info!(pending = retryable.len(), "Shutting down, not retrying");
                progress.give_up(retryable);
                return;
            }

            let hint = retryable.iter().filter_map(|(_, e)| e.retry_after()).max();
            let Some(delay) = backoff.next_delay(hint) else {
                tracing::debug!(attempts = progress.result.attempts, "Retry budget exhausted");
                progress.give_up(retryable);
                return;
            };

            self.core.metrics.retries.add(1, std::slice::from_ref(&platform));
            tracing::debug!(
                attempt = progress.result.attempts,
                pending = retryable.len(),
                delay_ms = duration_ms(delay),
                "Retrying push after transient failure"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.core.draining.cancelled() => {
                    progress.give_up(retryable);
                    return;
                }
            }
        }
    }

    /// One bounded call into the sender. Panics and timeouts become terminal or retryable errors.
    async fn attempt(
        &self,
        provider: &dyn PushProvider,
        job: &PushJob,
        platform: &KeyValue,
    ) -> Result<SendReport, PushError> {
        let started = Instant::now();
        let deadline = provider.deadline(job);
        let send = AssertUnwindSafe(provider.send_push(job)).catch_unwind();
        let outcome = match tokio::time::timeout(deadline, send).await {
            Ok(Ok(res)) => res,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(worker = self.id, panic = %message, "Push sender panicked");
                Err(PushError::Internal(format!("sender panicked: {message}")))
            }
            Err(_) => {
                tracing::warn!(timeout_ms = duration_ms(deadline), "Push send timed out");
                Err(PushError::Timeout)
            }
        };
        self.core
            .metrics
            .send_duration
            .record(started.elapsed().as_secs_f64(), std::slice::from_ref(platform));
        outcome
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

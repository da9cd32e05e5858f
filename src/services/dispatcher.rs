use crate::adapters::push::{ApnsPushProvider, FcmPushProvider, PushProvider};
use crate::config::{Config, ConfigError, SectionCore};
use crate::domain::job::{Platform, PushJob};
use crate::domain::outcome::{FailureKind, PushResult};
use crate::services::admission::{AdmissionController, PusherLimit};
use crate::services::queue::{JobQueue, SubmitError};
use crate::services::reporter::{DispatchStats, Metrics, PlatformStats, ResultReporter};
use crate::services::retry::RetryPolicy;
use crate::workers::PushWorker;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A platform sender together with its retry policy.
#[derive(Debug, Clone)]
pub struct PlatformSender {
    pub provider: Arc<dyn PushProvider>,
    pub retry: RetryPolicy,
}

/// The sender registered for each enabled platform.
#[derive(Debug, Clone, Default)]
pub struct Senders {
    android: Option<PlatformSender>,
    ios: Option<PlatformSender>,
}

impl Senders {
    /// Builds the senders of every enabled platform, failing fast on bad credentials.
    ///
    /// # Errors
    /// Returns the first `ConfigError` raised by a sender constructor.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut senders = Self::default();
        if config.android.enabled {
            let provider = FcmPushProvider::new(&config.android)?;
            senders = senders.register(Arc::new(provider), RetryPolicy::new(config.android.retry_max));
        }
        if config.ios.enabled {
            let provider = ApnsPushProvider::new(&config.ios)?;
            senders = senders.register(Arc::new(provider), RetryPolicy::new(config.ios.retry_max));
        }
        Ok(senders)
    }

    /// Registers `provider` for the platform it serves, replacing any previous sender.
    #[must_use]
    pub fn register(mut self, provider: Arc<dyn PushProvider>, retry: RetryPolicy) -> Self {
        let platform = provider.platform();
        let sender = Some(PlatformSender { provider, retry });
        match platform {
            Platform::Android => self.android = sender,
            Platform::Ios => self.ios = sender,
        }
        self
    }

    #[must_use]
    pub const fn get(&self, platform: Platform) -> Option<&PlatformSender> {
        match platform {
            Platform::Android => self.android.as_ref(),
            Platform::Ios => self.ios.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub pusher_max: u64,
}

impl From<&SectionCore> for EngineSettings {
    fn from(core: &SectionCore) -> Self {
        Self { workers: core.workers, queue_capacity: core.queues, pusher_max: core.pusher_max }
    }
}

/// State shared by the engine handle and every worker.
#[derive(Debug)]
pub(crate) struct EngineCore {
    pub(crate) queue: JobQueue,
    pub(crate) admission: AdmissionController,
    pub(crate) senders: Senders,
    pub(crate) stats: DispatchStats,
    pub(crate) reporter: Arc<dyn ResultReporter>,
    pub(crate) metrics: Metrics,
    /// Cancelled when shutdown begins: no new jobs, no more retries.
    pub(crate) draining: CancellationToken,
    /// Cancelled when the shutdown deadline passes: abandon whatever is still running.
    pub(crate) abort: CancellationToken,
}

impl EngineCore {
    pub(crate) fn finish(&self, result: &PushResult) {
        self.stats.record(result);
        self.reporter.report(result);
    }
}

/// Point-in-time view of the engine for the stats endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EngineSnapshot {
    pub queue_max: usize,
    pub queue_usage: usize,
    pub pusher_max: u64,
    pub pusher_count: usize,
    pub android: PlatformStats,
    pub ios: PlatformStats,
}

/// The dispatch engine: a bounded queue drained by a fixed pool of workers.
#[derive(Debug)]
pub struct DispatchEngine {
    core: Arc<EngineCore>,
    workers: Mutex<JoinSet<()>>,
}

impl DispatchEngine {
    /// Starts exactly `settings.workers` workers. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn start(settings: EngineSettings, senders: Senders, reporter: Arc<dyn ResultReporter>) -> Self {
        let core = Arc::new(EngineCore {
            queue: JobQueue::new(settings.queue_capacity),
            admission: AdmissionController::new(Arc::new(PusherLimit::new(settings.pusher_max))),
            senders,
            stats: DispatchStats::default(),
            reporter,
            metrics: Metrics::new(),
            draining: CancellationToken::new(),
            abort: CancellationToken::new(),
        });

        let mut workers = JoinSet::new();
        for id in 0..settings.workers {
            let worker = PushWorker::new(id, Arc::clone(&core));
            workers.spawn(worker.run().instrument(tracing::info_span!("push_worker", worker = id)));
        }

        tracing::info!(
            workers = settings.workers,
            queue_capacity = settings.queue_capacity,
            pusher_max = settings.pusher_max,
            android = core.senders.get(Platform::Android).is_some(),
            ios = core.senders.get(Platform::Ios).is_some(),
            "Dispatch engine started"
        );

        Self { core, workers: Mutex::new(workers) }
    }

    /// Enqueues one job without blocking.
    ///
    /// # Errors
    /// Returns `SubmitError::QueueFull` when the queue is at capacity and
    /// `SubmitError::ShuttingDown` once shutdown has begun.
    pub fn submit(&self, job: PushJob) -> Result<(), SubmitError> {
        let platform = job.platform();
        let res = self.core.queue.try_enqueue(job);
        self.record_submission(platform, res);
        res
    }

    /// Enqueues one job, waiting up to `timeout` for queue capacity.
    ///
    /// # Errors
    /// Same as [`DispatchEngine::submit`], with `QueueFull` meaning no slot freed up in time.
    pub async fn submit_timeout(&self, job: PushJob, timeout: Duration) -> Result<(), SubmitError> {
        let platform = job.platform();
        let res = self.core.queue.enqueue_timeout(job, timeout).await;
        self.record_submission(platform, res);
        res
    }

    /// Enqueues a batch, refusing it up front when it cannot fit in the remaining capacity.
    ///
    /// Concurrent submitters can still fill the queue mid-batch, in which case the jobs already
    /// enqueued stay queued and the error is returned.
    ///
    /// # Errors
    /// Same as [`DispatchEngine::submit`].
    pub fn submit_all(&self, jobs: Vec<PushJob>) -> Result<(), SubmitError> {
        if self.core.queue.is_closed() {
            return Err(self.reject(SubmitError::ShuttingDown, jobs.len()));
        }
        if self.core.queue.capacity() - self.core.queue.len() < jobs.len() {
            return Err(self.reject(SubmitError::QueueFull, jobs.len()));
        }
        jobs.into_iter().try_for_each(|job| self.submit(job))
    }

    fn record_submission(&self, platform: Platform, res: Result<(), SubmitError>) {
        match res {
            Ok(()) => {
                self.core.metrics.jobs_submitted.add(1, &[KeyValue::new("platform", platform.as_str())]);
            }
            Err(e) => {
                self.reject(e, 1);
            }
        }
    }

    fn reject(&self, error: SubmitError, count: usize) -> SubmitError {
        self.core.metrics.jobs_rejected.add(count as u64, &[KeyValue::new("reason", error.as_str())]);
        tracing::warn!(reason = error.as_str(), count, "Rejected push jobs");
        error
    }

    #[must_use]
    pub fn is_enabled(&self, platform: Platform) -> bool {
        self.core.senders.get(platform).is_some()
    }

    /// Live cap on concurrent sends.
    #[must_use]
    pub fn admission(&self) -> &AdmissionController {
        &self.core.admission
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.core.queue.len()
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            queue_max: self.core.queue.capacity(),
            queue_usage: self.core.queue.len(),
            pusher_max: self.core.admission.limit(),
            pusher_count: self.core.admission.in_flight(),
            android: self.core.stats.snapshot(Platform::Android),
            ios: self.core.stats.snapshot(Platform::Ios),
        }
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.core.draining.is_cancelled()
    }

    /// Stops intake and waits up to `timeout` for workers to drain the queue.
    ///
    /// Jobs still running or queued when the deadline passes are reported failed with
    /// `FailureKind::Shutdown`. Calling this more than once is harmless.
    pub async fn shutdown(&self, timeout: Duration) {
        tracing::info!(queued = self.core.queue.len(), "Dispatch engine draining...");
        self.core.draining.cancel();
        self.core.queue.close();

        let mut workers = self.workers.lock().await;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(res) = workers.join_next().await {
                log_worker_exit(res);
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!(
                in_flight = self.core.admission.in_flight(),
                queued = self.core.queue.len(),
                "Shutdown timeout reached, abandoning outstanding sends"
            );
            self.core.abort.cancel();
            while let Some(res) = workers.join_next().await {
                log_worker_exit(res);
            }
        }

        let leftover = self.core.queue.drain().await;
        for job in &leftover {
            self.core.finish(&PushResult::failed(job, 0, FailureKind::Shutdown, "engine shut down before send"));
        }
        tracing::info!(abandoned = leftover.len(), "Dispatch engine stopped");
    }
}

fn log_worker_exit(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        tracing::error!(error = %e, "Push worker terminated abnormally");
    }
}

use crate::domain::job::PushJob;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Why a job was not accepted. The submitter decides whether to back off and retry.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("queue is full")]
    QueueFull,
    #[error("server is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Bounded FIFO of pending jobs shared by all workers.
///
/// Each job is handed to exactly one `dequeue` caller. Once `close` is called no new job is
/// accepted, `dequeue` keeps returning buffered jobs and then `None`.
#[derive(Debug)]
pub struct JobQueue {
    tx: mpsc::Sender<PushJob>,
    rx: Mutex<mpsc::Receiver<PushJob>>,
    closed: CancellationToken,
}

impl JobQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self { tx, rx: Mutex::new(rx), closed: CancellationToken::new() }
    }

    /// Enqueues without waiting.
    ///
    /// # Errors
    /// Returns `SubmitError::QueueFull` at capacity and `SubmitError::ShuttingDown` once closed.
    pub fn try_enqueue(&self, job: PushJob) -> Result<(), SubmitError> {
        if self.closed.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::ShuttingDown,
        })
    }

    /// Enqueues, waiting up to `timeout` for free capacity.
    ///
    /// # Errors
    /// Returns `SubmitError::QueueFull` if no slot frees up in time and `SubmitError::ShuttingDown`
    /// if the queue is closed before or while waiting.
    pub async fn enqueue_timeout(&self, job: PushJob, timeout: Duration) -> Result<(), SubmitError> {
        if self.closed.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        tokio::select! {
            res = self.tx.send_timeout(job, timeout) => res.map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => SubmitError::QueueFull,
                mpsc::error::SendTimeoutError::Closed(_) => SubmitError::ShuttingDown,
            }),
            () = self.closed.cancelled() => Err(SubmitError::ShuttingDown),
        }
    }

    /// Waits for the next job. Returns `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<PushJob> {
        let mut rx = self.rx.lock().await;
        if self.closed.is_cancelled() {
            return rx.try_recv().ok();
        }
        tokio::select! {
            biased;
            job = rx.recv() => job,
            () = self.closed.cancelled() => rx.try_recv().ok(),
        }
    }

    /// Stops accepting jobs and wakes idle consumers.
    pub fn close(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Removes everything still buffered.
    pub async fn drain(&self) -> Vec<PushJob> {
        let mut rx = self.rx.lock().await;
        let mut jobs = Vec::with_capacity(rx.len());
        while let Ok(job) = rx.try_recv() {
            jobs.push(job);
        }
        jobs
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

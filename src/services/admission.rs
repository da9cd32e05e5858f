use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// How often a blocked acquirer re-reads the live limit even without a wake-up.
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_millis(50);

/// The live pusher cap. `0` means unlimited.
///
/// This is the only configuration value mutated after startup, so it lives in its own cell
/// instead of behind a lock on the whole configuration.
#[derive(Debug, Default)]
pub struct PusherLimit(AtomicU64);

impl PusherLimit {
    #[must_use]
    pub const fn new(max: u64) -> Self {
        Self(AtomicU64::new(max))
    }

    #[must_use]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn store(&self, max: u64) {
        self.0.store(max, Ordering::Release);
    }
}

/// Caps the number of sends executing at once.
///
/// The cap is read on every acquisition, so a new limit applies to the next acquirer. Raising
/// it wakes blocked acquirers; lowering it never revokes permits already handed out.
#[derive(Debug)]
pub struct AdmissionController {
    limit: Arc<PusherLimit>,
    in_flight: AtomicUsize,
    released: Notify,
    recheck: Duration,
}

/// A held admission slot. Dropping it releases the slot.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct AdmissionPermit<'a> {
    controller: &'a AdmissionController,
}

impl AdmissionController {
    #[must_use]
    pub fn new(limit: Arc<PusherLimit>) -> Self {
        Self::with_recheck_interval(limit, DEFAULT_RECHECK_INTERVAL)
    }

    #[must_use]
    pub fn with_recheck_interval(limit: Arc<PusherLimit>, recheck: Duration) -> Self {
        Self { limit, in_flight: AtomicUsize::new(0), released: Notify::new(), recheck }
    }

    /// Takes a slot if the current limit allows it.
    pub fn try_acquire(&self) -> Option<AdmissionPermit<'_>> {
        let max = self.limit.load();
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if max != 0 && current as u64 >= max {
                return None;
            }
            match self.in_flight.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(AdmissionPermit { controller: self }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Waits for a slot.
    pub async fn acquire(&self) -> AdmissionPermit<'_> {
        loop {
            if let Some(permit) = self.try_acquire() {
                return permit;
            }

            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // A release between the failed attempt and `enable` would otherwise be missed.
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            let _ = tokio::time::timeout(self.recheck, notified).await;
        }
    }

    /// Replaces the live limit. Takes effect for the next acquisition and never waits on sends.
    pub fn set_limit(&self, max: u64) {
        let previous = self.limit.load();
        self.limit.store(max);
        self.released.notify_waiters();
        tracing::info!(previous, max, "Pusher limit updated");
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit.load()
    }

    /// Number of slots currently held.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.controller.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.controller.released.notify_one();
    }
}

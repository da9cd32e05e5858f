use crate::domain::job::{Platform, PushJob};
use std::fmt;
use uuid::Uuid;

/// Classification of a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Token malformed or no longer registered with the gateway.
    InvalidToken,
    /// Gateway rejected our credentials.
    Unauthorized,
    /// Gateway rejected the payload itself.
    InvalidPayload,
    RateLimited,
    /// 5xx or otherwise unexpected gateway response.
    Gateway,
    Network,
    Timeout,
    /// Abandoned because the engine shut down first.
    Shutdown,
    /// Sender panicked or the platform has no sender.
    Internal,
}

impl FailureKind {
    /// Retrying can only help for transient conditions.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Gateway | Self::Network | Self::Timeout)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::Unauthorized => "unauthorized",
            Self::InvalidPayload => "invalid_payload",
            Self::RateLimited => "rate_limited",
            Self::Gateway => "gateway",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFailure {
    pub token: String,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Delivered,
    PartiallyDelivered,
    Failed,
}

/// Terminal outcome of one job. Every dequeued or abandoned job produces exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    pub job_id: Uuid,
    pub identifier: Option<String>,
    pub platform: Platform,
    /// Send attempts made, including the first.
    pub attempts: u32,
    pub delivered: Vec<String>,
    pub failures: Vec<TokenFailure>,
}

impl PushResult {
    /// An empty result for `job`, to be filled in as attempts complete.
    #[must_use]
    pub fn for_job(job: &PushJob) -> Self {
        Self {
            job_id: job.id,
            identifier: job.identifier.clone(),
            platform: job.platform(),
            attempts: 0,
            delivered: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Marks every token of `job` as failed with the same cause.
    #[must_use]
    pub fn failed(job: &PushJob, attempts: u32, kind: FailureKind, reason: &str) -> Self {
        let failures = job
            .tokens
            .iter()
            .map(|token| TokenFailure { token: token.clone(), kind, reason: reason.to_string() })
            .collect();
        Self { attempts, failures, ..Self::for_job(job) }
    }

    #[must_use]
    pub fn status(&self) -> PushStatus {
        match (self.delivered.is_empty(), self.failures.is_empty()) {
            (_, true) => PushStatus::Delivered,
            (false, false) => PushStatus::PartiallyDelivered,
            (true, false) => PushStatus::Failed,
        }
    }

    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(delivered: usize, failed: usize) -> PushResult {
        PushResult {
            job_id: Uuid::new_v4(),
            identifier: None,
            platform: Platform::Ios,
            attempts: 2,
            delivered: (0..delivered).map(|i| format!("ok-{i}")).collect(),
            failures: (0..failed)
                .map(|i| TokenFailure { token: format!("bad-{i}"), kind: FailureKind::InvalidToken, reason: String::new() })
                .collect(),
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(result(2, 0).status(), PushStatus::Delivered);
        assert_eq!(result(1, 1).status(), PushStatus::PartiallyDelivered);
        assert_eq!(result(0, 2).status(), PushStatus::Failed);
        assert_eq!(result(0, 0).retries(), 1);
    }

    #[test]
    fn test_failed_covers_every_token() {
        let job = PushJob::new(
            vec!["a".into(), "b".into()],
            "hi",
            crate::domain::job::PlatformOptions::Ios(crate::domain::job::IosOptions::default()),
        );
        let result = PushResult::failed(&job, 0, FailureKind::Shutdown, "engine stopped");
        assert_eq!(result.job_id, job.id);
        assert_eq!(result.platform, Platform::Ios);
        assert_eq!(result.failures.len(), 2);
        assert!(result.failures.iter().all(|f| f.kind == FailureKind::Shutdown));
        assert_eq!(result.status(), PushStatus::Failed);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::RateLimited.is_retryable());
        assert!(!FailureKind::InvalidToken.is_retryable());
        assert!(!FailureKind::Unauthorized.is_retryable());
        assert!(!FailureKind::Shutdown.is_retryable());
    }
}

use crate::domain::job::{Platform, PushJob};
use crate::domain::outcome::FailureKind;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub mod apns;
pub mod auth;
pub mod fcm;
pub mod http;

pub use apns::ApnsPushProvider;
pub use fcm::FcmPushProvider;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("Token is no longer registered")]
    Unregistered,
    #[error("Invalid device token: {0}")]
    InvalidToken(String),
    #[error("Rate limit exceeded")]
    QuotaExceeded { retry_after: Option<Duration> },
    #[error("Authentication rejected: {0}")]
    Unauthorized(String),
    #[error("Payload rejected: {0}")]
    InvalidPayload(String),
    #[error("Gateway error: HTTP {status}: {reason}")]
    Gateway { status: u16, reason: String, retry_after: Option<Duration> },
    #[error("Request timed out")]
    Timeout,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PushError {
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Unregistered | Self::InvalidToken(_) => FailureKind::InvalidToken,
            Self::QuotaExceeded { .. } => FailureKind::RateLimited,
            Self::Unauthorized(_) => FailureKind::Unauthorized,
            Self::InvalidPayload(_) => FailureKind::InvalidPayload,
            Self::Gateway { .. } => FailureKind::Gateway,
            Self::Timeout => FailureKind::Timeout,
            Self::Network(_) => FailureKind::Network,
            Self::Internal(_) => FailureKind::Internal,
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Delay the gateway asked us to wait before trying again.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::QuotaExceeded { retry_after } | Self::Gateway { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for PushError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() { Self::Timeout } else { Self::Network(e.to_string()) }
    }
}

/// Per-token outcome of one send call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    pub delivered: Vec<String>,
    pub failures: Vec<(String, PushError)>,
}

impl SendReport {
    fn fail_all(&mut self, tokens: &[String], error: &PushError) {
        self.failures.extend(tokens.iter().map(|t| (t.clone(), error.clone())));
    }
}

#[async_trait]
pub trait PushProvider: Send + Sync + std::fmt::Debug {
    fn platform(&self) -> Platform;

    /// Upper bound for one outbound request.
    fn timeout(&self) -> Duration;

    /// Upper bound for one `send_push` call on `job`. Senders that issue one request per token
    /// scale this with the token count.
    fn deadline(&self, _job: &PushJob) -> Duration {
        self.timeout()
    }

    /// Delivers one job to the gateway.
    ///
    /// # Errors
    /// Returns a job-level `PushError` when nothing could be delivered (transport failure,
    /// rejected credentials, gateway outage). Token-level failures are reported in `SendReport`.
    async fn send_push(&self, job: &PushJob) -> Result<SendReport, PushError>;
}

/// Sends to each token in turn, so one job holds at most one outbound request at a time.
///
/// Once the gateway rejects our credentials the remaining tokens fail with the same error
/// without being sent.
pub(crate) async fn send_each<'a, F, Fut>(tokens: &'a [String], send_one: F) -> SendReport
where
    F: Fn(&'a str) -> Fut,
    Fut: Future<Output = Result<(), PushError>>,
{
    let mut report = SendReport::default();
    for (i, token) in tokens.iter().enumerate() {
        match send_one(token).await {
            Ok(()) => report.delivered.push(token.clone()),
            Err(e @ PushError::Unauthorized(_)) => {
                report.fail_all(&tokens[i..], &e);
                break;
            }
            Err(e) => report.failures.push((token.clone(), e)),
        }
    }
    report
}

/// Deadline for a sender that makes one request per token plus one for credentials.
pub(crate) fn per_token_deadline(timeout: Duration, tokens: usize) -> Duration {
    timeout.saturating_mul(u32::try_from(tokens).unwrap_or(u32::MAX).saturating_add(1))
}

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Maximum number of registration ids FCM accepts in one multicast request.
pub const MAX_REGISTRATION_IDS: usize = 1000;

/// Longest time FCM keeps a message for an offline device (4 weeks, in seconds).
pub const MAX_TIME_TO_LIVE: u32 = 2_419_200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Platform {
    Ios = 1,
    Android = 2,
}

impl Platform {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for Platform {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Ios),
            2 => Ok(Self::Android),
            other => Err(format!("unknown platform {other}")),
        }
    }
}

impl From<Platform> for u8 {
    fn from(platform: Platform) -> Self {
        platform as Self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApnsPushType {
    #[default]
    Alert,
    Background,
}

impl ApnsPushType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Background => "background",
        }
    }
}

/// Custom key/value data delivered alongside the notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendField {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AndroidOptions {
    pub collapse_key: Option<String>,
    pub delay_while_idle: bool,
    /// Seconds
    pub time_to_live: Option<u32>,
    pub priority: Priority,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IosOptions {
    pub subtitle: Option<String>,
    pub badge: Option<u32>,
    pub sound: Option<String>,
    pub category: Option<String>,
    pub content_available: bool,
    pub mutable_content: bool,
    /// Unix timestamp after which APNs stops trying to deliver.
    pub expiry: Option<i64>,
    pub push_type: ApnsPushType,
    pub priority: Priority,
    pub collapse_id: Option<String>,
}

/// Platform tag carrying the options only that platform understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformOptions {
    Android(AndroidOptions),
    Ios(IosOptions),
}

/// One unit of delivery work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushJob {
    pub id: Uuid,
    /// Caller supplied correlation id, logged with the outcome.
    pub identifier: Option<String>,
    pub tokens: Vec<String>,
    pub message: String,
    pub title: Option<String>,
    pub extend: Vec<ExtendField>,
    pub options: PlatformOptions,
}

#[derive(Debug, Clone, Copy)]
pub struct JobLimits {
    pub notification_max: usize,
    pub allows_empty_message: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("empty token")]
    NoTokens,
    #[error("token cannot be empty")]
    EmptyToken,
    #[error("ios token must be hexadecimal")]
    MalformedDeviceToken,
    #[error("too many tokens: {count} (max {max})")]
    TooManyTokens { count: usize, max: usize },
    #[error("empty message")]
    EmptyMessage,
    #[error("time_to_live must be at most 2419200 seconds, got {0}")]
    TimeToLiveOutOfRange(u32),
}

impl PushJob {
    #[must_use]
    pub fn new(tokens: Vec<String>, message: impl Into<String>, options: PlatformOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            identifier: None,
            tokens,
            message: message.into(),
            title: None,
            extend: Vec::new(),
            options,
        }
    }

    #[must_use]
    pub const fn platform(&self) -> Platform {
        match self.options {
            PlatformOptions::Android(_) => Platform::Android,
            PlatformOptions::Ios(_) => Platform::Ios,
        }
    }

    /// Returns a copy of this job addressed to a subset of its tokens.
    #[must_use]
    pub fn with_tokens(&self, tokens: Vec<String>) -> Self {
        Self { tokens, ..self.clone() }
    }

    /// Checks the job against the configured limits and the platform contract.
    ///
    /// # Errors
    /// Returns the first violated rule. Out of range values are rejected, never clamped.
    pub fn validate(&self, limits: JobLimits) -> Result<(), JobError> {
        if self.tokens.is_empty() {
            return Err(JobError::NoTokens);
        }
        if self.tokens.iter().any(|t| t.trim().is_empty()) {
            return Err(JobError::EmptyToken);
        }
        if matches!(self.options, PlatformOptions::Ios(_))
            && !self.tokens.iter().all(|t| t.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            return Err(JobError::MalformedDeviceToken);
        }
        let max = match self.options {
            PlatformOptions::Android(_) => limits.notification_max.min(MAX_REGISTRATION_IDS),
            PlatformOptions::Ios(_) => limits.notification_max,
        };
        if self.tokens.len() > max {
            return Err(JobError::TooManyTokens { count: self.tokens.len(), max });
        }
        if self.message.is_empty() && !limits.allows_empty_message {
            return Err(JobError::EmptyMessage);
        }
        if let PlatformOptions::Android(AndroidOptions { time_to_live: Some(ttl), .. }) = self.options
            && ttl > MAX_TIME_TO_LIVE
        {
            return Err(JobError::TimeToLiveOutOfRange(ttl));
        }
        Ok(())
    }
}

/// Shortens a device token for logging.
#[must_use]
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    if prefix.len() < token.len() { format!("{prefix}...") } else { prefix }
}

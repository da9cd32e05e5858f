use crate::adapters::push::PushError;
use crate::config::ConfigError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, ClientBuilder, StatusCode, Url};
use std::time::Duration;

/// Connection reuse settings shared by every sender.
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    pub timeout: Duration,
    pub idle_timeout: Duration,
    pub max_idle: usize,
}

/// Builds a client with a bounded keep-alive pool so that TCP and TLS sessions are reused across sends.
///
/// # Errors
/// Returns `ConfigError::Invalid` if the TLS backend cannot be initialised.
pub fn build_client(settings: KeepAlive, customize: impl FnOnce(ClientBuilder) -> ClientBuilder) -> Result<Client, ConfigError> {
    let builder = Client::builder()
        .timeout(settings.timeout)
        .pool_idle_timeout(settings.idle_timeout)
        .pool_max_idle_per_host(settings.max_idle)
        .tcp_keepalive(settings.idle_timeout)
        .user_agent(concat!("pushgate/", env!("CARGO_PKG_VERSION")));

    customize(builder).build().map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))
}

/// Parses a gateway base URL, refusing empty or non-HTTP values.
///
/// # Errors
/// Returns `ConfigError::Invalid` if the URL is empty, malformed, or not http(s).
pub fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    if raw.trim().is_empty() {
        return Err(ConfigError::Invalid("missing push endpoint url".to_string()));
    }
    let url = Url::parse(raw).map_err(|e| ConfigError::Invalid(format!("failed to parse URL {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::Invalid(format!("unsupported scheme {other:?} in {raw:?}"))),
    }
}

/// Reads a `Retry-After` header given in seconds.
#[must_use]
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Maps the status codes both gateways share. Callers handle platform specific codes first.
#[must_use]
pub fn classify_status(status: StatusCode, headers: &HeaderMap, reason: String) -> PushError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PushError::Unauthorized(reason),
        StatusCode::TOO_MANY_REQUESTS => PushError::QuotaExceeded { retry_after: retry_after(headers) },
        StatusCode::PAYLOAD_TOO_LARGE => PushError::InvalidPayload(reason),
        s if s.is_server_error() => {
            PushError::Gateway { status: s.as_u16(), reason, retry_after: retry_after(headers) }
        }
        s if s.is_client_error() => PushError::InvalidPayload(format!("HTTP {}: {reason}", s.as_u16())),
        s => PushError::Gateway { status: s.as_u16(), reason, retry_after: None },
    }
}

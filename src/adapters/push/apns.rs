use crate::adapters::push::auth::{CachedToken, TokenCache};
use crate::adapters::push::http::{KeepAlive, build_client, classify_status, parse_endpoint, retry_after};
use crate::adapters::push::{PushError, PushProvider, SendReport, per_token_deadline, send_each};
use crate::config::{ConfigError, IosCredential, SectionIos};
use crate::domain::job::{ApnsPushType, IosOptions, Platform, PlatformOptions, Priority, PushJob};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, Identity, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const APNS_PRODUCTION_ENDPOINT: &str = "https://api.push.apple.com";
pub const APNS_SANDBOX_ENDPOINT: &str = "https://api.sandbox.push.apple.com";

// APNs rejects provider tokens older than an hour and throttles refreshes faster than every 20 minutes.
const PROVIDER_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
const PROVIDER_TOKEN_MARGIN: Duration = Duration::from_secs(600);

/// iOS sender for the APNs HTTP/2 provider API.
pub struct ApnsPushProvider {
    client: Client,
    base_url: Url,
    topic: String,
    timeout: Duration,
    auth: ApnsAuth,
}

enum ApnsAuth {
    /// The client certificate is installed on the connection pool.
    Certificate,
    Token { key: EncodingKey, key_id: String, team_id: String, cache: TokenCache },
}

impl fmt::Debug for ApnsPushProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApnsPushProvider")
            .field("base_url", &self.base_url.as_str())
            .field("topic", &self.topic)
            .field("auth", &self.auth_mode())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct ProviderClaims<'a> {
    iss: &'a str,
    iat: i64,
}

#[derive(Deserialize)]
struct ApnsErrorBody {
    #[serde(default)]
    reason: String,
}

fn read_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })
}

impl ApnsPushProvider {
    /// Builds the sender for whichever credential mode the configuration populates.
    ///
    /// # Errors
    /// Returns a `ConfigError` if the credentials are missing, ambiguous or unreadable, or the endpoint is invalid.
    pub fn new(config: &SectionIos) -> Result<Self, ConfigError> {
        let default_endpoint = if config.sandbox { APNS_SANDBOX_ENDPOINT } else { APNS_PRODUCTION_ENDPOINT };
        let base_url = parse_endpoint(config.endpoint.as_deref().unwrap_or(default_endpoint))?;
        let keep_alive = KeepAlive {
            timeout: config.timeout(),
            idle_timeout: config.keepalive_timeout(),
            max_idle: config.keepalive_conns,
        };

        let (client, auth) = match config.credential()? {
            IosCredential::Certificate { cert_path, key_path } => {
                let mut pem = read_file(&cert_path)?;
                pem.push(b'\n');
                pem.extend(read_file(&key_path)?);
                let identity = Identity::from_pem(&pem)
                    .map_err(|e| ConfigError::Credential(format!("invalid APNs certificate or key: {e}")))?;
                (build_client(keep_alive, |builder| builder.identity(identity))?, ApnsAuth::Certificate)
            }
            IosCredential::Token { key_path, key_id, team_id } => {
                let key = EncodingKey::from_ec_pem(&read_file(&key_path)?)
                    .map_err(|e| ConfigError::Credential(format!("invalid APNs auth key {}: {e}", key_path.display())))?;
                let auth = ApnsAuth::Token { key, key_id, team_id, cache: TokenCache::new() };
                (build_client(keep_alive, |builder| builder)?, auth)
            }
        };

        let provider = Self { client, base_url, topic: config.topic.clone(), timeout: config.timeout(), auth };
        tracing::info!(auth = provider.auth_mode(), sandbox = config.sandbox, "iOS push sender configured");
        Ok(provider)
    }

    const fn auth_mode(&self) -> &'static str {
        match self.auth {
            ApnsAuth::Certificate => "certificate",
            ApnsAuth::Token { .. } => "token",
        }
    }

    async fn provider_token(&self) -> Result<Option<String>, PushError> {
        match &self.auth {
            ApnsAuth::Certificate => Ok(None),
            ApnsAuth::Token { key, key_id, team_id, cache } => {
                let token = cache
                    .get_or_refresh(|| async {
                        let mut header = Header::new(Algorithm::ES256);
                        header.kid = Some(key_id.clone());
                        let claims = ProviderClaims { iss: team_id, iat: time::OffsetDateTime::now_utc().unix_timestamp() };
                        let jwt = jsonwebtoken::encode(&header, &claims, key)
                            .map_err(|e| PushError::Unauthorized(format!("failed to sign provider token: {e}")))?;
                        Ok(CachedToken::new(jwt, PROVIDER_TOKEN_LIFETIME, PROVIDER_TOKEN_MARGIN))
                    })
                    .await?;
                Ok(Some(token))
            }
        }
    }

    async fn invalidate_provider_token(&self) {
        if let ApnsAuth::Token { cache, .. } = &self.auth {
            cache.invalidate().await;
        }
    }

    async fn send_one(&self, job: &PushJob, options: &IosOptions, token: &str) -> Result<(), PushError> {
        match self.post(job, options, token).await {
            Err(ApnsRejection::ExpiredProviderToken) => {
                tracing::info!("APNs provider token expired, re-signing");
                self.invalidate_provider_token().await;
                self.post(job, options, token).await.map_err(ApnsRejection::into_push_error)
            }
            other => other.map_err(ApnsRejection::into_push_error),
        }
    }

    async fn post(&self, job: &PushJob, options: &IosOptions, token: &str) -> Result<(), ApnsRejection> {
        let url = device_url(&self.base_url, token).map_err(ApnsRejection::Other)?;

        let mut request = self
            .client
            .post(url)
            .header("apns-push-type", options.push_type.as_str())
            .header("apns-priority", apns_priority(options))
            .json(&payload(job, options));
        if !self.topic.is_empty() {
            request = request.header("apns-topic", &self.topic);
        }
        if let Some(expiry) = options.expiry {
            request = request.header("apns-expiration", expiry.to_string());
        }
        if let Some(collapse_id) = &options.collapse_id {
            request = request.header("apns-collapse-id", collapse_id);
        }
        if let Some(bearer) = self.provider_token().await.map_err(ApnsRejection::Other)? {
            request = request.bearer_auth(bearer);
        }

        let resp = request.send().await.map_err(|e| ApnsRejection::Other(e.into()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<ApnsErrorBody>(&body).map_or(body, |b| b.reason);
        Err(classify_rejection(status, &headers, reason))
    }
}

#[derive(Debug)]
enum ApnsRejection {
    ExpiredProviderToken,
    Other(PushError),
}

impl ApnsRejection {
    fn into_push_error(self) -> PushError {
        match self {
            Self::ExpiredProviderToken => PushError::Unauthorized("ExpiredProviderToken".to_string()),
            Self::Other(e) => e,
        }
    }
}

fn classify_rejection(status: StatusCode, headers: &reqwest::header::HeaderMap, reason: String) -> ApnsRejection {
    let error = match (status, reason.as_str()) {
        (StatusCode::FORBIDDEN, "ExpiredProviderToken") => return ApnsRejection::ExpiredProviderToken,
        (StatusCode::GONE, _) | (_, "Unregistered") => PushError::Unregistered,
        (StatusCode::BAD_REQUEST, "BadDeviceToken" | "DeviceTokenNotForTopic" | "MissingDeviceToken") => {
            PushError::InvalidToken(reason)
        }
        (StatusCode::TOO_MANY_REQUESTS, _) => PushError::QuotaExceeded { retry_after: retry_after(headers) },
        _ => classify_status(status, headers, reason),
    };
    ApnsRejection::Other(error)
}

/// `/3/device/<token>` with the token encoded as a single path segment.
fn device_url(base: &Url, token: &str) -> Result<Url, PushError> {
    let mut url = base.clone();
    url.set_path("/3/device");
    url.path_segments_mut()
        .map_err(|()| PushError::InvalidToken(format!("cannot build a device URL from {base}")))?
        .push(token);
    Ok(url)
}

const fn apns_priority(options: &IosOptions) -> &'static str {
    // Background pushes must use priority 5.
    match (options.push_type, options.priority) {
        (ApnsPushType::Alert, Priority::High) => "10",
        _ => "5",
    }
}

fn payload(job: &PushJob, options: &IosOptions) -> Value {
    let mut aps = Map::new();
    if !job.message.is_empty() || job.title.is_some() {
        let mut alert = Map::new();
        if let Some(title) = &job.title {
            alert.insert("title".into(), Value::String(title.clone()));
        }
        if let Some(subtitle) = &options.subtitle {
            alert.insert("subtitle".into(), Value::String(subtitle.clone()));
        }
        alert.insert("body".into(), Value::String(job.message.clone()));
        aps.insert("alert".into(), Value::Object(alert));
    }
    if let Some(badge) = options.badge {
        aps.insert("badge".into(), json!(badge));
    }
    if let Some(sound) = &options.sound {
        aps.insert("sound".into(), Value::String(sound.clone()));
    }
    if let Some(category) = &options.category {
        aps.insert("category".into(), Value::String(category.clone()));
    }
    if options.content_available {
        aps.insert("content-available".into(), json!(1));
    }
    if options.mutable_content {
        aps.insert("mutable-content".into(), json!(1));
    }

    let mut root = Map::new();
    for field in &job.extend {
        root.insert(field.key.clone(), Value::String(field.value.clone()));
    }
    root.insert("aps".into(), Value::Object(aps));
    Value::Object(root)
}

#[async_trait]
impl PushProvider for ApnsPushProvider {
    fn platform(&self) -> Platform {
        Platform::Ios
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn deadline(&self, job: &PushJob) -> Duration {
        per_token_deadline(self.timeout, job.tokens.len())
    }

    async fn send_push(&self, job: &PushJob) -> Result<SendReport, PushError> {
        let PlatformOptions::Ios(options) = &job.options else {
            return Err(PushError::Internal(format!("{} job routed to the iOS sender", job.platform())));
        };
        Ok(send_each(&job.tokens, |token| self.send_one(job, options, token)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::ExtendField;
    use reqwest::header::HeaderMap;

    fn fixture(name: &str) -> String {
        format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
    }

    fn token_config() -> SectionIos {
        SectionIos {
            token_auth_key_path: fixture("apns_auth_key.p8"),
            token_auth_key_id: "ABC123DEFG".into(),
            token_auth_team_id: "DEF123GHIJ".into(),
            topic: "com.example.app".into(),
            ..SectionIos::default()
        }
    }

    #[test]
    fn test_payload_shape() {
        let mut job = PushJob::new(vec!["t".into()], "hello", PlatformOptions::Ios(IosOptions::default()));
        job.title = Some("Title".into());
        job.extend = vec![ExtendField { key: "room".into(), value: "42".into() }];
        let options = IosOptions { badge: Some(3), sound: Some("default".into()), content_available: true, ..Default::default() };

        let body = payload(&job, &options);
        assert_eq!(body["aps"]["alert"]["title"], "Title");
        assert_eq!(body["aps"]["alert"]["body"], "hello");
        assert_eq!(body["aps"]["badge"], 3);
        assert_eq!(body["aps"]["sound"], "default");
        assert_eq!(body["aps"]["content-available"], 1);
        assert_eq!(body["room"], "42");
    }

    #[test]
    fn test_background_push_has_no_alert_and_low_priority() {
        let job = PushJob::new(vec!["t".into()], "", PlatformOptions::Ios(IosOptions::default()));
        let options = IosOptions {
            push_type: ApnsPushType::Background,
            priority: Priority::High,
            content_available: true,
            ..Default::default()
        };
        assert!(payload(&job, &options)["aps"].get("alert").is_none());
        assert_eq!(apns_priority(&options), "5");
    }

    #[test]
    fn test_rejection_classification() {
        let headers = HeaderMap::new();
        assert!(matches!(
            classify_rejection(StatusCode::GONE, &headers, "Unregistered".into()),
            ApnsRejection::Other(PushError::Unregistered)
        ));
        assert!(matches!(
            classify_rejection(StatusCode::BAD_REQUEST, &headers, "BadDeviceToken".into()),
            ApnsRejection::Other(PushError::InvalidToken(_))
        ));
        assert!(matches!(
            classify_rejection(StatusCode::FORBIDDEN, &headers, "ExpiredProviderToken".into()),
            ApnsRejection::ExpiredProviderToken
        ));
        assert!(matches!(
            classify_rejection(StatusCode::FORBIDDEN, &headers, "InvalidProviderToken".into()),
            ApnsRejection::Other(PushError::Unauthorized(_))
        ));
        assert!(matches!(
            classify_rejection(StatusCode::SERVICE_UNAVAILABLE, &headers, "ServiceUnavailable".into()),
            ApnsRejection::Other(PushError::Gateway { status: 503, .. })
        ));
    }

    #[test]
    fn test_device_url_keeps_token_in_one_segment() {
        let base = Url::parse("https://api.push.apple.com").unwrap();
        assert_eq!(device_url(&base, "abc123").unwrap().as_str(), "https://api.push.apple.com/3/device/abc123");

        let url = device_url(&base, "../x?y#z").unwrap();
        assert_eq!(url.path(), "/3/device/..%2Fx%3Fy%23z");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn test_token_mode_is_selected() {
        let provider = ApnsPushProvider::new(&token_config()).unwrap();
        assert_eq!(provider.auth_mode(), "token");
        assert_eq!(provider.base_url.as_str(), "https://api.sandbox.push.apple.com/");
    }

    #[test]
    fn test_certificate_mode_is_selected() {
        let config = SectionIos {
            pem_cert_path: fixture("apns_cert.pem"),
            pem_key_path: fixture("apns_key.pem"),
            sandbox: false,
            ..SectionIos::default()
        };
        let provider = ApnsPushProvider::new(&config).unwrap();
        assert_eq!(provider.auth_mode(), "certificate");
        assert_eq!(provider.base_url.as_str(), "https://api.push.apple.com/");
    }

    #[test]
    fn test_missing_credentials_fail_construction() {
        assert!(matches!(ApnsPushProvider::new(&SectionIos::default()), Err(ConfigError::Credential(_))));
    }

    #[test]
    fn test_garbage_auth_key_fails_construction() {
        let config = SectionIos { token_auth_key_path: fixture("apns_cert.pem"), ..token_config() };
        assert!(matches!(ApnsPushProvider::new(&config), Err(ConfigError::Credential(_))));
    }

    #[tokio::test]
    async fn test_provider_token_is_cached() {
        let provider = ApnsPushProvider::new(&token_config()).unwrap();
        let first = provider.provider_token().await.unwrap().unwrap();
        let second = provider.provider_token().await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.split('.').count(), 3);
    }
}

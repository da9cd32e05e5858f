use crate::adapters::push::auth::{CachedToken, TokenCache};
use crate::adapters::push::http::{KeepAlive, build_client, classify_status, parse_endpoint, retry_after};
use crate::adapters::push::{PushError, PushProvider, SendReport, per_token_deadline, send_each};
use crate::config::{AndroidCredential, ConfigError, SectionAndroid};
use crate::domain::job::{MAX_REGISTRATION_IDS, Platform, PlatformOptions, Priority, PushJob};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Legacy HTTP endpoint, authenticated with `Authorization: key=<apikey>`.
pub const FCM_SEND_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";

/// Base URL of the HTTP v1 API.
pub const FCM_V1_ENDPOINT: &str = "https://fcm.googleapis.com";

const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Android sender speaking either the legacy multicast API or the HTTP v1 API.
pub struct FcmPushProvider {
    client: Client,
    timeout: Duration,
    mode: FcmMode,
}

enum FcmMode {
    Legacy { url: Url, api_key: String },
    V1 { send_url: Url, account: ServiceAccount, tokens: TokenCache },
}

struct ServiceAccount {
    client_email: String,
    token_uri: String,
    key: EncodingKey,
}

#[derive(Deserialize)]
struct ServiceAccountKeyFile {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

impl fmt::Debug for FcmPushProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FcmPushProvider")
            .field("timeout", &self.timeout)
            .field("mode", &mode_name(&self.mode))
            .finish_non_exhaustive()
    }
}

impl FcmPushProvider {
    /// Builds the sender, validating credentials and endpoint up front.
    ///
    /// # Errors
    /// Returns a `ConfigError` if the credentials are missing, ambiguous or unreadable, or the endpoint is invalid.
    pub fn new(config: &SectionAndroid) -> Result<Self, ConfigError> {
        let client = build_client(
            KeepAlive {
                timeout: config.timeout(),
                idle_timeout: config.keepalive_timeout(),
                max_idle: config.keepalive_conns,
            },
            |builder| builder,
        )?;

        let mode = match config.credential()? {
            AndroidCredential::LegacyKey(api_key) => {
                let url = parse_endpoint(config.endpoint.as_deref().unwrap_or(FCM_SEND_ENDPOINT))?;
                FcmMode::Legacy { url, api_key }
            }
            AndroidCredential::ServiceAccount { key_path, project_id } => {
                let base = parse_endpoint(config.endpoint.as_deref().unwrap_or(FCM_V1_ENDPOINT))?;
                let send_url = base
                    .join(&format!("/v1/projects/{project_id}/messages:send"))
                    .map_err(|e| ConfigError::Invalid(format!("failed to build FCM v1 URL: {e}")))?;
                let account = ServiceAccount::load(&key_path)?;
                FcmMode::V1 { send_url, account, tokens: TokenCache::new() }
            }
        };

        tracing::info!(mode = mode_name(&mode), "Android push sender configured");
        Ok(Self { client, timeout: config.timeout(), mode })
    }

    async fn send_legacy(&self, url: &Url, api_key: &str, job: &PushJob) -> Result<SendReport, PushError> {
        // Submission validation normally rejects this first.
        if job.tokens.len() > MAX_REGISTRATION_IDS {
            return Err(PushError::InvalidPayload(format!(
                "{} registration ids exceeds the limit of {MAX_REGISTRATION_IDS}",
                job.tokens.len()
            )));
        }

        let resp = self
            .client
            .post(url.clone())
            .header(AUTHORIZATION, format!("key={api_key}"))
            .json(&LegacyMessage::from_job(job))
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, body));
        }

        let body: LegacyResponse = resp
            .json()
            .await
            .map_err(|e| PushError::Gateway { status: 200, reason: format!("malformed response: {e}"), retry_after: None })?;

        if body.results.len() != job.tokens.len() {
            return Err(PushError::Gateway {
                status: 200,
                reason: format!("expected {} results, got {}", job.tokens.len(), body.results.len()),
                retry_after: None,
            });
        }

        let mut report = SendReport::default();
        for (token, result) in job.tokens.iter().zip(body.results) {
            match result.error {
                None => report.delivered.push(token.clone()),
                Some(code) => report.failures.push((token.clone(), classify_legacy_error(&code))),
            }
        }
        Ok(report)
    }

    async fn send_v1(
        &self,
        send_url: &Url,
        account: &ServiceAccount,
        tokens: &TokenCache,
        job: &PushJob,
    ) -> Result<SendReport, PushError> {
        let bearer = tokens.get_or_refresh(|| account.fetch_access_token(&self.client)).await?;

        let report = send_each(&job.tokens, |token| {
            let bearer = bearer.as_str();
            async move {
                let resp = self
                    .client
                    .post(send_url.clone())
                    .bearer_auth(bearer)
                    .json(&v1_message(job, token))
                    .send()
                    .await?;

                let status = resp.status();
                if status.is_success() {
                    return Ok(());
                }
                let headers = resp.headers().clone();
                let body = resp.text().await.unwrap_or_default();
                Err(classify_v1_error(status, &headers, &body))
            }
        })
        .await;

        if report.failures.iter().any(|(_, e)| matches!(e, PushError::Unauthorized(_))) {
            tokens.invalidate().await;
        }
        Ok(report)
    }
}

fn mode_name(mode: &FcmMode) -> &'static str {
    match mode {
        FcmMode::Legacy { .. } => "legacy",
        FcmMode::V1 { .. } => "v1",
    }
}

#[async_trait]
impl PushProvider for FcmPushProvider {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn deadline(&self, job: &PushJob) -> Duration {
        match self.mode {
            FcmMode::Legacy { .. } => self.timeout,
            FcmMode::V1 { .. } => per_token_deadline(self.timeout, job.tokens.len()),
        }
    }

    async fn send_push(&self, job: &PushJob) -> Result<SendReport, PushError> {
        if !matches!(job.options, PlatformOptions::Android(_)) {
            return Err(PushError::Internal(format!("{} job routed to the Android sender", job.platform())));
        }
        match &self.mode {
            FcmMode::Legacy { url, api_key } => self.send_legacy(url, api_key, job).await,
            FcmMode::V1 { send_url, account, tokens } => self.send_v1(send_url, account, tokens, job).await,
        }
    }
}

impl ServiceAccount {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let file: ServiceAccountKeyFile = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::Credential(format!("malformed service account key {}: {e}", path.display())))?;
        if file.client_email.is_empty() {
            return Err(ConfigError::Credential(format!("service account key {} has no client_email", path.display())));
        }
        let key = EncodingKey::from_rsa_pem(file.private_key.as_bytes())
            .map_err(|e| ConfigError::Credential(format!("invalid private key in {}: {e}", path.display())))?;

        Ok(Self {
            client_email: file.client_email,
            token_uri: file.token_uri.unwrap_or_else(|| GOOGLE_TOKEN_URI.to_string()),
            key,
        })
    }

    fn assertion(&self) -> Result<String, PushError> {
        let iat = time::OffsetDateTime::now_utc().unix_timestamp();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: FCM_SCOPE,
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| PushError::Unauthorized(format!("failed to sign assertion: {e}")))
    }

    async fn fetch_access_token(&self, client: &Client) -> Result<CachedToken, PushError> {
        let assertion = self.assertion()?;
        let resp = client
            .post(self.token_uri.as_str())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            return Err(if status.is_client_error() {
                PushError::Unauthorized(format!("token exchange failed: HTTP {}: {body}", status.as_u16()))
            } else {
                classify_status(status, &headers, body)
            });
        }

        let token: AccessTokenResponse = resp
            .json()
            .await
            .map_err(|e| PushError::Unauthorized(format!("malformed token response: {e}")))?;
        Ok(CachedToken::new(token.access_token, Duration::from_secs(token.expires_in), TOKEN_REFRESH_MARGIN))
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

const fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Serialize)]
struct LegacyMessage<'a> {
    registration_ids: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    collapse_key: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    delay_while_idle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_to_live: Option<u32>,
    priority: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification: Option<Value>,
    data: Map<String, Value>,
}

impl<'a> LegacyMessage<'a> {
    fn from_job(job: &'a PushJob) -> Self {
        let options = match &job.options {
            PlatformOptions::Android(options) => Some(options),
            PlatformOptions::Ios(_) => None,
        };
        Self {
            registration_ids: &job.tokens,
            collapse_key: options.and_then(|o| o.collapse_key.as_deref()),
            delay_while_idle: options.is_some_and(|o| o.delay_while_idle),
            time_to_live: options.and_then(|o| o.time_to_live),
            priority: match options.map(|o| o.priority).unwrap_or_default() {
                Priority::High => "high",
                Priority::Normal => "normal",
            },
            notification: notification_block(job),
            data: data_block(job),
        }
    }
}

fn notification_block(job: &PushJob) -> Option<Value> {
    job.title.as_ref().map(|title| json!({ "title": title, "body": job.message }))
}

fn data_block(job: &PushJob) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("message".to_string(), Value::String(job.message.clone()));
    for field in &job.extend {
        data.insert(field.key.clone(), Value::String(field.value.clone()));
    }
    data
}

fn v1_message(job: &PushJob, token: &str) -> Value {
    let mut android = Map::new();
    if let PlatformOptions::Android(options) = &job.options {
        if let Some(key) = &options.collapse_key {
            android.insert("collapse_key".into(), Value::String(key.clone()));
        }
        if let Some(ttl) = options.time_to_live {
            android.insert("ttl".into(), Value::String(format!("{ttl}s")));
        }
        let priority = match options.priority {
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
        };
        android.insert("priority".into(), Value::String(priority.into()));
    }

    let mut message = Map::new();
    message.insert("token".into(), Value::String(token.to_string()));
    message.insert("data".into(), Value::Object(data_block(job)));
    message.insert("android".into(), Value::Object(android));
    if let Some(notification) = notification_block(job) {
        message.insert("notification".into(), notification);
    }
    json!({ "message": message })
}

#[derive(Debug, Deserialize)]
struct LegacyResponse {
    #[serde(default)]
    results: Vec<LegacyResult>,
}

#[derive(Debug, Deserialize)]
struct LegacyResult {
    #[serde(default)]
    error: Option<String>,
}

/// Maps a per-token error code of the legacy API.
fn classify_legacy_error(code: &str) -> PushError {
    match code {
        "NotRegistered" => PushError::Unregistered,
        "InvalidRegistration" | "MismatchSenderId" | "MissingRegistration" => PushError::InvalidToken(code.to_string()),
        "Unavailable" | "InternalServerError" => {
            PushError::Gateway { status: 200, reason: code.to_string(), retry_after: None }
        }
        "DeviceMessageRateExceeded" | "TopicsMessageRateExceeded" => PushError::QuotaExceeded { retry_after: None },
        "MessageTooBig" | "InvalidTtl" | "InvalidDataKey" | "InvalidPackageName" => {
            PushError::InvalidPayload(code.to_string())
        }
        other => PushError::InvalidPayload(format!("unknown error {other}")),
    }
}

#[derive(Debug, Deserialize)]
struct V1ErrorBody {
    error: V1Error,
}

#[derive(Debug, Deserialize)]
struct V1Error {
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<V1ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct V1ErrorDetail {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
}

fn classify_v1_error(status: StatusCode, headers: &reqwest::header::HeaderMap, body: &str) -> PushError {
    let parsed = serde_json::from_str::<V1ErrorBody>(body).ok();
    let code = parsed.as_ref().and_then(|b| b.error.details.iter().find_map(|d| d.error_code.clone()));
    let message = parsed.map_or_else(|| body.to_string(), |b| b.error.message);

    match (status, code.as_deref()) {
        (_, Some("UNREGISTERED")) | (StatusCode::NOT_FOUND, _) => PushError::Unregistered,
        (_, Some("SENDER_ID_MISMATCH")) => PushError::InvalidToken(message),
        (_, Some("QUOTA_EXCEEDED")) => PushError::QuotaExceeded { retry_after: retry_after(headers) },
        (_, Some("THIRD_PARTY_AUTH_ERROR")) => PushError::Unauthorized(message),
        _ => classify_status(status, headers, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::{AndroidOptions, ExtendField};
    use reqwest::header::HeaderMap;

    fn job() -> PushJob {
        let mut job = PushJob::new(
            vec!["t1".into(), "t2".into()],
            "hello",
            PlatformOptions::Android(AndroidOptions {
                collapse_key: Some("news".into()),
                time_to_live: Some(60),
                priority: Priority::High,
                ..Default::default()
            }),
        );
        job.title = Some("Greeting".into());
        job.extend = vec![ExtendField { key: "kind".into(), value: "chat".into() }];
        job
    }

    #[test]
    fn test_legacy_message_shape() {
        let job = job();
        let body = serde_json::to_value(LegacyMessage::from_job(&job)).unwrap();
        assert_eq!(body["registration_ids"], json!(["t1", "t2"]));
        assert_eq!(body["collapse_key"], "news");
        assert_eq!(body["time_to_live"], 60);
        assert_eq!(body["priority"], "high");
        assert_eq!(body["notification"]["title"], "Greeting");
        assert_eq!(body["data"]["message"], "hello");
        assert_eq!(body["data"]["kind"], "chat");
        assert!(body.get("delay_while_idle").is_none());
    }

    #[test]
    fn test_v1_message_shape() {
        let body = v1_message(&job(), "t1");
        assert_eq!(body["message"]["token"], "t1");
        assert_eq!(body["message"]["android"]["ttl"], "60s");
        assert_eq!(body["message"]["android"]["priority"], "HIGH");
        assert_eq!(body["message"]["data"]["message"], "hello");
    }

    #[test]
    fn test_legacy_error_codes() {
        assert_eq!(classify_legacy_error("NotRegistered"), PushError::Unregistered);
        assert!(!classify_legacy_error("InvalidRegistration").is_retryable());
        assert!(classify_legacy_error("Unavailable").is_retryable());
        assert!(classify_legacy_error("DeviceMessageRateExceeded").is_retryable());
        assert!(!classify_legacy_error("MessageTooBig").is_retryable());
    }

    #[test]
    fn test_v1_error_codes() {
        let headers = HeaderMap::new();
        let unregistered = r#"{"error":{"code":404,"message":"not found","details":[{"errorCode":"UNREGISTERED"}]}}"#;
        assert_eq!(classify_v1_error(StatusCode::NOT_FOUND, &headers, unregistered), PushError::Unregistered);

        let quota = r#"{"error":{"code":429,"message":"slow down","details":[{"errorCode":"QUOTA_EXCEEDED"}]}}"#;
        assert!(classify_v1_error(StatusCode::TOO_MANY_REQUESTS, &headers, quota).is_retryable());

        let invalid = r#"{"error":{"code":400,"message":"bad","details":[{"errorCode":"INVALID_ARGUMENT"}]}}"#;
        assert!(matches!(classify_v1_error(StatusCode::BAD_REQUEST, &headers, invalid), PushError::InvalidPayload(_)));

        assert!(classify_v1_error(StatusCode::SERVICE_UNAVAILABLE, &headers, "oops").is_retryable());
    }

    #[test]
    fn test_construction_requires_credentials() {
        let res = FcmPushProvider::new(&SectionAndroid::default());
        assert!(matches!(res, Err(ConfigError::Credential(_))));
    }

    #[test]
    fn test_construction_rejects_bad_endpoint() {
        let config = SectionAndroid { apikey: "key".into(), endpoint: Some("::nope::".into()), ..Default::default() };
        assert!(matches!(FcmPushProvider::new(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_construction_rejects_unreadable_service_account() {
        let config = SectionAndroid {
            service_account_key_path: "/nonexistent/sa.json".into(),
            project_id: "proj".into(),
            ..Default::default()
        };
        assert!(matches!(FcmPushProvider::new(&config), Err(ConfigError::Read { .. })));
    }
}

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Command line interface. Flags override values from the configuration file.
#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long = "config", env = "PUSHGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short = 'p', long, env = "PUSHGATE_PORT")]
    pub port: Option<String>,

    /// Number of push workers
    #[arg(short = 'w', long, env = "PUSHGATE_WORKERS")]
    pub workers: Option<usize>,

    /// Capacity of the job queue
    #[arg(short = 'q', long, env = "PUSHGATE_QUEUES")]
    pub queues: Option<usize>,

    /// Initial cap on concurrent outbound sends (0 = unlimited)
    #[arg(long, env = "PUSHGATE_PUSHER_MAX")]
    pub pusher_max: Option<u64>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid credentials: {0}")]
    Credential(String),
}

/// Failure to merge a TOML document onto a base configuration.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error(transparent)]
    Document(#[from] toml::de::Error),
    #[error("base configuration cannot be expressed as TOML: {0}")]
    Base(#[from] toml::ser::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub core: SectionCore,
    pub android: SectionAndroid,
    pub ios: SectionIos,
    pub log: SectionLog,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionCore {
    pub port: String,
    pub workers: usize,
    pub queues: usize,
    pub notification_max: usize,
    /// Startup value only. The live cap is held by `PusherLimit`.
    pub pusher_max: u64,
    /// Seconds
    pub shutdown_timeout: u64,
    pub allows_empty_message: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionAndroid {
    pub enabled: bool,
    pub apikey: String,
    pub service_account_key_path: String,
    pub project_id: String,
    /// Seconds
    pub timeout: u64,
    /// Seconds
    pub keepalive_timeout: u64,
    pub keepalive_conns: usize,
    pub retry_max: u32,
    pub endpoint: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionIos {
    pub enabled: bool,
    pub pem_cert_path: String,
    pub pem_key_path: String,
    pub pem_key_passphrase: String,
    pub token_auth_key_path: String,
    pub token_auth_key_id: String,
    pub token_auth_team_id: String,
    pub sandbox: bool,
    pub topic: String,
    /// Seconds
    pub timeout: u64,
    /// Seconds
    pub keepalive_timeout: u64,
    pub keepalive_conns: usize,
    pub retry_max: u32,
    pub endpoint: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionLog {
    pub level: String,
    pub format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// How the Android sender authenticates against FCM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AndroidCredential {
    /// Legacy HTTP API, `Authorization: key=<apikey>`.
    LegacyKey(String),
    /// HTTP v1 API with an OAuth2 token minted from a service account key.
    ServiceAccount { key_path: PathBuf, project_id: String },
}

/// How the iOS sender authenticates against APNs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IosCredential {
    Certificate { cert_path: PathBuf, key_path: PathBuf },
    Token { key_path: PathBuf, key_id: String, team_id: String },
}

fn cpu_count() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

impl Default for Config {
    fn default() -> Self {
        Self::build_default()
    }
}

impl Default for SectionCore {
    fn default() -> Self {
        Self {
            port: "1056".to_string(),
            workers: cpu_count(),
            queues: 8192,
            notification_max: 100,
            pusher_max: 0,
            shutdown_timeout: 10,
            allows_empty_message: false,
        }
    }
}

impl Default for SectionAndroid {
    fn default() -> Self {
        Self {
            enabled: true,
            apikey: String::new(),
            service_account_key_path: String::new(),
            project_id: String::new(),
            timeout: 5,
            keepalive_timeout: 90,
            keepalive_conns: cpu_count(),
            retry_max: 1,
            endpoint: None,
        }
    }
}

impl Default for SectionIos {
    fn default() -> Self {
        Self {
            enabled: true,
            pem_cert_path: String::new(),
            pem_key_path: String::new(),
            pem_key_passphrase: String::new(),
            token_auth_key_path: String::new(),
            token_auth_key_id: String::new(),
            token_auth_team_id: String::new(),
            sandbox: true,
            topic: String::new(),
            timeout: 5,
            keepalive_timeout: 90,
            keepalive_conns: cpu_count(),
            retry_max: 1,
            endpoint: None,
        }
    }
}

impl Default for SectionLog {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Text, otlp_endpoint: None }
    }
}

impl Config {
    /// Returns a fully populated configuration with CPU-scaled defaults.
    #[must_use]
    pub fn build_default() -> Self {
        Self {
            core: SectionCore::default(),
            android: SectionAndroid::default(),
            ios: SectionIos::default(),
            log: SectionLog::default(),
        }
    }

    /// Reads a TOML document and merges it onto `base` field by field.
    ///
    /// Sections and fields missing from the document keep the value they have in `base`.
    /// Nothing is applied if the document cannot be read or parsed.
    ///
    /// # Errors
    /// Returns `ConfigError::Read` if the file cannot be read and `ConfigError::Parse` if it is malformed.
    pub fn load(base: Self, path: &Path) -> Result<Self, ConfigError> {
        let doc = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::merge_str(base, &doc).map_err(|e| match e {
            MergeError::Document(source) => ConfigError::Parse { path: path.to_path_buf(), source },
            MergeError::Base(e) => ConfigError::Invalid(e.to_string()),
        })
    }

    /// Merges a TOML document onto `base`.
    ///
    /// # Errors
    /// Returns `MergeError::Document` if the document is malformed and `MergeError::Base` if
    /// `base` holds a value TOML cannot represent.
    pub fn merge_str(base: Self, doc: &str) -> Result<Self, MergeError> {
        let overrides: toml::Table = toml::from_str(doc)?;
        let mut merged = toml::Table::try_from(&base)?;
        merge_tables(&mut merged, overrides);
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Loads defaults, the optional file and the CLI overrides, then validates the result.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or the result fails validation.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = Self::build_default();
        if let Some(path) = &cli.config {
            config = Self::load(config, path)?;
        }
        if let Some(port) = &cli.port {
            config.core.port.clone_from(port);
        }
        if let Some(workers) = cli.workers {
            config.core.workers = workers;
        }
        if let Some(queues) = cli.queues {
            config.core.queues = queues;
        }
        if let Some(pusher_max) = cli.pusher_max {
            config.core.pusher_max = pusher_max;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks the numeric invariants the engine relies on.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.core.workers == 0, "core.workers must be greater than 0"),
            (self.core.queues == 0, "core.queues must be greater than 0"),
            (self.core.notification_max == 0, "core.notification_max must be greater than 0"),
            (self.android.timeout == 0, "android.timeout must be greater than 0"),
            (self.android.keepalive_conns == 0, "android.keepalive_conns must be greater than 0"),
            (self.ios.timeout == 0, "ios.timeout must be greater than 0"),
            (self.ios.keepalive_conns == 0, "ios.keepalive_conns must be greater than 0"),
        ];
        match checks.into_iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Invalid(message.to_string())),
            None => Ok(()),
        }
    }

}

fn merge_tables(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => merge_tables(existing, nested),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

impl SectionCore {
    /// Socket address to bind. A bare port listens on every interface.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        if self.port.contains(':') { self.port.clone() } else { format!("0.0.0.0:{}", self.port) }
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

impl SectionAndroid {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    #[must_use]
    pub const fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout)
    }

    #[must_use]
    pub fn is_legacy_key_provider(&self) -> bool {
        !self.apikey.is_empty()
    }

    #[must_use]
    pub fn is_service_account_provider(&self) -> bool {
        !self.service_account_key_path.is_empty() && !self.project_id.is_empty()
    }

    /// Resolves the credential mode from the populated fields.
    ///
    /// # Errors
    /// Returns `ConfigError::Credential` when neither or both modes are populated.
    pub fn credential(&self) -> Result<AndroidCredential, ConfigError> {
        match (self.is_legacy_key_provider(), self.is_service_account_provider()) {
            (true, false) => Ok(AndroidCredential::LegacyKey(self.apikey.clone())),
            (false, true) => Ok(AndroidCredential::ServiceAccount {
                key_path: PathBuf::from(&self.service_account_key_path),
                project_id: self.project_id.clone(),
            }),
            (true, true) => Err(ConfigError::Credential(
                "android: both apikey and service_account_key_path are set, pick one".to_string(),
            )),
            (false, false) => Err(ConfigError::Credential(
                "android: set either apikey or service_account_key_path and project_id".to_string(),
            )),
        }
    }
}

impl SectionIos {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    #[must_use]
    pub const fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout)
    }

    #[must_use]
    pub fn is_token_based_provider(&self) -> bool {
        !self.token_auth_key_path.is_empty() && !self.token_auth_key_id.is_empty() && !self.token_auth_team_id.is_empty()
    }

    #[must_use]
    pub fn is_certificate_based_provider(&self) -> bool {
        !self.pem_cert_path.is_empty() && !self.pem_key_path.is_empty()
    }

    /// Resolves the credential mode from the populated fields.
    ///
    /// # Errors
    /// Returns `ConfigError::Credential` when neither or both modes are populated, or when the
    /// certificate key is passphrase protected.
    pub fn credential(&self) -> Result<IosCredential, ConfigError> {
        match (self.is_certificate_based_provider(), self.is_token_based_provider()) {
            (true, false) => {
                if !self.pem_key_passphrase.is_empty() {
                    return Err(ConfigError::Credential(
                        "ios: passphrase protected keys are not supported, decrypt pem_key_path first".to_string(),
                    ));
                }
                Ok(IosCredential::Certificate {
                    cert_path: PathBuf::from(&self.pem_cert_path),
                    key_path: PathBuf::from(&self.pem_key_path),
                })
            }
            (false, true) => Ok(IosCredential::Token {
                key_path: PathBuf::from(&self.token_auth_key_path),
                key_id: self.token_auth_key_id.clone(),
                team_id: self.token_auth_team_id.clone(),
            }),
            (true, true) => Err(ConfigError::Credential(
                "ios: both certificate and token credentials are set, pick one".to_string(),
            )),
            (false, false) => Err(ConfigError::Credential(
                "ios: set pem_cert_path and pem_key_path, or token_auth_key_path, token_auth_key_id and token_auth_team_id"
                    .to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::build_default();
        assert_eq!(config.core.port, "1056");
        assert_eq!(config.core.listen_addr(), "0.0.0.0:1056");
        assert!(config.core.workers > 0);
        assert_eq!(config.core.queues, 8192);
        assert_eq!(config.core.notification_max, 100);
        assert_eq!(config.core.pusher_max, 0);
        assert_eq!(config.core.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.android.keepalive_conns, config.core.workers);
        assert_eq!(config.android.retry_max, 1);
        assert!(config.ios.sandbox);
        assert_eq!(config.log.format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_keeps_unspecified_fields() {
        let mut base = Config::build_default();
        base.core.workers = 3;
        let doc = r#"
            [core]
            queues = 100
            pusher_max = 5

            [ios]
            topic = "com.example.app"
        "#;

        let merged = Config::merge_str(base, doc).unwrap();
        assert_eq!(merged.core.queues, 100);
        assert_eq!(merged.core.pusher_max, 5);
        assert_eq!(merged.core.workers, 3);
        assert_eq!(merged.core.notification_max, 100);
        assert_eq!(merged.ios.topic, "com.example.app");
        assert_eq!(merged.ios.timeout, 5);
    }

    #[test]
    fn test_merge_keeps_optional_base_fields() {
        let mut base = Config::build_default();
        base.ios.endpoint = Some("http://127.0.0.1:8443".into());

        let merged = Config::merge_str(base, "[ios]\nsandbox = false\n").unwrap();
        assert_eq!(merged.ios.endpoint.as_deref(), Some("http://127.0.0.1:8443"));
        assert!(!merged.ios.sandbox);
        assert_eq!(merged.log.otlp_endpoint, None);
    }

    #[test]
    fn test_unrepresentable_base_is_not_a_parse_error() {
        let mut base = Config::build_default();
        base.core.pusher_max = u64::MAX;
        assert!(matches!(Config::merge_str(base.clone(), "[core]\nqueues = 10\n"), Err(MergeError::Base(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pushgate.toml");
        std::fs::write(&path, "[core]\nqueues = 10\n").unwrap();
        assert!(matches!(Config::load(base, &path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_merge_rejects_malformed_document() {
        let res = Config::merge_str(Config::build_default(), "[core\nworkers = ");
        assert!(matches!(res, Err(MergeError::Document(_))));
    }

    #[test]
    fn test_merge_rejects_wrong_type() {
        let res = Config::merge_str(Config::build_default(), "[core]\nworkers = \"many\"");
        assert!(res.is_err());
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let res = Config::load(Config::build_default(), Path::new("/nonexistent/pushgate.toml"));
        assert!(matches!(res, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pushgate.toml");
        std::fs::write(&path, "[android]\napikey = \"abc\"\nretry_max = 3\n[log]\nformat = \"json\"\n").unwrap();

        let config = Config::load(Config::build_default(), &path).unwrap();
        assert_eq!(config.android.apikey, "abc");
        assert_eq!(config.android.retry_max, 3);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_load_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();

        let res = Config::load(Config::build_default(), &path);
        assert!(matches!(res, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::build_default();
        config.core.workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("core.workers"));
    }

    #[test]
    fn test_certificate_only_selects_certificate_mode() {
        let ios = SectionIos {
            pem_cert_path: "cert.pem".into(),
            pem_key_path: "key.pem".into(),
            ..SectionIos::default()
        };
        assert!(ios.is_certificate_based_provider());
        assert!(!ios.is_token_based_provider());
        assert!(matches!(ios.credential(), Ok(IosCredential::Certificate { .. })));
    }

    #[test]
    fn test_token_only_selects_token_mode() {
        let ios = SectionIos {
            token_auth_key_path: "AuthKey.p8".into(),
            token_auth_key_id: "KEYID".into(),
            token_auth_team_id: "TEAMID".into(),
            ..SectionIos::default()
        };
        assert!(ios.is_token_based_provider());
        assert!(!ios.is_certificate_based_provider());
        assert!(matches!(ios.credential(), Ok(IosCredential::Token { .. })));
    }

    #[test]
    fn test_partial_token_fields_are_not_a_provider() {
        let ios = SectionIos { token_auth_key_path: "AuthKey.p8".into(), ..SectionIos::default() };
        assert!(!ios.is_token_based_provider());
        assert!(matches!(ios.credential(), Err(ConfigError::Credential(_))));
    }

    #[test]
    fn test_ambiguous_ios_credentials_are_rejected() {
        let ios = SectionIos {
            pem_cert_path: "cert.pem".into(),
            pem_key_path: "key.pem".into(),
            token_auth_key_path: "AuthKey.p8".into(),
            token_auth_key_id: "KEYID".into(),
            token_auth_team_id: "TEAMID".into(),
            ..SectionIos::default()
        };
        let err = ios.credential().unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn test_passphrase_key_is_rejected() {
        let ios = SectionIos {
            pem_cert_path: "cert.pem".into(),
            pem_key_path: "key.pem".into(),
            pem_key_passphrase: "secret".into(),
            ..SectionIos::default()
        };
        assert!(matches!(ios.credential(), Err(ConfigError::Credential(_))));
    }

    #[test]
    fn test_android_credential_selection() {
        let legacy = SectionAndroid { apikey: "key".into(), ..SectionAndroid::default() };
        assert_eq!(legacy.credential().unwrap(), AndroidCredential::LegacyKey("key".into()));

        let v1 = SectionAndroid {
            service_account_key_path: "sa.json".into(),
            project_id: "proj".into(),
            ..SectionAndroid::default()
        };
        assert!(matches!(v1.credential(), Ok(AndroidCredential::ServiceAccount { .. })));

        assert!(SectionAndroid::default().credential().is_err());
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let cli = Cli { config: None, port: Some("8080".into()), workers: Some(4), queues: Some(100), pusher_max: Some(2) };
        let config = Config::from_cli(&cli).unwrap();
        assert_eq!(config.core.port, "8080");
        assert_eq!(config.core.workers, 4);
        assert_eq!(config.core.queues, 100);
        assert_eq!(config.core.pusher_max, 2);
    }
}

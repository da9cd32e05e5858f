#![allow(dead_code, clippy::unwrap_used, clippy::panic, clippy::missing_panics_doc, clippy::must_use_candidate, missing_debug_implementations, clippy::clone_on_ref_ptr, unreachable_pub)]
use async_trait::async_trait;
use pushgate::adapters::push::{PushError, PushProvider, SendReport};
use pushgate::api::{AppState, app_router};
use pushgate::config::Config;
use pushgate::domain::job::{AndroidOptions, IosOptions, Platform, PlatformOptions, PushJob};
use pushgate::domain::outcome::PushResult;
use pushgate::services::{DispatchEngine, EngineSettings, ResultReporter, RetryPolicy, Senders};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

static INIT: Once = Once::new();

pub fn setup_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "warn".into())
            .add_directive("pushgate=debug".parse().unwrap())
            .add_directive("tower=warn".parse().unwrap())
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap())
            .add_directive("rustls=warn".parse().unwrap());

        tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().init();
    });
}

pub fn get_test_config() -> Config {
    let mut config = Config::build_default();
    config.core.workers = 4;
    config.core.queues = 100;
    config.core.shutdown_timeout = 1;
    config.android.apikey = "test-key".to_string();
    config.ios.enabled = false;
    config
}

/// Fast backoff so retry tests do not sleep for real gateway delays.
pub fn fast_retry(retry_max: u32) -> RetryPolicy {
    RetryPolicy::new(retry_max).with_delays(Duration::from_millis(1), Duration::from_millis(5))
}

pub fn android_job(tokens: &[&str]) -> PushJob {
    PushJob::new(
        tokens.iter().map(|t| (*t).to_string()).collect(),
        "hello",
        PlatformOptions::Android(AndroidOptions::default()),
    )
}

pub fn ios_job(tokens: &[&str]) -> PushJob {
    PushJob::new(tokens.iter().map(|t| (*t).to_string()).collect(), "hello", PlatformOptions::Ios(IosOptions::default()))
}

pub fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
}

type Script = Box<dyn Fn(&PushJob, u32) -> Result<SendReport, PushError> + Send + Sync>;

/// Scripted sender that records how many sends run at once.
pub struct MockProvider {
    platform: Platform,
    delay: Duration,
    timeout: Duration,
    script: Script,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockProvider")
            .field("platform", &self.platform)
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockProvider {
    /// A sender that delivers every token.
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            delay: Duration::ZERO,
            timeout: Duration::from_secs(30),
            script: Box::new(|job, _| Ok(SendReport { delivered: job.tokens.clone(), failures: Vec::new() })),
            calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `script` receives the job and the 1-based call number.
    pub fn with_script(
        mut self,
        script: impl Fn(&PushJob, u32) -> Result<SendReport, PushError> + Send + Sync + 'static,
    ) -> Self {
        self.script = Box::new(script);
        self
    }

    /// Fails every call with the same job-level error.
    pub fn failing(self, error: PushError) -> Self {
        self.with_script(move |_, _| Err(error.clone()))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.peak.store(self.current(), Ordering::SeqCst);
    }
}

#[async_trait]
impl PushProvider for MockProvider {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send_push(&self, job: &PushJob) -> Result<SendReport, PushError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak.fetch_max(now, Ordering::SeqCst);

        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(job, call)
    }
}

/// Collects every terminal outcome.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    results: Mutex<Vec<PushResult>>,
    notify: Notify,
}

impl ResultReporter for CollectingReporter {
    fn report(&self, result: &PushResult) {
        self.results.lock().unwrap().push(result.clone());
        self.notify.notify_waiters();
    }
}

impl CollectingReporter {
    pub fn results(&self) -> Vec<PushResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    /// Waits until at least `count` outcomes were reported.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<PushResult> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.len() >= count {
                return self.results();
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            assert!(!remaining.is_zero(), "expected {count} results, got {}", self.len());
            let _ = tokio::time::timeout(remaining.min(Duration::from_millis(50)), notified).await;
        }
    }
}

pub fn engine_with(
    settings: EngineSettings,
    provider: Arc<MockProvider>,
    retry: RetryPolicy,
) -> (DispatchEngine, Arc<CollectingReporter>) {
    setup_tracing();
    let reporter = Arc::new(CollectingReporter::default());
    let senders = Senders::default().register(provider, retry);
    let engine = DispatchEngine::start(settings, senders, Arc::clone(&reporter) as Arc<dyn ResultReporter>);
    (engine, reporter)
}

pub struct TestApp {
    pub server_url: String,
    pub client: reqwest::Client,
    pub config: Config,
    pub engine: Arc<DispatchEngine>,
    pub reporter: Arc<CollectingReporter>,
    pub provider: Arc<MockProvider>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(get_test_config(), MockProvider::new(Platform::Android)).await
    }

    pub async fn spawn_with(config: Config, provider: MockProvider) -> Self {
        setup_tracing();
        let provider = Arc::new(provider);
        let reporter = Arc::new(CollectingReporter::default());
        let senders = Senders::default().register(Arc::clone(&provider) as Arc<dyn PushProvider>, fast_retry(config.android.retry_max));
        let engine = Arc::new(DispatchEngine::start(
            EngineSettings::from(&config.core),
            senders,
            Arc::clone(&reporter) as Arc<dyn ResultReporter>,
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app_router(AppState::new(Arc::clone(&engine), &config));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            server_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            config,
            engine,
            reporter,
            provider,
        }
    }

    pub async fn put_pushers(&self, query: &str) -> (reqwest::StatusCode, serde_json::Value) {
        let resp = self.client.put(format!("{}/config/pushers?{query}", self.server_url)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    pub async fn stats(&self) -> serde_json::Value {
        self.client.get(format!("{}/stat/app", self.server_url)).send().await.unwrap().json().await.unwrap()
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

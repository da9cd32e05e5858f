use crate::adapters::push::PushError;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub value: String,
    pub refresh_at: Instant,
}

impl CachedToken {
    /// A token that should be replaced `lifetime - margin` from now.
    #[must_use]
    pub fn new(value: String, lifetime: Duration, margin: Duration) -> Self {
        Self { value, refresh_at: Instant::now() + lifetime.saturating_sub(margin) }
    }

    fn is_fresh(&self) -> bool {
        Instant::now() < self.refresh_at
    }
}

/// Bearer token shared by every concurrent send, refreshed ahead of expiry.
#[derive(Debug, Default)]
pub struct TokenCache {
    inner: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached token, minting a new one with `refresh` if it is missing or stale.
    ///
    /// # Errors
    /// Propagates the error from `refresh`.
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<String, PushError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedToken, PushError>>,
    {
        if let Some(token) = self.inner.read().await.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }

        let mut guard = self.inner.write().await;
        // Another sender may have refreshed while we waited for the write lock.
        if let Some(token) = guard.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }

        let token = refresh().await?;
        tracing::debug!("Refreshed push gateway bearer token");
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    /// Drops the cached token so the next send mints a new one.
    pub async fn invalidate(&self) {
        *self.inner.write().await = None;
    }
}

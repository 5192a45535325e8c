use super::token::AccessToken;
use crate::config::TOKEN_RESOURCE;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info};

/// A source able to issue bearer tokens for a resource URL.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Short label used in logs and chained error messages.
    fn name(&self) -> &'static str;

    async fn get_token(&self, resource: &str) -> StoreResult<AccessToken>;
}

/// Holds the current database token and refreshes it before it expires.
///
/// Readers always get the latest `Arc<AccessToken>`; a refresh swaps the
/// whole value. Concurrent callers that find the token stale wait on a
/// single in-flight fetch.
pub struct CredentialProvider {
    credential: Arc<dyn TokenCredential>,
    resource: String,
    refresh_margin: Duration,
    current: RwLock<Option<Arc<AccessToken>>>,
    refresh_lock: AsyncMutex<()>,
}

impl CredentialProvider {
    pub fn new(credential: Arc<dyn TokenCredential>, refresh_margin: Duration) -> Self {
        Self {
            credential,
            resource: TOKEN_RESOURCE.to_string(),
            refresh_margin,
            current: RwLock::new(None),
            refresh_lock: AsyncMutex::new(()),
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Current token, fetching a new one if absent or about to expire.
    pub async fn get_token(&self) -> StoreResult<Arc<AccessToken>> {
        if let Some(token) = self.fresh_cached().await {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(token) = self.fresh_cached().await {
            return Ok(token);
        }
        self.fetch_and_store().await
    }

    /// Fetch a new token unconditionally and make it current.
    pub async fn refresh(&self) -> StoreResult<Arc<AccessToken>> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch_and_store().await
    }

    /// Last stored token, without checking expiry or fetching.
    pub async fn cached(&self) -> Option<Arc<AccessToken>> {
        self.current.read().await.clone()
    }

    async fn fresh_cached(&self) -> Option<Arc<AccessToken>> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|t| !t.expires_within(self.refresh_margin))
            .cloned()
    }

    async fn fetch_and_store(&self) -> StoreResult<Arc<AccessToken>> {
        let token = self.credential.get_token(&self.resource).await?;
        if token.is_expired() {
            return Err(StoreError::Authentication(format!(
                "{} issued a token that expired at {}",
                self.credential.name(),
                token.expires_on()
            )));
        }
        if token.expires_within(self.refresh_margin) {
            debug!(
                source = self.credential.name(),
                expires_on = %token.expires_on(),
                "issued token expires inside the refresh margin"
            );
        }
        info!(
            source = self.credential.name(),
            expires_on = %token.expires_on(),
            "database access token acquired"
        );
        let token = Arc::new(token);
        *self.current.write().await = Some(token.clone());
        Ok(token)
    }
}

/// Hands out pre-issued tokens in order, repeating the last one.
///
/// Useful for local databases and tests that simulate rotation.
pub struct StaticCredential {
    tokens: Mutex<Vec<AccessToken>>,
    issued: Mutex<usize>,
}

impl StaticCredential {
    pub fn new(token: AccessToken) -> Self {
        Self::sequence(vec![token])
    }

    pub fn sequence(tokens: Vec<AccessToken>) -> Self {
        Self {
            tokens: Mutex::new(tokens),
            issued: Mutex::new(0),
        }
    }

    /// Number of tokens handed out so far.
    pub fn issued(&self) -> usize {
        *self.issued.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TokenCredential for StaticCredential {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn get_token(&self, _resource: &str) -> StoreResult<AccessToken> {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        let idx = (*issued).min(tokens.len().saturating_sub(1));
        let token = tokens
            .get(idx)
            .cloned()
            .ok_or_else(|| StoreError::Authentication("no static token configured".into()))?;
        *issued += 1;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn token(secret: &str, valid_for_secs: i64) -> AccessToken {
        AccessToken::new(secret, Utc::now() + ChronoDuration::seconds(valid_for_secs))
    }

    #[tokio::test]
    async fn reuses_token_until_refresh_margin() {
        let cred = Arc::new(StaticCredential::sequence(vec![
            token("first", 3600),
            token("second", 3600),
        ]));
        let provider = CredentialProvider::new(cred.clone(), Duration::from_secs(300));

        let a = provider.get_token().await.unwrap();
        let b = provider.get_token().await.unwrap();
        assert_eq!(a.secret(), "first");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cred.issued(), 1);

        let c = provider.refresh().await.unwrap();
        assert_eq!(c.secret(), "second");
        assert_eq!(provider.cached().await.unwrap().secret(), "second");
    }

    #[tokio::test]
    async fn refetches_when_token_is_inside_margin() {
        let cred = Arc::new(StaticCredential::sequence(vec![
            token("short", 60),
            token("long", 3600),
        ]));
        let provider = CredentialProvider::new(cred.clone(), Duration::from_secs(300));

        assert_eq!(provider.get_token().await.unwrap().secret(), "short");
        assert_eq!(provider.get_token().await.unwrap().secret(), "long");
        assert_eq!(cred.issued(), 2);
    }

    #[tokio::test]
    async fn rejects_already_expired_token() {
        let cred = Arc::new(StaticCredential::new(token("stale", -10)));
        let provider = CredentialProvider::new(cred, Duration::from_secs(0));

        let err = provider.get_token().await.unwrap_err();
        assert!(matches!(err, StoreError::Authentication(_)));
        assert!(provider.cached().await.is_none());
    }

    /// First token is already inside the margin; later ones are long-lived.
    #[derive(Default)]
    struct SlowCredential {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl TokenCredential for SlowCredential {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn get_token(&self, _resource: &str) -> StoreResult<AccessToken> {
            let n = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(if n == 0 {
                token("stale", 60)
            } else {
                token("fresh", 3600)
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_refresh() {
        let cred = Arc::new(SlowCredential::default());
        let provider = Arc::new(CredentialProvider::new(
            cred.clone(),
            Duration::from_secs(300),
        ));
        assert_eq!(provider.get_token().await.unwrap().secret(), "stale");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move { provider.get_token().await })
            })
            .collect();
        let mut tokens = Vec::new();
        for h in handles {
            tokens.push(h.await.unwrap().unwrap());
        }

        assert_eq!(cred.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(tokens[0].secret(), "fresh");
        assert!(tokens.iter().all(|t| Arc::ptr_eq(t, &tokens[0])));
    }
}

//! Token resolution — turns a stored connection into a usable access token.
//!
//! Tokens live encrypted in the connection record. Resolution decrypts the
//! access token, refreshes it through the provider when it is near expiry,
//! and persists rotated credentials before handing the token out. Refresh
//! failures fall back to the stale token rather than erroring; the provider
//! rejects it downstream if it truly is dead.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::crypto::TokenCipher;
use crate::error::TokenError;
use crate::providers::{ProviderKind, ProviderRegistry};
use crate::store::Store;

/// Tokens expiring within this window count as stale.
const EXPIRY_SLACK_SECS: i64 = 60;

/// Resolves per-user access tokens, refreshing through the provider's OAuth
/// endpoint when needed.
pub struct TokenResolver {
    store: Arc<dyn Store>,
    cipher: Arc<TokenCipher>,
    registry: Arc<ProviderRegistry>,
}

impl TokenResolver {
    pub fn new(
        store: Arc<dyn Store>,
        cipher: Arc<TokenCipher>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            store,
            cipher,
            registry,
        }
    }

    /// Resolve a usable access token for the user's provider connection.
    ///
    /// Returns `None` when there is no connection or no decryptable access
    /// token. A stale token with no working refresh path is returned as-is.
    pub async fn access_token(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> Result<Option<String>, TokenError> {
        let Some(mut connection) = self.store.get_connection(user_id, provider).await? else {
            return Ok(None);
        };

        let Some(access_token) = self
            .try_decrypt(connection.access_token_enc.as_deref())
            .await
        else {
            return Ok(None);
        };

        let slack = Duration::seconds(EXPIRY_SLACK_SECS);
        if connection
            .token_expires_at
            .is_some_and(|expires| expires > Utc::now() + slack)
        {
            return Ok(Some(access_token));
        }

        let Some(refresh_token) = self
            .try_decrypt(connection.refresh_token_enc.as_deref())
            .await
        else {
            // Nothing to refresh with; the stale token is all we have.
            return Ok(Some(access_token));
        };

        let Some(provider_impl) = self.registry.get(provider) else {
            warn!(%provider, "No provider registered; returning stale token");
            return Ok(Some(access_token));
        };

        let refreshed = match provider_impl.refresh_access_token(&refresh_token).await {
            Ok(Some(refreshed)) => refreshed,
            Ok(None) => {
                warn!(user_id, %provider, "Token refresh rejected; returning stale token");
                return Ok(Some(access_token));
            }
            Err(e) => {
                warn!(user_id, %provider, "Token refresh failed: {e}; returning stale token");
                return Ok(Some(access_token));
            }
        };

        connection.access_token_enc =
            Some(self.cipher.encrypt_string(&refreshed.access_token).await?);
        connection.token_expires_at = refreshed
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs as i64));
        if let Some(new_refresh) = &refreshed.refresh_token {
            connection.refresh_token_enc = Some(self.cipher.encrypt_string(new_refresh).await?);
        }
        self.store.upsert_connection(&connection).await?;

        info!(user_id, %provider, "Access token refreshed");
        Ok(Some(refreshed.access_token))
    }

    /// Decrypt a stored token blob. Any failure reads as an absent token.
    async fn try_decrypt(&self, encrypted: Option<&str>) -> Option<String> {
        let encrypted = encrypted?;
        if encrypted.is_empty() {
            return None;
        }
        match self.cipher.decrypt_string(encrypted).await {
            Ok(token) if !token.is_empty() => Some(token),
            Ok(_) => None,
            Err(e) => {
                warn!("Stored token undecryptable: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use chrono::DateTime;
    use secrecy::SecretString;

    use crate::crypto::LocalKeyWrapper;
    use crate::error::ProviderError;
    use crate::providers::{FetchedMessage, MailProvider, RefreshedToken};
    use crate::store::{LibSqlStore, ProviderConnection};

    enum RefreshBehavior {
        Succeed(RefreshedToken),
        Reject,
        Fail,
    }

    struct MockProvider {
        behavior: RefreshBehavior,
        refresh_calls: AtomicUsize,
    }

    impl MockProvider {
        fn new(behavior: RefreshBehavior) -> Self {
            Self {
                behavior,
                refresh_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MailProvider for MockProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Gmail
        }

        async fn fetch_message(
            &self,
            _access_token: &str,
            _message_id: &str,
        ) -> Result<Option<FetchedMessage>, ProviderError> {
            unimplemented!("mock does not fetch")
        }

        async fn apply_action(
            &self,
            _access_token: &str,
            _message_id: &str,
            _destination: &str,
        ) -> Result<bool, ProviderError> {
            unimplemented!("mock does not apply actions")
        }

        async fn refresh_access_token(
            &self,
            _refresh_token: &str,
        ) -> Result<Option<RefreshedToken>, ProviderError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                RefreshBehavior::Succeed(token) => Ok(Some(token.clone())),
                RefreshBehavior::Reject => Ok(None),
                RefreshBehavior::Fail => Err(ProviderError::Request {
                    provider: "Gmail",
                    reason: "connection reset".to_string(),
                }),
            }
        }
    }

    fn test_cipher() -> Arc<TokenCipher> {
        let key = SecretString::from(BASE64.encode([7u8; 32]));
        let wrapper = LocalKeyWrapper::from_config(&key).unwrap();
        Arc::new(TokenCipher::new(Arc::new(wrapper)))
    }

    struct Fixture {
        store: Arc<LibSqlStore>,
        cipher: Arc<TokenCipher>,
        provider: Arc<MockProvider>,
        resolver: TokenResolver,
    }

    async fn fixture(behavior: RefreshBehavior) -> Fixture {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let cipher = test_cipher();
        let provider = Arc::new(MockProvider::new(behavior));

        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone());

        let resolver = TokenResolver::new(store.clone(), cipher.clone(), Arc::new(registry));
        Fixture {
            store,
            cipher,
            provider,
            resolver,
        }
    }

    async fn seed_connection(
        fx: &Fixture,
        access: Option<&str>,
        refresh: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) {
        let access_enc = match access {
            Some(token) => Some(fx.cipher.encrypt_string(token).await.unwrap()),
            None => None,
        };
        let refresh_enc = match refresh {
            Some(token) => Some(fx.cipher.encrypt_string(token).await.unwrap()),
            None => None,
        };
        fx.store
            .upsert_connection(&ProviderConnection {
                user_id: "u1".to_string(),
                provider: ProviderKind::Gmail,
                email: "alice@example.com".to_string(),
                access_token_enc: access_enc,
                refresh_token_enc: refresh_enc,
                token_expires_at: expires_at,
                connected_at: Utc::now(),
                watch_expires_at_ms: None,
            })
            .await
            .unwrap();
    }

    fn refreshed(access: &str) -> RefreshedToken {
        RefreshedToken {
            access_token: access.to_string(),
            expires_in: Some(3600),
            refresh_token: Some("rotated-refresh".to_string()),
        }
    }

    #[tokio::test]
    async fn missing_connection_yields_none() {
        let fx = fixture(RefreshBehavior::Reject).await;
        let token = fx.resolver.access_token("u1", ProviderKind::Gmail).await.unwrap();
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn fresh_token_returned_without_refresh() {
        let fx = fixture(RefreshBehavior::Reject).await;
        seed_connection(
            &fx,
            Some("live-token"),
            Some("refresh"),
            Some(Utc::now() + Duration::hours(1)),
        )
        .await;

        let token = fx.resolver.access_token("u1", ProviderKind::Gmail).await.unwrap();
        assert_eq!(token.as_deref(), Some("live-token"));
        assert_eq!(fx.provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undecryptable_access_token_yields_none() {
        let fx = fixture(RefreshBehavior::Reject).await;
        seed_connection(&fx, None, Some("refresh"), None).await;

        // Corrupt the stored access token directly
        let mut connection = fx
            .store
            .get_connection("u1", ProviderKind::Gmail)
            .await
            .unwrap()
            .unwrap();
        connection.access_token_enc = Some("not-a-valid-blob".to_string());
        fx.store.upsert_connection(&connection).await.unwrap();

        let token = fx.resolver.access_token("u1", ProviderKind::Gmail).await.unwrap();
        assert!(token.is_none());
        // No access token means no refresh attempt either
        assert_eq!(fx.provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_token_refreshes_and_persists() {
        let fx = fixture(RefreshBehavior::Succeed(refreshed("new-token"))).await;
        seed_connection(
            &fx,
            Some("old-token"),
            Some("old-refresh"),
            Some(Utc::now() - Duration::minutes(5)),
        )
        .await;

        let token = fx.resolver.access_token("u1", ProviderKind::Gmail).await.unwrap();
        assert_eq!(token.as_deref(), Some("new-token"));
        assert_eq!(fx.provider.refresh_calls.load(Ordering::SeqCst), 1);

        let connection = fx
            .store
            .get_connection("u1", ProviderKind::Gmail)
            .await
            .unwrap()
            .unwrap();
        let persisted_access = fx
            .cipher
            .decrypt_string(connection.access_token_enc.as_deref().unwrap())
            .await
            .unwrap();
        let persisted_refresh = fx
            .cipher
            .decrypt_string(connection.refresh_token_enc.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(persisted_access, "new-token");
        assert_eq!(persisted_refresh, "rotated-refresh");
        assert!(connection.token_expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn missing_expiry_counts_as_stale() {
        let fx = fixture(RefreshBehavior::Succeed(refreshed("new-token"))).await;
        seed_connection(&fx, Some("old-token"), Some("refresh"), None).await;

        let token = fx.resolver.access_token("u1", ProviderKind::Gmail).await.unwrap();
        assert_eq!(token.as_deref(), Some("new-token"));
        assert_eq!(fx.provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expiry_inside_slack_window_triggers_refresh() {
        let fx = fixture(RefreshBehavior::Succeed(refreshed("new-token"))).await;
        seed_connection(
            &fx,
            Some("old-token"),
            Some("refresh"),
            Some(Utc::now() + Duration::seconds(30)),
        )
        .await;

        let token = fx.resolver.access_token("u1", ProviderKind::Gmail).await.unwrap();
        assert_eq!(token.as_deref(), Some("new-token"));
        assert_eq!(fx.provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_rejection_falls_back_to_stale_token() {
        let fx = fixture(RefreshBehavior::Reject).await;
        seed_connection(
            &fx,
            Some("stale-token"),
            Some("refresh"),
            Some(Utc::now() - Duration::minutes(5)),
        )
        .await;

        let token = fx.resolver.access_token("u1", ProviderKind::Gmail).await.unwrap();
        assert_eq!(token.as_deref(), Some("stale-token"));
        assert_eq!(fx.provider.refresh_calls.load(Ordering::SeqCst), 1);

        // Stored credentials are untouched
        let connection = fx
            .store
            .get_connection("u1", ProviderKind::Gmail)
            .await
            .unwrap()
            .unwrap();
        let persisted_access = fx
            .cipher
            .decrypt_string(connection.access_token_enc.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(persisted_access, "stale-token");
    }

    #[tokio::test]
    async fn refresh_transport_error_falls_back_to_stale_token() {
        let fx = fixture(RefreshBehavior::Fail).await;
        seed_connection(
            &fx,
            Some("stale-token"),
            Some("refresh"),
            Some(Utc::now() - Duration::minutes(5)),
        )
        .await;

        let token = fx.resolver.access_token("u1", ProviderKind::Gmail).await.unwrap();
        assert_eq!(token.as_deref(), Some("stale-token"));
    }

    #[tokio::test]
    async fn missing_refresh_token_returns_stale_access() {
        let fx = fixture(RefreshBehavior::Reject).await;
        seed_connection(
            &fx,
            Some("stale-token"),
            None,
            Some(Utc::now() - Duration::minutes(5)),
        )
        .await;

        let token = fx.resolver.access_token("u1", ProviderKind::Gmail).await.unwrap();
        assert_eq!(token.as_deref(), Some("stale-token"));
        assert_eq!(fx.provider.refresh_calls.load(Ordering::SeqCst), 0);
    }
}

//! Session gating.
//!
//! A bearer token is exchanged once for a per-device permission map and the
//! result cached; later requests with the same token skip the lookup while
//! the session stays active.

pub mod auth;
pub mod cache;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

pub use auth::{AuthError, AuthProvider, Capabilities, HttpAuthProvider, Permissions};
pub use cache::{RecencyList, Session, SessionCache};

/// Session cache fronting an [`AuthProvider`].
pub struct SessionGate {
    cache: SessionCache,
    provider: Arc<dyn AuthProvider>,
}

impl SessionGate {
    /// Create a gate whose sessions expire after `idle` without use.
    pub fn new(provider: Arc<dyn AuthProvider>, idle: Duration) -> Self {
        Self {
            cache: SessionCache::new(idle),
            provider,
        }
    }

    /// Session for `token`, asking the provider on a cache miss.
    pub async fn session(&self, token: &str) -> Result<Session, AuthError> {
        if let Some(session) = self.cache.get(token) {
            return Ok(session);
        }
        debug!("session cache miss, asking auth provider");
        let permissions = self.provider.authorize(token).await?;
        // A concurrent miss may have created it meanwhile; create() keeps
        // the first one.
        Ok(self.cache.create(token, move || permissions))
    }

    /// Number of cached sessions.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether no sessions are cached.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::*;

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AuthProvider for CountingProvider {
        async fn authorize(&self, token: &str) -> Result<Permissions, AuthError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            if token == "bad" {
                return Err(AuthError::Rejected(401));
            }
            Ok(Permissions::default().with("dev1", Capabilities::READ))
        }
    }

    #[tokio::test]
    async fn provider_is_asked_once_per_session() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let gate = SessionGate::new(provider.clone(), Duration::from_secs(60));

        let first = gate.session("tok").await.unwrap();
        let second = gate.session("tok").await.unwrap();
        assert!(first.permissions.allows("dev1", Capabilities::READ));
        assert!(Arc::ptr_eq(&first.permissions, &second.permissions));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.len(), 1);
    }

    #[tokio::test]
    async fn rejected_token_is_not_cached() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let gate = SessionGate::new(provider.clone(), Duration::from_secs(60));
        assert_matches!(gate.session("bad").await, Err(AuthError::Rejected(401)));
        assert!(gate.is_empty());
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ProviderError;
use crate::session::{Session, SessionProvider, with_timeout};
use crate::store::UserId;
use crate::utils::KeyedLocks;

/// Owns at most one live session per user id.
pub struct SessionPool {
    provider: Arc<dyn SessionProvider>,
    sessions: Mutex<HashMap<UserId, Arc<dyn Session>>>,
    locks: KeyedLocks<UserId>,
    call_timeout: Duration,
}

impl SessionPool {
    pub fn new(provider: Arc<dyn SessionProvider>, call_timeout: Duration) -> Self {
        Self {
            provider,
            sessions: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
            call_timeout,
        }
    }

    /// Upper bound applied to every provider round trip.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    fn cached(&self, uid: UserId) -> Option<Arc<dyn Session>> {
        let sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.get(&uid).cloned()
    }

    /// Returns the user's session, reconnecting or creating it as needed.
    pub async fn acquire(&self, uid: UserId) -> Result<Arc<dyn Session>, ProviderError> {
        let _guard = self.locks.lock(&uid).await;

        if let Some(session) = self.cached(uid) {
            let alive = tokio::time::timeout(self.call_timeout, session.is_connected())
                .await
                .unwrap_or(false);
            if !alive {
                log::warn!("Session for user {} lost its connection, reconnecting...", uid);
                with_timeout(self.call_timeout, session.reconnect())
                    .await
                    .map_err(|e| connect_error(uid, e))?;
                log::info!("Session for user {} reconnected", uid);
            }
            return Ok(session);
        }

        let session = with_timeout(self.call_timeout, self.provider.connect(uid))
            .await
            .map_err(|e| connect_error(uid, e))?;
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(uid, Arc::clone(&session));
        log::info!("Session for user {} connected", uid);
        Ok(session)
    }

    /// Logs the session out and forgets it. Returns `false` when the user had
    /// neither a live session nor stored credentials.
    pub async fn release(&self, uid: UserId) -> Result<bool, ProviderError> {
        let _guard = self.locks.lock(&uid).await;

        let live = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&uid);
        let session = match live {
            Some(session) => session,
            None if self.provider.has_credentials(uid) => {
                with_timeout(self.call_timeout, self.provider.connect(uid))
                    .await
                    .map_err(|e| connect_error(uid, e))?
            }
            None => return Ok(false),
        };

        with_timeout(self.call_timeout, session.log_out()).await?;
        log::info!("Session for user {} logged out", uid);
        Ok(true)
    }

    pub fn contains(&self, uid: UserId) -> bool {
        self.cached(uid).is_some()
    }
}

fn connect_error(uid: UserId, error: ProviderError) -> ProviderError {
    log::error!("Failed to connect session for user {}: {}", uid, error);
    match error {
        ProviderError::Timeout(_) | ProviderError::Connect(_) => error,
        other => ProviderError::Connect(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::FakeProvider;

    fn pool(provider: &FakeProvider) -> SessionPool {
        SessionPool::new(Arc::new(provider.clone()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_acquire_reuses_session() {
        let provider = FakeProvider::new();
        let pool = pool(&provider);

        let a = pool.acquire(1).await.unwrap();
        let b = pool.acquire(1).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.connects(), 1);

        pool.acquire(2).await.unwrap();
        assert_eq!(provider.connects(), 2);
    }

    #[tokio::test]
    async fn test_acquire_reconnects_dead_session() {
        let provider = FakeProvider::new();
        let pool = pool(&provider);

        pool.acquire(1).await.unwrap();
        provider.drop_connections();
        pool.acquire(1).await.unwrap();
        assert_eq!(provider.connects(), 1);
        assert_eq!(provider.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_surfaced() {
        let provider = FakeProvider::new();
        provider.script(|s| s.connect_error = Some(ProviderError::Rpc("network down".into())));
        let pool = pool(&provider);

        let err = pool.acquire(1).await.err().unwrap();
        assert!(matches!(err, ProviderError::Connect(_)));
        assert!(!pool.contains(1));
    }

    #[tokio::test]
    async fn test_release() {
        let provider = FakeProvider::new();
        let pool = pool(&provider);

        assert!(!pool.release(1).await.unwrap());

        pool.acquire(1).await.unwrap();
        assert!(pool.release(1).await.unwrap());
        assert!(!pool.contains(1));
        assert_eq!(provider.logouts(), 1);

        pool.acquire(1).await.unwrap();
        assert_eq!(provider.connects(), 2);
    }

    #[tokio::test]
    async fn test_release_from_stored_credentials() {
        let provider = FakeProvider::new();
        provider.authorize(1);
        let pool = pool(&provider);

        assert!(!pool.contains(1));
        assert!(pool.release(1).await.unwrap());
        assert_eq!(provider.connects(), 1);
        assert_eq!(provider.logouts(), 1);
        assert!(!provider.is_authorized(1));
        assert!(!pool.contains(1));

        assert!(!pool.release(1).await.unwrap());
        assert_eq!(provider.logouts(), 1);
    }
}

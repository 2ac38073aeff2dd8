//! Per-user MTProto account sessions.
//!
//! The rest of the bot only sees the [`Session`] and [`SessionProvider`]
//! traits; the grammers-backed implementation lives in [`mtproto`].

pub mod mtproto;
pub mod pool;

#[cfg(test)]
pub mod fake;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::peers::ChatRef;
use crate::store::UserId;

pub use mtproto::GrammersProvider;
pub use pool::SessionPool;

/// Opaque correlation value returned by a login code request and handed back
/// on sign-in. Only the session that produced it knows what is inside.
pub struct LoginToken(Box<dyn Any + Send + Sync>);

impl LoginToken {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        LoginToken(Box::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for LoginToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoginToken(..)")
    }
}

/// One end-user's connection to their own messaging account.
#[async_trait]
pub trait Session: Send + Sync {
    async fn is_connected(&self) -> bool;

    /// Idempotent; safe to call on a live connection.
    async fn reconnect(&self) -> Result<(), ProviderError>;

    async fn is_authorized(&self) -> Result<bool, ProviderError>;

    async fn request_login_code(&self, phone: &str) -> Result<LoginToken, ProviderError>;

    /// Fails with [`ProviderError::SecondFactorRequired`] when the account has a
    /// cloud password.
    async fn sign_in(&self, token: &LoginToken, code: &str) -> Result<(), ProviderError>;

    async fn check_password(&self, password: &str) -> Result<(), ProviderError>;

    async fn send_message(&self, chat: &ChatRef, text: &str) -> Result<(), ProviderError>;

    /// Logs the account out and invalidates its stored credentials.
    async fn log_out(&self) -> Result<(), ProviderError>;
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Creates and connects a session backed by the user's stored credentials
    /// (or a fresh, unauthorized one).
    async fn connect(&self, uid: UserId) -> Result<Arc<dyn Session>, ProviderError>;

    fn has_credentials(&self, uid: UserId) -> bool;
}

pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_token_is_opaque() {
        let token = LoginToken::new(String::from("hash"));
        assert_eq!(token.downcast_ref::<String>().map(String::as_str), Some("hash"));
        assert!(token.downcast_ref::<u32>().is_none());
        assert_eq!(format!("{:?}", token), "LoginToken(..)");
    }

    #[tokio::test]
    async fn test_with_timeout_elapses() {
        let limit = Duration::from_millis(20);
        let result: Result<(), _> = with_timeout(limit, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(ProviderError::Timeout(limit)));
    }
}

//! Bearer token supply for subscription connections
//!
//! The subscription engine does not log in or refresh credentials itself. It
//! asks an [`Authenticator`] for a token right before every connection attempt;
//! the accessor behind it may be a plain function or an async one, so callers
//! can plug in anything from a fixed API key to a refreshing session.

use crate::invoke::Invocable;
use crate::{Error, Result};

/// Token accessor: a sync or async function yielding a bearer token, failing
/// with [`Error::Authentication`] when no valid credential exists.
pub type TokenAccessor = Invocable<(), Result<String>>;

/// Read-only, shareable credential source used by every channel of a client.
#[derive(Debug, Clone)]
pub struct Authenticator {
    accessor: TokenAccessor,
}

impl Authenticator {
    pub fn new(accessor: TokenAccessor) -> Self {
        Self { accessor }
    }

    /// Always hands out the same key
    pub fn api_key(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(Invocable::from_fn(move |()| {
            if key.is_empty() {
                Err(Error::authentication("API key is empty"))
            } else {
                Ok(key.clone())
            }
        }))
    }

    /// Build from a synchronous accessor
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> Result<String> + Send + Sync + 'static,
    {
        Self::new(Invocable::from_fn(move |()| f()))
    }

    /// Build from an asynchronous accessor
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String>> + Send + 'static,
    {
        Self::new(Invocable::from_async(move |()| f()))
    }

    /// No credential configured; every lookup fails.
    pub fn unauthenticated() -> Self {
        Self::from_fn(|| Err(Error::authentication("Not authenticated")))
    }

    /// Resolve the current bearer token.
    pub async fn access_token(&self) -> Result<String> {
        self.accessor.invoke(()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_api_key_token() {
        let auth = Authenticator::api_key("test-token");
        assert_eq!(auth.access_token().await.unwrap(), "test-token");
    }

    #[tokio::test]
    async fn test_empty_api_key_is_rejected() {
        let auth = Authenticator::api_key("");
        let err = auth.access_token().await.unwrap_err();
        assert!(matches!(err, Error::Authentication { .. }));
    }

    #[tokio::test]
    async fn test_async_accessor() {
        let auth = Authenticator::from_async(|| async { Ok("async-token".to_string()) });
        assert_eq!(auth.access_token().await.unwrap(), "async-token");
    }

    #[tokio::test]
    async fn test_unauthenticated_fails() {
        let err = Authenticator::unauthenticated()
            .access_token()
            .await
            .unwrap_err();
        assert_eq!(err, Error::authentication("Not authenticated"));
    }
}

//! Sync-or-async function values
//!
//! Both user callbacks and token accessors may be plain closures or closures
//! returning a future. [`Invocable`] stores either shape behind one type and
//! [`Invocable::invoke`] awaits only when there is something to await, so call
//! sites never branch on the calling convention themselves.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A shareable function from `A` to `R` that is either synchronous or
/// asynchronous.
pub enum Invocable<A, R> {
    Sync(Arc<dyn Fn(A) -> R + Send + Sync>),
    Async(Arc<dyn Fn(A) -> BoxFuture<'static, R> + Send + Sync>),
}

impl<A, R> Invocable<A, R> {
    /// Wrap a synchronous function
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        Invocable::Sync(Arc::new(f))
    }

    /// Wrap a function returning a future
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        Invocable::Async(Arc::new(move |arg| -> BoxFuture<'static, R> { Box::pin(f(arg)) }))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Invocable::Async(_))
    }

    /// Call the function, awaiting its future when it is asynchronous.
    ///
    /// A synchronous function runs inline during the first poll, on whatever
    /// task polls the returned future.
    pub async fn invoke(&self, arg: A) -> R {
        match self {
            Invocable::Sync(f) => f(arg),
            Invocable::Async(f) => f(arg).await,
        }
    }
}

impl<A, R> Clone for Invocable<A, R> {
    fn clone(&self) -> Self {
        match self {
            Invocable::Sync(f) => Invocable::Sync(Arc::clone(f)),
            Invocable::Async(f) => Invocable::Async(Arc::clone(f)),
        }
    }
}

impl<A, R> fmt::Debug for Invocable<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocable::Sync(_) => f.write_str("Invocable::Sync(..)"),
            Invocable::Async(_) => f.write_str("Invocable::Async(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_sync_invocation() {
        let double = Invocable::from_fn(|x: u32| x * 2);
        assert!(!double.is_async());
        assert_eq!(double.invoke(21).await, 42);
    }

    #[tokio::test]
    async fn test_async_invocation() {
        let double = Invocable::from_async(|x: u32| async move {
            tokio::task::yield_now().await;
            x * 2
        });
        assert!(double.is_async());
        assert_eq!(double.invoke(21).await, 42);
    }

    #[tokio::test]
    async fn test_clones_share_the_function() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let f = Invocable::from_fn(move |_: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let g = f.clone();

        f.invoke(()).await;
        g.invoke(()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

//! Single-resolution results handed back to callers of session operations.
//!
//! The dispatch task keeps the [`Resolver`], the caller awaits the
//! [`Deferred`]. Each resolver settles exactly once because every method
//! consumes it; dropping it unsettled resolves the caller with
//! [`SessionError::Cancelled`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Result, SessionError};

pub fn deferred<T>() -> (Resolver<T>, Deferred<T>) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx }, Deferred { rx })
}

#[derive(Debug)]
pub struct Resolver<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Resolver<T> {
    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(self, error: SessionError) {
        self.settle(Err(error));
    }

    pub fn settle(self, result: Result<T>) {
        // The caller may have stopped waiting.
        let _ = self.tx.send(result);
    }
}

#[derive(Debug)]
pub struct Deferred<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Deferred<T> {
    /// A result that is already rejected.
    pub fn rejected(error: SessionError) -> Self {
        let (resolver, deferred) = deferred();
        resolver.reject(error);
        deferred
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SessionError::Cancelled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve() {
        let (resolver, deferred) = deferred();
        resolver.resolve(7);
        assert_eq!(deferred.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_reject() {
        let (resolver, deferred) = deferred::<()>();
        resolver.reject(SessionError::Rejected("no such room".into()));
        assert!(matches!(deferred.await, Err(SessionError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_dropped_resolver_cancels() {
        let (resolver, deferred) = deferred::<u32>();
        drop(resolver);
        assert!(matches!(deferred.await, Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_resolved_from_another_task() {
        let (resolver, deferred) = deferred();
        tokio::spawn(async move { resolver.resolve("done") });
        assert_eq!(deferred.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_already_rejected() {
        let deferred = Deferred::<()>::rejected(SessionError::NotConnected);
        assert!(matches!(deferred.await, Err(SessionError::NotConnected)));
    }
}

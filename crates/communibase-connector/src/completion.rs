//! Single-assignment result handles shared between one producer and many consumers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, Shared};
use futures::FutureExt;

use crate::error::ConnectorError;

type CompletionResult<T> = Result<T, ConnectorError>;

/// A result that exactly one [`Completer`] settles and any number of clones await.
///
/// Every clone of a completion observes the very same outcome. Dropping a completion does not
/// cancel the work that will eventually settle it.
pub struct Completion<T: Clone> {
    inner: Shared<BoxFuture<'static, CompletionResult<T>>>,
}

/// The producing half of a [`Completion`].
///
/// Settling consumes the completer, so a completion can only ever be settled once.
#[must_use = "dropping a completer rejects its completion"]
pub struct Completer<T> {
    sender: oneshot::Sender<CompletionResult<T>>,
}

impl<T> Completion<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a new unsettled completion together with the completer that settles it.
    pub fn pending() -> (Completer<T>, Self) {
        let (sender, receiver) = oneshot::channel();
        let inner = receiver
            .map(|result| {
                result.unwrap_or_else(|_| {
                    Err(ConnectorError::Transport(
                        "request was dropped before it completed".into(),
                    ))
                })
            })
            .boxed()
            .shared();
        (Completer { sender }, Self { inner })
    }

    /// Creates a completion that is already settled with `result`.
    pub fn ready(result: CompletionResult<T>) -> Self {
        Self {
            inner: future::ready(result).boxed().shared(),
        }
    }

    /// Returns the outcome if the completion has already been settled and polled.
    ///
    /// This never blocks and never drives the completion.
    pub fn peek(&self) -> Option<&CompletionResult<T>> {
        self.inner.peek()
    }

    /// Returns `true` if the completion has been rejected.
    ///
    /// Unlike [`peek`](Self::peek), this also sees outcomes nobody has awaited yet.
    pub fn is_rejected(&self) -> bool {
        matches!(self.clone().now_or_never(), Some(Err(_)))
    }

    /// Returns `true` if both handles refer to the same underlying completion.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.inner.ptr_eq(&other.inner)
    }
}

impl<T: Clone> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Future for Completion<T> {
    type Output = CompletionResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl<T: Clone> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.peek() {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "rejected",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}

impl<T> Completer<T> {
    pub fn resolve(self, value: T) {
        self.settle(Ok(value))
    }

    pub fn reject(self, error: ConnectorError) {
        self.settle(Err(error))
    }

    /// Settles the completion. Nobody listening anymore is not an error.
    pub fn settle(self, result: CompletionResult<T>) {
        self.sender.send(result).ok();
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("canceled", &self.sender.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_clones_observe_one_outcome() {
        let (completer, completion) = Completion::<u32>::pending();
        let other = completion.clone();
        assert!(completion.ptr_eq(&other));
        assert!(completion.peek().is_none());

        completer.resolve(42);

        assert_eq!(completion.clone().await, Ok(42));
        assert_eq!(other.await, Ok(42));
        assert_eq!(completion.peek(), Some(&Ok(42)));
    }

    #[tokio::test]
    async fn test_rejection() {
        let (completer, completion) = Completion::<u32>::pending();
        completer.reject(ConnectorError::ReferenceResolution);

        assert_eq!(
            completion.clone().await,
            Err(ConnectorError::ReferenceResolution)
        );
        assert!(completion.is_rejected());
    }

    #[tokio::test]
    async fn test_dropped_completer() {
        let (completer, completion) = Completion::<u32>::pending();
        drop(completer);

        assert!(matches!(
            completion.await,
            Err(ConnectorError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_ready() {
        let completion = Completion::ready(Ok("done"));
        assert_eq!(completion.await, Ok("done"));
    }
}

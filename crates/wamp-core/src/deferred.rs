//! Deferred results for asynchronous transport operations.
//!
//! A [`Deferred`] is the caller's half: a future that resolves exactly once.
//! The [`Resolver`] is kept by whoever completes the operation. Dropping a
//! resolver without resolving it resolves the deferred with
//! [`WampError::Cancelled`], so no waiter can hang on an abandoned operation.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::{WampError, WampResult};

/// Create a connected resolver/deferred pair.
pub fn deferred<T>() -> (Resolver<T>, Deferred<T>) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx }, Deferred { rx })
}

/// Completes a [`Deferred`].
#[derive(Debug)]
pub struct Resolver<T = ()> {
    tx: oneshot::Sender<WampResult<T>>,
}

impl<T> Resolver<T> {
    /// Resolve the paired deferred. A caller that stopped waiting is ignored.
    pub fn resolve(self, result: WampResult<T>) {
        let _ = self.tx.send(result);
    }
}

/// The eventual outcome of an asynchronous operation.
///
/// Await it, or poll it without blocking through [`Deferred::try_result`].
#[derive(Debug)]
#[must_use = "a deferred result does nothing unless awaited or polled"]
pub struct Deferred<T = ()> {
    rx: oneshot::Receiver<WampResult<T>>,
}

impl<T> Deferred<T> {
    /// A deferred that is already resolved.
    pub fn ready(result: WampResult<T>) -> Self {
        let (resolver, deferred) = deferred();
        resolver.resolve(result);
        deferred
    }

    /// Take the outcome if it is available. Returns `None` while pending.
    ///
    /// The outcome can be taken only once; later calls report `Cancelled`.
    pub fn try_result(&mut self) -> Option<WampResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(WampError::Cancelled)),
        }
    }
}

impl<T> Future for Deferred<T> {
    type Output = WampResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(WampError::Cancelled)))
    }
}

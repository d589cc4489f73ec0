//! Bound a future with a timeout, panicking on expiry.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use pin_project::pin_project;
use tokio::time::Timeout;

/// Extension trait attaching timeouts to any [`Future`].
pub trait FutureTimeout: Future + Sized {
    /// Bound the execution of this future with `duration`, returning the
    /// usual [`tokio::time::Timeout`] result.
    fn with_timeout(self, duration: Duration) -> Timeout<Self> {
        tokio::time::timeout(duration, self)
    }

    /// Bound the execution of this future with `duration`, panicking if the
    /// timeout expires before the future resolves.
    ///
    /// Intended for tests: turns a hang into a loud failure with a backtrace
    /// instead of a CI timeout.
    fn with_timeout_panic(self, duration: Duration) -> TimeoutPanic<Self> {
        TimeoutPanic {
            inner: tokio::time::timeout(duration, self),
        }
    }
}

impl<F> FutureTimeout for F where F: Future + Sized {}

/// Future returned by [`FutureTimeout::with_timeout_panic`].
#[pin_project]
#[derive(Debug)]
pub struct TimeoutPanic<F> {
    #[pin]
    inner: Timeout<F>,
}

impl<F> Future for TimeoutPanic<F>
where
    F: Future,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.inner.poll(cx) {
            Poll::Ready(Ok(v)) => Poll::Ready(v),
            Poll::Ready(Err(_)) => panic!("timeout waiting for future to resolve"),
            Poll::Pending => Poll::Pending,
        }
    }
}

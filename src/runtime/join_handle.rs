use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A handle to an asynchronous task spawned via `runtime::spawn`.
///
/// Awaiting the handle waits for the task to complete. Unlike `tokio::task::JoinHandle`,
/// panics in the task are propagated rather than surfaced as errors.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> AsyncJoinHandle<T> {
    pub(crate) fn new(handle: tokio::task::JoinHandle<T>) -> Self {
        Self(handle)
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| match result {
            Ok(x) => x,
            // The task can only be aborted via its JoinHandle, which we own, so a join
            // failure here can only mean the task panicked.
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        })
    }
}

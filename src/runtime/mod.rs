mod join_handle;
pub(crate) mod stream;

use std::{future::Future, time::Duration};

pub(crate) use self::{join_handle::AsyncJoinHandle, stream::AsyncStream};
use crate::error::{Error, ErrorKind, Result};

/// Spawn a task in the background to run a future.
///
/// If the runtime is still running, this will return a handle to the background task.
/// Otherwise, it will return `None`. As a result, this must be called from an async block
/// or function running on a runtime.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::new(tokio::task::spawn(fut))
}

/// Await on a future for a maximum amount of time before returning an error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| io_timeout_error())
}

/// Await on a future, bounded by `deadline` when one is given.
pub(crate) async fn timeout_opt<F: Future>(
    deadline: Option<std::time::Instant>,
    future: F,
) -> Result<F::Output> {
    match deadline {
        Some(deadline) => {
            let now = std::time::Instant::now();
            if deadline <= now {
                return Err(io_timeout_error());
            }
            timeout(deadline - now, future).await
        }
        None => Ok(future.await),
    }
}

fn io_timeout_error() -> Error {
    ErrorKind::Io(std::sync::Arc::new(std::io::ErrorKind::TimedOut.into())).into()
}

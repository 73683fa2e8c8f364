//! Units of work and compensating actions

use futures::future::{BoxFuture, FutureExt};
use keystone_core::Failure;
use std::future::Future;
use tokio_util::sync::CancellationToken;

type SyncCall<T> = Box<dyn FnMut() -> Result<T, Failure> + Send>;
type AsyncCall<T> = Box<dyn FnMut(CancellationToken) -> BoxFuture<'static, Result<T, Failure>> + Send>;

/// A re-invocable unit of work
///
/// `T = ()` covers plain actions. Both variants may be invoked more than once
/// by retry policies.
pub enum Work<T> {
    Sync(SyncCall<T>),
    Async(AsyncCall<T>),
}

impl<T: Send + 'static> Work<T> {
    /// Wrap a blocking closure
    pub fn sync<F>(f: F) -> Self
    where
        F: FnMut() -> Result<T, Failure> + Send + 'static,
    {
        Work::Sync(Box::new(f))
    }

    /// Wrap a closure producing a future; it receives the cancellation token
    pub fn from_async<F, Fut>(mut f: F) -> Self
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        Work::Async(Box::new(move |token| f(token).boxed()))
    }

    /// Invoke once. Sync work runs inline.
    pub fn invoke(&mut self, token: CancellationToken) -> BoxFuture<'static, Result<T, Failure>> {
        match self {
            Work::Sync(call) => futures::future::ready(call()).boxed(),
            Work::Async(call) => call(token),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Work::Async(_))
    }
}

/// Result of a unit of work that may hand back a second future
pub enum Deferred<T> {
    Ready(T),
    Pending(BoxFuture<'static, Result<T, Failure>>),
}

impl<T: Send + 'static> Deferred<T> {
    pub fn pending<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        Deferred::Pending(future.boxed())
    }

    /// Await the inner layer if there is one
    pub async fn resolve(self) -> Result<T, Failure> {
        match self {
            Deferred::Ready(value) => Ok(value),
            Deferred::Pending(future) => future.await,
        }
    }
}

impl<T: Send + 'static> Work<Deferred<T>> {
    /// Fold the inner layer into the unit of work so that failures raised
    /// while awaiting it are handled like any other
    pub fn flatten(mut self) -> Work<T> {
        Work::Async(Box::new(move |token| {
            let outer = self.invoke(token);
            async move { outer.await?.resolve().await }.boxed()
        }))
    }
}

/// Caller-supplied action run at most once when a unit of work fails
pub enum Compensation {
    Sync(Box<dyn FnOnce() -> Result<(), Failure> + Send>),
    Async(Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), Failure>> + Send>),
}

impl Compensation {
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<(), Failure> + Send + 'static,
    {
        Compensation::Sync(Box::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        Compensation::Async(Box::new(move |token| f(token).boxed()))
    }

    /// Run, consuming the action
    pub async fn run(self, token: CancellationToken) -> Result<(), Failure> {
        match self {
            Compensation::Sync(f) => f(),
            Compensation::Async(f) => f(token).await,
        }
    }

    /// Run on the blocking path; asynchronous actions are refused
    pub fn run_blocking(self) -> Result<(), Failure> {
        match self {
            Compensation::Sync(f) => f(),
            Compensation::Async(_) => Err(Failure::internal(
                "asynchronous compensating action cannot run on the blocking path",
            )),
        }
    }
}

impl std::fmt::Debug for Compensation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compensation::Sync(_) => f.write_str("Compensation::Sync"),
            Compensation::Async(_) => f.write_str("Compensation::Async"),
        }
    }
}

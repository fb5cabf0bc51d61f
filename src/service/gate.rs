//! Gates: shareable awaitables that must settle before dependent work starts.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;

/// A cloneable awaitable with no result. Every clone settles together.
pub type Gate = Shared<BoxFuture<'static, ()>>;

/// A gate that is already open.
pub fn open() -> Gate {
    futures::future::ready(()).boxed().shared()
}

/// Wrap a future into a gate.
pub fn from_future<F>(fut: F) -> Gate
where
    F: Future<Output = ()> + Send + 'static,
{
    fut.boxed().shared()
}

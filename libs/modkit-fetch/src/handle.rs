//! The value returned by [`crate::Endpoint::call`].

use crate::error::FetchError;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Marker shared by every call ignored while the same in-flight slot was busy.
///
/// Compare with [`Arc::ptr_eq`] to check that two ignored handles are the same stub.
#[derive(Debug, Default)]
pub struct IgnoredCall {
    _private: (),
}

enum Inner {
    /// Yields `None` when the call was superseded and will never settle
    Active(BoxFuture<'static, Option<Result<Value, FetchError>>>),
    Ignored(Arc<IgnoredCall>),
    /// Superseded; stays pending forever
    Parked,
}

/// Result handle of one endpoint call.
///
/// Awaiting it yields the call's settlement. Ignored calls (the endpoint's
/// `ignoreSelfConcurrent` policy found a busy slot) and superseded calls (a newer
/// call replaced them under `overrideSelfConcurrent`) never settle; use
/// [`CallHandle::outcome`] when that must not block forever.
///
/// Continuations registered with [`CallHandle::then`] and [`CallHandle::catch`]
/// run when the handle is awaited. On an ignored handle both return the very same
/// stub, so chains never fail and never produce distinct handles.
#[must_use = "a call handle does nothing observable unless awaited"]
pub struct CallHandle {
    inner: Inner,
}

impl CallHandle {
    pub(crate) fn active(rx: oneshot::Receiver<Result<Value, FetchError>>) -> Self {
        Self {
            inner: Inner::Active(rx.map(Result::ok).boxed()),
        }
    }

    pub(crate) fn ignored(stub: Arc<IgnoredCall>) -> Self {
        Self {
            inner: Inner::Ignored(stub),
        }
    }

    /// A handle that settles immediately with `result`.
    pub(crate) fn settled(result: Result<Value, FetchError>) -> Self {
        Self {
            inner: Inner::Active(futures::future::ready(Some(result)).boxed()),
        }
    }

    #[must_use]
    pub fn is_ignored(&self) -> bool {
        matches!(self.inner, Inner::Ignored(_))
    }

    /// The shared stub, if this call was ignored.
    #[must_use]
    pub fn ignored_stub(&self) -> Option<&Arc<IgnoredCall>> {
        match &self.inner {
            Inner::Ignored(stub) => Some(stub),
            Inner::Active(_) | Inner::Parked => None,
        }
    }

    /// Chain a transformation of the resolved value; rejections pass through.
    pub fn then<F>(self, on_resolve: F) -> Self
    where
        F: FnOnce(Value) -> Result<Value, FetchError> + Send + 'static,
    {
        self.chain(move |settled| settled.map(|result| result.and_then(on_resolve)))
    }

    /// Chain a recovery from rejection; resolved values pass through.
    pub fn catch<F>(self, on_reject: F) -> Self
    where
        F: FnOnce(FetchError) -> Result<Value, FetchError> + Send + 'static,
    {
        self.chain(move |settled| settled.map(|result| result.or_else(on_reject)))
    }

    fn chain<F>(self, step: F) -> Self
    where
        F: FnOnce(Option<Result<Value, FetchError>>) -> Option<Result<Value, FetchError>>
            + Send
            + 'static,
    {
        let inner = match self.inner {
            Inner::Active(fut) => Inner::Active(fut.map(step).boxed()),
            other => other,
        };
        Self { inner }
    }

    /// Await the settlement, or get `None` at once for a call that will never settle.
    pub async fn outcome(self) -> Option<Result<Value, FetchError>> {
        match self.inner {
            Inner::Active(fut) => fut.await,
            Inner::Ignored(_) | Inner::Parked => None,
        }
    }
}

impl Future for CallHandle {
    type Output = Result<Value, FetchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Inner::Active(fut) = &mut self.inner else {
            return Poll::Pending;
        };
        match fut.poll_unpin(cx) {
            Poll::Ready(Some(result)) => Poll::Ready(result),
            Poll::Ready(None) => {
                self.inner = Inner::Parked;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner {
            Inner::Active(_) => "active",
            Inner::Ignored(_) => "ignored",
            Inner::Parked => "superseded",
        };
        f.debug_struct("CallHandle").field("state", &state).finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_then_and_catch_chain() {
        let handle = CallHandle::settled(Ok(json!(1)))
            .then(|v| Ok(json!(v.as_i64().unwrap_or_default() + 1)))
            .catch(|_| Ok(json!("unreachable")));
        assert_eq!(handle.await.unwrap(), json!(2));

        let handle = CallHandle::settled(Err(FetchError::transport_msg("down")))
            .then(|_| Ok(json!("unreachable")))
            .catch(|e| Ok(json!(e.message())));
        assert_eq!(handle.await.unwrap(), json!("Transport error: down"));
    }

    #[tokio::test]
    async fn test_ignored_stub_is_chain_safe() {
        let stub = Arc::new(IgnoredCall::default());
        let handle = CallHandle::ignored(stub.clone())
            .then(|_| panic!("never invoked"))
            .catch(|_| panic!("never invoked"));
        assert!(handle.is_ignored());
        assert!(Arc::ptr_eq(handle.ignored_stub().unwrap(), &stub));
        assert!(handle.outcome().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_sender_never_settles() {
        let (tx, rx) = oneshot::channel();
        drop(tx);
        let handle = CallHandle::active(rx).then(|_| panic!("superseded continuation ran"));
        let waited = tokio::time::timeout(Duration::from_millis(20), handle).await;
        assert!(waited.is_err(), "superseded handle must stay pending");
    }

    #[tokio::test]
    async fn test_outcome_of_dropped_sender_is_none() {
        let (tx, rx) = oneshot::channel::<Result<Value, FetchError>>();
        drop(tx);
        assert!(CallHandle::active(rx).outcome().await.is_none());
    }
}

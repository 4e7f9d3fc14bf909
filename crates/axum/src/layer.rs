//! Tower layer delivering outbound lifecycle signals.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::Request;
use axum::response::Response;
use http_body::Frame;
use tower::{Layer, Service};

use tidepool_common::config::DEFAULT_POOL_KEY;
use tidepool_lifecycle::policy::LifecyclePolicy;
use tidepool_lifecycle::scope::RequestScope;
use tidepool_lifecycle::signal::OutboundSignal;

use crate::extract::ScopedPoolKey;

/// Layer installing the connection lifecycle around every request.
///
/// Each request gets a fresh [`RequestScope`] in its extensions. The
/// configured policy hears `ResponseStarted` before the response is
/// forwarded, `StreamClosed` when the body finishes, and
/// `ClientDisconnected` when either the handler or the body is dropped
/// mid-exchange.
#[derive(Clone)]
pub struct LifecycleLayer {
    policy: Arc<dyn LifecyclePolicy>,
    pool_key: Arc<str>,
}

impl LifecycleLayer {
    pub fn new(policy: Arc<dyn LifecyclePolicy>) -> Self {
        Self {
            policy,
            pool_key: Arc::from(DEFAULT_POOL_KEY),
        }
    }

    /// Resolve extractors against the pool registered under `key` instead
    /// of the default.
    pub fn with_pool_key(mut self, key: &str) -> Self {
        self.pool_key = Arc::from(key);
        self
    }
}

impl<S> Layer<S> for LifecycleLayer {
    type Service = LifecycleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LifecycleService {
            inner,
            policy: self.policy.clone(),
            pool_key: self.pool_key.clone(),
        }
    }
}

/// Service produced by [`LifecycleLayer`].
#[derive(Clone)]
pub struct LifecycleService<S> {
    inner: S,
    policy: Arc<dyn LifecyclePolicy>,
    pool_key: Arc<str>,
}

impl<S> Service<Request<Body>> for LifecycleService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        // Swap in a clone so the service we drive is the one poll_ready
        // reported ready on.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy.clone();

        let scope = Arc::new(RequestScope::new());
        req.extensions_mut().insert(scope.clone());
        req.extensions_mut()
            .insert(ScopedPoolKey(self.pool_key.clone()));

        Box::pin(async move {
            // Covers the handler future being dropped before a response
            // exists (client went away mid-request).
            let mut guard = DisconnectGuard {
                armed: true,
                policy: policy.clone(),
                scope: scope.clone(),
            };

            let response = inner.call(req).await?;

            let status = response.status().as_u16();
            deliver(&policy, &scope, OutboundSignal::ResponseStarted { status }).await;
            // Only disarm once the response-started signal went through;
            // a cancellation before this point still ends the scope.
            guard.armed = false;

            Ok(response.map(|body| Body::new(SignalBody::new(body, policy, scope))))
        })
    }
}

/// Deliver one signal, logging (never propagating) policy errors.
async fn deliver(
    policy: &Arc<dyn LifecyclePolicy>,
    scope: &Arc<RequestScope>,
    signal: OutboundSignal,
) {
    if let Err(e) = policy.on_outbound_signal(signal, scope).await {
        tracing::error!(
            scope_id = %scope.id(),
            signal = ?signal,
            error = %e,
            "Lifecycle signal handling failed"
        );
    }
}

/// Spawned variant of [`deliver`] for synchronous contexts (body polling
/// and drops).
fn deliver_spawned(
    policy: Arc<dyn LifecyclePolicy>,
    scope: Arc<RequestScope>,
    signal: OutboundSignal,
) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { deliver(&policy, &scope, signal).await });
        }
        Err(_) => {
            tracing::warn!(
                scope_id = %scope.id(),
                signal = ?signal,
                "No runtime available to deliver lifecycle signal"
            );
        }
    }
}

struct DisconnectGuard {
    armed: bool,
    policy: Arc<dyn LifecyclePolicy>,
    scope: Arc<RequestScope>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            deliver_spawned(
                self.policy.clone(),
                self.scope.clone(),
                OutboundSignal::ClientDisconnected,
            );
        }
    }
}

/// Response body reporting end-of-stream and mid-stream disconnects.
struct SignalBody {
    inner: Body,
    finished: bool,
    policy: Arc<dyn LifecyclePolicy>,
    scope: Arc<RequestScope>,
}

impl SignalBody {
    fn new(inner: Body, policy: Arc<dyn LifecyclePolicy>, scope: Arc<RequestScope>) -> Self {
        Self {
            inner,
            finished: false,
            policy,
            scope,
        }
    }
}

impl http_body::Body for SignalBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    deliver_spawned(
                        this.policy.clone(),
                        this.scope.clone(),
                        OutboundSignal::StreamClosed,
                    );
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for SignalBody {
    fn drop(&mut self) {
        // Body dropped before its end: the peer went away mid-response.
        if !self.finished {
            deliver_spawned(
                self.policy.clone(),
                self.scope.clone(),
                OutboundSignal::ClientDisconnected,
            );
        }
    }
}

//! Admission middleware.
//!
//! Wraps a downstream service and runs every request through the
//! ratelimiter of its traffic class before the handler sees it.

use axum::body::Body;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, info_span, warn, Instrument};

use super::caller::{client_ip, CallerResolver};
use super::response::{apply_quota_headers, banned, over_limit};
use crate::error::GatekeeperError;
use crate::ratelimit::{Decision, RatelimiterRegistry, TrafficClass};

/// How the layer behaves outside the happy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Forward requests when the counter store is unavailable
    pub fail_open: bool,
    /// Use `X-Forwarded-For` for fallback identities
    pub trust_forwarded_for: bool,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            fail_open: false,
            trust_forwarded_for: false,
        }
    }
}

struct Shared {
    registry: Arc<RatelimiterRegistry>,
    resolver: Arc<dyn CallerResolver>,
    policy: AdmissionPolicy,
}

/// Layer applying admission control to the wrapped service.
#[derive(Clone)]
pub struct AdmissionLayer {
    shared: Arc<Shared>,
}

impl AdmissionLayer {
    /// Create a layer over `registry`, classifying callers with `resolver`.
    pub fn new(
        registry: Arc<RatelimiterRegistry>,
        resolver: Arc<dyn CallerResolver>,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                resolver,
                policy,
            }),
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            shared: self.shared.clone(),
        }
    }
}

/// Admission control service.
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> Service<Request<Body>> for AdmissionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // The clone may not be ready; keep the service that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let shared = self.shared.clone();

        let span = info_span!(
            "admission",
            request_id = %uuid::Uuid::new_v4(),
            method = %request.method(),
            path = %request.uri().path(),
        );

        Box::pin(
            async move {
                let (parts, body) = request.into_parts();

                let caller = shared.resolver.resolve(&parts).await;
                let (class, limiter) = shared.registry.for_caller(caller.as_ref());
                let identity = match caller {
                    Some(caller) => Ok(caller.id),
                    // An empty identity is rejected by the engine, never
                    // pooled into a shared bucket.
                    None => client_ip(&parts, shared.policy.trust_forwarded_for)
                        .map(|ip| ip.map(|ip| ip.to_string()).unwrap_or_default()),
                };
                let request = Request::from_parts(parts, body);

                let decision = match identity {
                    Ok(identity) => {
                        debug!(class = %class, identity = %identity, "Admission check");
                        limiter.admit(&identity).await
                    }
                    Err(e) => Err(e),
                };
                let now = Utc::now();

                match decision {
                    Ok(Decision::Allow(quota)) => {
                        let mut response = inner.call(request).await?;
                        apply_quota_headers(response.headers_mut(), &quota, now);
                        Ok(response)
                    }
                    Ok(Decision::RejectOverLimit(quota)) => Ok(over_limit(&quota, now)),
                    Ok(Decision::RejectBanned(ban)) => Ok(banned(ban, now)),
                    Err(GatekeeperError::StoreUnavailable(reason)) if shared.policy.fail_open => {
                        warn!(
                            class = %class,
                            reason = %reason,
                            "Counter store unavailable, admitting request"
                        );
                        inner.call(request).await
                    }
                    Err(e) => {
                        log_failure(class, &e);
                        Ok(e.into_response())
                    }
                }
            }
            .instrument(span),
        )
    }
}

fn log_failure(class: TrafficClass, error: &GatekeeperError) {
    match error {
        GatekeeperError::InvalidIdentity(_) => {
            debug!(class = %class, error = %error, "Rejecting unidentifiable caller")
        }
        _ => warn!(class = %class, error = %error, "Failing closed"),
    }
}

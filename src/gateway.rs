use std::{
    net::IpAddr,
    sync::Arc,
    time::Instant,
};

use axum::{
    body::Body,
    http::{
        HeaderMap,
        HeaderName,
        HeaderValue,
        Method,
        Request,
        StatusCode,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use uuid::Uuid;

use crate::{
    config::GatewayConfig,
    error::{GatewayError, GatewayResult},
    identity::{IdentityVerifier, Subject},
    ratelimit::{Admission, CounterStore, FixedWindowLimiter, PlanLimits},
    router::RouteTable,
    upstream::{ProxyExchange, ProxyForwarder},
    usage::{UsageEvent, UsageRecorder},
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Where a request was when it left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStage {
    Authenticate,
    Admit,
    Route,
    Authorize,
    Proxy,
    Completed,
}

impl DispatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::Admit => "admit",
            Self::Route => "route",
            Self::Authorize => "authorize",
            Self::Proxy => "proxy",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Quota {
    limit: u64,
    remaining: u64,
    reset_after_secs: u64,
}

#[derive(Default)]
struct DispatchTrace {
    subject: Option<String>,
    product: Option<String>,
}

struct PendingUsage {
    subject_id: String,
    product: String,
    endpoint: String,
    method: Method,
}

impl PendingUsage {
    fn into_event(self, status: Option<StatusCode>) -> UsageEvent {
        UsageEvent::new(
            &self.subject_id,
            &self.product,
            &self.endpoint,
            &self.method,
            status,
        )
    }
}

/// Owns the usage event of a routed request from the moment it is handed
/// to the backend. If the handler future is dropped before [`complete`]
/// runs, the event is still recorded, as cancelled.
///
/// [`complete`]: UsageGuard::complete
struct UsageGuard<'a> {
    recorder: &'a UsageRecorder,
    pending: Option<PendingUsage>,
}

impl<'a> UsageGuard<'a> {
    fn new(recorder: &'a UsageRecorder, pending: PendingUsage) -> Self {
        Self {
            recorder,
            pending: Some(pending),
        }
    }

    fn complete(mut self, status: Option<StatusCode>) {
        if let Some(pending) = self.pending.take() {
            self.recorder.record(pending.into_event(status));
        }
    }
}

impl Drop for UsageGuard<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            tracing::debug!(
                subject = %pending.subject_id,
                product = %pending.product,
                "caller went away before the backend answered"
            );
            self.recorder.record(pending.into_event(None).cancelled());
        }
    }
}

/// Authenticate, admit, route, proxy. Each stage either hands the request to
/// the next one or ends it with a rejection.
pub struct Gateway {
    verifier: Arc<IdentityVerifier>,
    limiter: FixedWindowLimiter,
    plan_limits: PlanLimits,
    fail_open: bool,
    routes: Arc<RouteTable>,
    forwarder: ProxyForwarder,
    usage: UsageRecorder,
}

impl Gateway {
    pub fn from_config(
        config: &GatewayConfig,
        verifier: Arc<IdentityVerifier>,
        store: Arc<dyn CounterStore>,
        routes: Arc<RouteTable>,
        usage: UsageRecorder,
    ) -> GatewayResult<Self> {
        Ok(Self {
            verifier,
            limiter: FixedWindowLimiter::new(store, config.rate_limit.window_seconds),
            plan_limits: PlanLimits::new(config.rate_limit.plan_limits.clone()),
            fail_open: config.rate_limit.fail_open_on_error,
            routes,
            forwarder: ProxyForwarder::new(&config.proxy)?,
            usage,
        })
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let started = Instant::now();
        let request_id = request_id(request.headers());
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let mut trace = DispatchTrace::default();
        let (stage, mut response) = match self
            .dispatch(request, client_ip, &request_id, &mut trace)
            .await
        {
            Ok(response) => (DispatchStage::Completed, response),
            Err((stage, err)) => {
                tracing::warn!(
                    request_id = %request_id,
                    stage = stage.as_str(),
                    subject = trace.subject.as_deref().unwrap_or("-"),
                    error = err.code(),
                    "request rejected"
                );
                let mut response = err.into_response();
                attach_hardening_headers(&mut response);
                (stage, response)
            }
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }

        tracing::info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            subject = trace.subject.as_deref().unwrap_or("-"),
            product = trace.product.as_deref().unwrap_or("-"),
            stage = stage.as_str(),
            status = response.status().as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );

        response
    }

    async fn dispatch(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
        request_id: &str,
        trace: &mut DispatchTrace,
    ) -> Result<Response<Body>, (DispatchStage, GatewayError)> {
        let subject = self
            .verifier
            .verify(request.headers())
            .map_err(|e| (DispatchStage::Authenticate, e))?;
        trace.subject = Some(subject.id.clone());

        let quota = self
            .admit(&subject)
            .await
            .map_err(|e| (DispatchStage::Admit, e))?;

        let route = self
            .routes
            .resolve(request.uri().path())
            .map_err(|e| (DispatchStage::Route, e))?;
        trace.product = Some(route.entry.product.clone());

        if !route.entry.allows(subject.plan) {
            return Err((DispatchStage::Authorize, GatewayError::Forbidden));
        }

        let (parts, body) = request.into_parts();
        let usage = UsageGuard::new(&self.usage, PendingUsage {
            subject_id: subject.id.clone(),
            product: route.entry.product.clone(),
            endpoint: route.backend_path.clone(),
            method: parts.method.clone(),
        });
        let exchange = ProxyExchange::new(request_id, parts, body, &route, &subject, client_ip);

        let result = self.forwarder.forward(exchange).await;
        usage.complete(result.as_ref().ok().map(|r| r.status()));

        let mut response = result.map_err(|e| (DispatchStage::Proxy, e))?;
        if let Some(quota) = quota {
            apply_quota_headers(response.headers_mut(), quota);
        }
        Ok(response)
    }

    /// `Ok(None)` means the counter store failed and the limiter is
    /// configured to let traffic through anyway.
    async fn admit(&self, subject: &Subject) -> GatewayResult<Option<Quota>> {
        let limit = self.plan_limits.limit_for(subject.plan);
        match self.limiter.admit(&subject.id, limit).await {
            Ok(Admission::Admitted {
                count,
                limit,
                reset_after_secs,
            }) => Ok(Some(Quota {
                limit,
                remaining: limit.saturating_sub(count),
                reset_after_secs,
            })),
            Ok(Admission::Rejected {
                count,
                retry_after_secs,
                ..
            }) => {
                tracing::debug!(subject = %subject.id, count, limit, "window exhausted");
                Err(GatewayError::RateLimited { retry_after_secs })
            }
            Err(err) if self.fail_open => {
                tracing::warn!(
                    subject = %subject.id,
                    error = %err,
                    "rate limit store unavailable; admitting request"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn apply_quota_headers(headers: &mut HeaderMap, quota: Quota) {
    for (name, value) in [
        ("x-ratelimit-limit", quota.limit),
        ("x-ratelimit-remaining", quota.remaining),
        ("x-ratelimit-reset", quota.reset_after_secs),
    ] {
        headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
    }
}

/// Applied to responses the gateway generates itself. Backend responses
/// keep whatever headers the backend chose.
pub fn attach_hardening_headers(response: &mut Response<Body>) {
    response.headers_mut().insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
}

use axum::{
    body::{Body, HttpBody},
    response::Response,
};
use futures_util::StreamExt;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, header,
    request::Parts,
};
use std::{
    collections::HashSet,
    io,
    net::IpAddr,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use crate::{
    config::ProxyConfig,
    error::{GatewayError, GatewayResult},
    idle::{ActivityClock, IdleTimeoutStream},
    identity::{API_KEY_HEADER, Subject},
    router::ResolvedRoute,
};

const GATEWAY_HEADER_PREFIX: &str = "x-gateway-";
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Everything the forwarder needs for one request. Owned by the forwarder
/// for the lifetime of the exchange and never shared.
pub struct ProxyExchange {
    pub request_id: String,
    pub method: Method,
    pub target_url: String,
    pub headers: HeaderMap,
    pub body: Body,
    pub client_ip: Option<IpAddr>,
    pub forward_credentials: bool,
    /// Verified identity, injected after caller-supplied copies are removed.
    pub identity: Vec<(HeaderName, HeaderValue)>,
}

impl ProxyExchange {
    pub fn new(
        request_id: &str,
        parts: Parts,
        body: Body,
        route: &ResolvedRoute<'_>,
        subject: &Subject,
        client_ip: Option<IpAddr>,
    ) -> Self {
        let target_url = match parts.uri.query() {
            Some(query) => format!("{}{}?{}", route.entry.backend_url, route.backend_path, query),
            None => format!("{}{}", route.entry.backend_url, route.backend_path),
        };

        let identity = [
            ("x-gateway-subject", subject.id.as_str()),
            ("x-gateway-plan", subject.plan.as_str()),
            ("x-gateway-product", route.entry.product.as_str()),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            HeaderValue::from_str(value)
                .ok()
                .map(|v| (HeaderName::from_static(name), v))
        })
        .collect();

        Self {
            request_id: request_id.to_string(),
            method: parts.method,
            target_url,
            headers: parts.headers,
            body,
            client_ip,
            forward_credentials: route.entry.forward_credentials,
            identity,
        }
    }
}

pub struct ProxyForwarder {
    client: reqwest::Client,
    timeout: Duration,
    service_token: Option<HeaderValue>,
}

impl ProxyForwarder {
    pub fn new(cfg: &ProxyConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let service_token = cfg
            .service_token
            .as_ref()
            .map(|token| HeaderValue::from_str(&format!("Bearer {token}")))
            .transpose()
            .map_err(|_| GatewayError::Internal("invalid BACKEND_SERVICE_TOKEN".to_string()))?
            .map(|mut value| {
                value.set_sensitive(true);
                value
            });

        Ok(Self {
            client,
            timeout: Duration::from_millis(cfg.timeout_ms),
            service_token,
        })
    }

    /// Streams the exchange to the backend and the backend's response back.
    ///
    /// The timeout is an idle timeout. Waiting for response headers fails
    /// once the upload has been quiet for that long, and the response body
    /// fails once no chunk has arrived for that long. Transfers that keep
    /// moving are never cut off. If the caller goes away, axum drops this
    /// future and the response stream, which drops the backend connection
    /// with them.
    pub async fn forward(&self, exchange: ProxyExchange) -> GatewayResult<Response<Body>> {
        let headers = self.outbound_headers(&exchange);
        let mut request = self
            .client
            .request(exchange.method, &exchange.target_url)
            .headers(headers);

        let upload = Arc::new(ActivityClock::new());
        if exchange.body.size_hint().exact() != Some(0) {
            let clock = upload.clone();
            let body = exchange
                .body
                .into_data_stream()
                .inspect(move |_| clock.touch());
            request = request.body(reqwest::Body::wrap_stream(body));
        }

        let started = Instant::now();
        let send = request.send();
        tokio::pin!(send);
        let response = loop {
            tokio::select! {
                result = &mut send => break result.map_err(|err| self.send_error(err))?,
                _ = tokio::time::sleep_until(upload.idle_deadline(self.timeout)) => {
                    if upload.idle_deadline(self.timeout) <= tokio::time::Instant::now() {
                        return Err(self.timed_out());
                    }
                }
            }
        };

        tracing::debug!(
            request_id = %exchange.request_id,
            status = %response.status(),
            ttfb_ms = started.elapsed().as_millis() as u64,
            "backend responded"
        );

        let connection_scoped = connection_tokens(response.headers());
        let mut builder = Response::builder().status(response.status());
        for (name, value) in response.headers() {
            if should_forward_header(name) && !connection_scoped.contains(name.as_str()) {
                builder = builder.header(name, value);
            }
        }

        let body = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
        builder
            .body(Body::from_stream(IdleTimeoutStream::new(
                Box::pin(body),
                self.timeout,
            )))
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    fn send_error(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            self.timed_out()
        } else {
            GatewayError::BackendUnavailable(err.to_string())
        }
    }

    fn timed_out(&self) -> GatewayError {
        GatewayError::BackendTimeout(self.timeout.as_millis() as u64)
    }

    fn outbound_headers(&self, exchange: &ProxyExchange) -> HeaderMap {
        let connection_scoped = connection_tokens(&exchange.headers);
        let mut out = HeaderMap::with_capacity(exchange.headers.len() + 6);

        for (name, value) in &exchange.headers {
            if !should_forward_header(name)
                || connection_scoped.contains(name.as_str())
                || name.as_str().starts_with(GATEWAY_HEADER_PREFIX)
                || name == X_FORWARDED_FOR
                || (!exchange.forward_credentials && is_credential_header(name))
            {
                continue;
            }
            out.append(name.clone(), value.clone());
        }

        for (name, value) in &exchange.identity {
            out.insert(name.clone(), value.clone());
        }

        if !exchange.forward_credentials {
            if let Some(token) = &self.service_token {
                out.insert(header::AUTHORIZATION, token.clone());
            }
        }

        if let Ok(value) = HeaderValue::from_str(&exchange.request_id) {
            out.insert(HeaderName::from_static("x-request-id"), value);
        }

        if let Some(value) = forwarded_for(&exchange.headers, exchange.client_ip) {
            out.insert(X_FORWARDED_FOR, value);
        }

        if let Some(host) = exchange.headers.get(header::HOST) {
            out.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
        }

        out
    }
}

fn forwarded_for(headers: &HeaderMap, client_ip: Option<IpAddr>) -> Option<HeaderValue> {
    let prior = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let chain = match (prior, client_ip) {
        (Some(prior), Some(ip)) => format!("{prior}, {ip}"),
        (Some(prior), None) => prior.to_string(),
        (None, Some(ip)) => ip.to_string(),
        (None, None) => return None,
    };
    HeaderValue::from_str(&chain).ok()
}

/// Header names listed in `Connection` are scoped to that hop.
fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn is_credential_header(name: &HeaderName) -> bool {
    name == header::AUTHORIZATION || name == header::COOKIE || name.as_str() == API_KEY_HEADER
}

fn should_forward_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

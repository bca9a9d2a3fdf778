use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use axum::{
    Json,
    Router,
    body::Body,
    extract::{ConnectInfo, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, Method, Request, header},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::{
    accounts::AccountDirectory,
    error::{GatewayError, GatewayResult},
    gateway::{Gateway, attach_hardening_headers},
    identity::{ADMIN_ROLE, API_KEY_HEADER, IdentityVerifier, Plan, Subject},
    router::RouteTable,
    usage::UsageStats,
    webhooks::{BillingEvent, SIGNATURE_HEADER, StripeSignatureVerifier},
};

const ADMIN_USERS_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub gateway: Arc<Gateway>,
    pub verifier: Arc<IdentityVerifier>,
    pub routes: Arc<RouteTable>,
    pub directory: Arc<dyn AccountDirectory>,
    pub usage_stats: Arc<UsageStats>,
    /// `None` rejects every webhook delivery.
    pub billing_webhook: Option<Arc<StripeSignatureVerifier>>,
}

pub fn build_router(state: AppState, cors_allowed_origins: &[String]) -> Router {
    let router = Router::new()
        .route("/", get(status))
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
        .route("/admin/users", get(admin_users))
        .route("/admin/analytics", get(admin_analytics))
        .route("/webhooks/stripe", post(stripe_webhook))
        .route("/api", any(proxy))
        .route("/api/{*rest}", any(proxy))
        .fallback(not_found)
        .with_state(state);

    match cors_layer(cors_allowed_origins) {
        Some(layer) => router.layer(layer),
        None => router,
    }
}

/// Origins may be exact (`https://app.example.com`) or a wildcard
/// subdomain pattern (`https://*.example.com`).
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }

    let origins = origins.to_vec();
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        origin
            .to_str()
            .is_ok_and(|origin| origins.iter().any(|allowed| origin_matches(allowed, origin)))
    });

    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                header::ACCEPT,
                header::HeaderName::from_static(API_KEY_HEADER),
                header::HeaderName::from_static("x-request-id"),
            ])
            .allow_credentials(true)
            .max_age(Duration::from_secs(3600)),
    )
}

fn origin_matches(allowed: &str, origin: &str) -> bool {
    if allowed == "*" {
        return true;
    }
    match allowed.split_once("://*.") {
        Some((scheme, domain)) => origin
            .strip_prefix(scheme)
            .and_then(|rest| rest.strip_prefix("://"))
            .and_then(|host| host.strip_suffix(domain))
            .is_some_and(|sub| sub.len() > 1 && sub.ends_with('.')),
        None => allowed == origin,
    }
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "operational",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
    plan: Option<String>,
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> GatewayResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| GatewayError::Validation(rejection.body_text()))
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> GatewayResult<Json<Value>> {
    let request = json_body(payload)?;
    let account = state
        .directory
        .authenticate(&request.email, &request.password)
        .await?;
    let issued = state.verifier.issue(&account.id, account.plan, &account.roles)?;
    let products = state.routes.products_for(account.plan);

    tracing::info!(account_id = %account.id, plan = %account.plan, "login succeeded");
    Ok(Json(json!({
        "token": issued.token,
        "expires_in": issued.expires_in,
        "user": account,
        "products": products,
    })))
}

async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> GatewayResult<Json<Value>> {
    let request = json_body(payload)?;
    let plan = match request.plan.as_deref() {
        None => Plan::Free,
        Some(raw) => raw
            .parse::<Plan>()
            .map_err(|e| GatewayError::Validation(e.to_string()))?,
    };

    let account = state
        .directory
        .register(&request.email, &request.password, plan)
        .await?;

    tracing::info!(account_id = %account.id, plan = %account.plan, "account registered");
    Ok(Json(json!({ "success": true, "user": account })))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> GatewayResult<Subject> {
    let subject = state.verifier.verify(headers)?;
    if !subject.has_role(ADMIN_ROLE) {
        return Err(GatewayError::Forbidden);
    }
    Ok(subject)
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn admin_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> GatewayResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let limit = params
        .limit
        .unwrap_or(ADMIN_USERS_LIMIT)
        .clamp(1, ADMIN_USERS_LIMIT);
    let users = state.directory.list(limit).await?;
    Ok(Json(json!({ "count": users.len(), "users": users })))
}

async fn admin_analytics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let plan_counts = state.directory.plan_counts().await?;
    let total_users: u64 = plan_counts.values().sum();
    let plans = plan_counts
        .into_iter()
        .map(|(plan, count)| (plan.as_str(), count))
        .collect::<BTreeMap<_, _>>();

    Ok(Json(json!({
        "total_users": total_users,
        "plans": plans,
        "usage": state.usage_stats.snapshot(),
    })))
}

async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<Json<Value>> {
    let Some(verifier) = &state.billing_webhook else {
        tracing::warn!("billing webhook received but no signing secret is configured");
        return Err(GatewayError::Unauthenticated);
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::Unauthenticated)?;
    verifier.verify(signature, &body, Utc::now().timestamp())?;

    let event: BillingEvent = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Validation(format!("invalid webhook payload: {e}")))?;

    // Existing tokens keep their plan claim until they expire.
    match event.plan_change() {
        Some(change) => match state.directory.set_plan(&change.email, change.plan).await? {
            Some(account) => tracing::info!(
                event_id = event.id.as_deref().unwrap_or("-"),
                account_id = %account.id,
                plan = %account.plan,
                "subscription plan updated"
            ),
            None => tracing::warn!(
                event_id = event.id.as_deref().unwrap_or("-"),
                kind = %event.kind,
                "subscription event for unknown account"
            ),
        },
        None => tracing::debug!(kind = %event.kind, "ignoring billing event"),
    }

    Ok(Json(json!({ "received": true })))
}

async fn proxy(State(state): State<AppState>, request: Request<Body>) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    state.gateway.handle_http(request, client_ip).await
}

async fn not_found() -> Response {
    let mut response = GatewayError::RouteNotFound.into_response();
    attach_hardening_headers(&mut response);
    response
}

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
};

use crate::identity::Plan;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub service_name: String,
    pub log_format: LogFormat,
    pub identity: IdentityConfig,
    pub rate_limit: RateLimitConfig,
    pub proxy: ProxyConfig,
    pub routes: Vec<RouteConfig>,
    pub usage: UsageConfig,
    pub webhook: WebhookConfig,
    pub cors_allowed_origins: Vec<String>,
    /// `(email, password)` of an admin account created at startup.
    pub bootstrap_admin: Option<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct IdentityConfig {
    pub jwt_secret: Option<String>,
    pub jwt_public_key: Option<String>,
    pub jwt_issuer: Option<String>,
    pub token_ttl_secs: u64,
    pub api_keys: Vec<ApiKeyConfig>,
}

#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    pub key: String,
    pub subject: String,
    pub plan: Plan,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub backend: RateLimitBackendConfig,
    pub window_seconds: u64,
    pub plan_limits: HashMap<Plan, u64>,
    pub fail_open_on_error: bool,
}

#[derive(Debug, Clone)]
pub enum RateLimitBackendConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub service_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub product: String,
    pub backend_url: String,
    /// `None` admits every plan.
    pub plans: Option<Vec<Plan>>,
    pub forward_credentials: bool,
}

#[derive(Debug, Clone)]
pub struct UsageConfig {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub sink: UsageSinkConfig,
}

#[derive(Debug, Clone)]
pub enum UsageSinkConfig {
    Log,
    File { path: PathBuf },
    Redis { url: String, stream_key: String },
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub stripe_secret: Option<String>,
    pub tolerance_secs: u64,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "compact".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            "compact" | "text" => LogFormat::Compact,
            other => return Err(anyhow!("unsupported LOG_FORMAT: {other}")),
        };

        let identity = IdentityConfig {
            jwt_secret: non_empty_env("JWT_SECRET"),
            jwt_public_key: non_empty_env("JWT_PUBLIC_KEY"),
            jwt_issuer: non_empty_env("JWT_ISSUER"),
            token_ttl_secs: parse_env("JWT_TTL_SECS", 3_600u64).max(60),
            api_keys: parse_api_keys(&env::var("API_KEYS").unwrap_or_default())?,
        };

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let backend = match env::var("RATE_LIMIT_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => RateLimitBackendConfig::InMemory,
            "redis" => RateLimitBackendConfig::Redis {
                url: redis_url.clone(),
                key_prefix: env::var("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|_| "rate_limit".to_string()),
            },
            other => return Err(anyhow!("unsupported RATE_LIMIT_BACKEND: {other}")),
        };

        let rate_limit = RateLimitConfig {
            backend,
            window_seconds: parse_env("RATE_LIMIT_WINDOW_SECONDS", 60u64).max(1),
            plan_limits: parse_plan_limits(
                &env::var("PLAN_LIMITS")
                    .unwrap_or_else(|_| "free=1000,pro=10000,enterprise=100000".to_string()),
            )?,
            fail_open_on_error: parse_env("RATE_LIMIT_FAIL_OPEN", false),
        };

        let proxy = ProxyConfig {
            timeout_ms: parse_env("BACKEND_TIMEOUT_MS", 30_000u64).max(100),
            connect_timeout_ms: parse_env("BACKEND_CONNECT_TIMEOUT_MS", 3_000u64).max(100),
            service_token: non_empty_env("BACKEND_SERVICE_TOKEN"),
        };

        let routes = parse_routes(&env::var("ROUTES").unwrap_or_else(|_| {
            "/api/vllm=vllm@http://127.0.0.1:9001,\
             /api/identity=keycloak@http://127.0.0.1:9002,\
             /api/storage=minio@http://127.0.0.1:9003"
                .to_string()
        }))?;

        let sink = match env::var("USAGE_SINK")
            .unwrap_or_else(|_| "log".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "log" => UsageSinkConfig::Log,
            "file" => UsageSinkConfig::File {
                path: env::var("USAGE_FILE_PATH")
                    .map(PathBuf::from)
                    .context("USAGE_SINK=file requires USAGE_FILE_PATH")?,
            },
            "redis" => UsageSinkConfig::Redis {
                url: redis_url,
                stream_key: env::var("USAGE_STREAM_KEY")
                    .unwrap_or_else(|_| "usage_events".to_string()),
            },
            other => return Err(anyhow!("unsupported USAGE_SINK: {other}")),
        };

        let usage = UsageConfig {
            queue_capacity: parse_env("USAGE_QUEUE_CAPACITY", 10_000usize).max(1),
            max_attempts: parse_env("USAGE_MAX_ATTEMPTS", 3u32).max(1),
            sink,
        };

        let webhook = WebhookConfig {
            stripe_secret: non_empty_env("STRIPE_WEBHOOK_SECRET"),
            tolerance_secs: parse_env("WEBHOOK_TOLERANCE_SECS", 300u64),
        };

        Ok(Self {
            bind_addr,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "API Gateway".to_string()),
            log_format,
            identity,
            rate_limit,
            proxy,
            routes,
            usage,
            webhook,
            cors_allowed_origins: parse_csv("CORS_ALLOWED_ORIGINS", ""),
            bootstrap_admin: non_empty_env("BOOTSTRAP_ADMIN")
                .map(|raw| parse_bootstrap_admin(&raw))
                .transpose()?,
        })
    }
}

fn parse_routes(raw: &str) -> Result<Vec<RouteConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let mut parts = chunk.splitn(2, '=');
        let path_prefix = parts
            .next()
            .map(str::trim)
            .filter(|s| s.starts_with('/'))
            .ok_or_else(|| anyhow!("invalid route entry: {chunk}"))?
            .trim_end_matches('/')
            .to_string();
        if path_prefix.is_empty() {
            return Err(anyhow!("route prefix must not be the root path: {chunk}"));
        }

        let rhs = parts
            .next()
            .map(str::trim)
            .ok_or_else(|| anyhow!("invalid route entry: {chunk}"))?;

        let fields: Vec<&str> = rhs.split('@').map(str::trim).collect();
        let product = fields
            .first()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("route has no product id: {chunk}"))?
            .to_string();
        let backend_url = fields
            .get(1)
            .map(|s| s.trim_end_matches('/').to_string())
            .filter(|s| s.starts_with("http://") || s.starts_with("https://"))
            .ok_or_else(|| anyhow!("invalid backend URL for {product}"))?;
        let plans = match fields.get(2).copied() {
            None | Some("") | Some("*") => None,
            Some(list) => Some(
                list.split('|')
                    .map(|p| p.trim().parse::<Plan>())
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("invalid plan list for {product}"))?,
            ),
        };
        let forward_credentials = match fields.get(3).copied() {
            None | Some("") => false,
            Some("forward-auth") => true,
            Some(other) => return Err(anyhow!("unknown route flag for {product}: {other}")),
        };

        out.push(RouteConfig {
            path_prefix,
            product,
            backend_url,
            plans,
            forward_credentials,
        });
    }

    if out.is_empty() {
        return Err(anyhow!("no routes configured"));
    }
    Ok(out)
}

fn parse_plan_limits(raw: &str) -> Result<HashMap<Plan, u64>> {
    let mut limits = HashMap::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (plan, limit) = chunk
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid plan limit entry: {chunk}"))?;
        let plan = plan.trim().parse::<Plan>()?;
        let limit = limit
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid limit for plan {plan}"))?;
        limits.insert(plan, limit);
    }

    if limits.is_empty() {
        return Err(anyhow!("PLAN_LIMITS must configure at least one plan"));
    }
    Ok(limits)
}

fn parse_api_keys(raw: &str) -> Result<Vec<ApiKeyConfig>> {
    let mut keys = Vec::new();
    for chunk in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let mut parts = chunk.split(':');
        let (Some(key), Some(subject), Some(plan)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(anyhow!("API_KEYS entries must be key:subject:plan[:roles]"));
        };
        if key.is_empty() || subject.is_empty() {
            return Err(anyhow!("API_KEYS entry has an empty key or subject"));
        }
        let roles = parts
            .next()
            .map(|r| {
                r.split('|')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        keys.push(ApiKeyConfig {
            key: key.to_string(),
            subject: subject.to_string(),
            plan: plan.parse()?,
            roles,
        });
    }
    Ok(keys)
}

fn parse_bootstrap_admin(raw: &str) -> Result<(String, String)> {
    raw.split_once(':')
        .map(|(email, password)| (email.trim().to_string(), password.to_string()))
        .filter(|(email, password)| !email.is_empty() && !password.is_empty())
        .ok_or_else(|| anyhow!("BOOTSTRAP_ADMIN must be email:password"))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

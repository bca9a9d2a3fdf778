mod accounts;
mod app;
mod config;
mod error;
mod gateway;
mod identity;
mod idle;
mod ratelimit;
mod router;
mod upstream;
mod usage;
mod webhooks;

#[cfg(test)]
mod tests;

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::{
    accounts::{AccountDirectory, InMemoryAccountDirectory},
    app::{AppState, build_router},
    config::{GatewayConfig, LogFormat, RateLimitBackendConfig},
    gateway::Gateway,
    identity::IdentityVerifier,
    ratelimit::{
        CounterStore,
        in_memory::InMemoryCounterStore,
        redis_backend::RedisCounterStore,
    },
    router::RouteTable,
    usage::UsageRecorder,
    webhooks::StripeSignatureVerifier,
};

const USAGE_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = GatewayConfig::from_env().context("failed to build gateway config")?;
    init_tracing(cfg.log_format);

    let bind_addr = cfg.bind_addr;
    let verifier = Arc::new(
        IdentityVerifier::from_config(&cfg.identity).context("failed to load identity keys")?,
    );
    if !verifier.can_issue() {
        tracing::warn!("no signing key configured; /auth/login cannot issue tokens");
    }
    let routes = Arc::new(RouteTable::new(cfg.routes.clone()));

    let store: Arc<dyn CounterStore> = match &cfg.rate_limit.backend {
        RateLimitBackendConfig::InMemory => {
            let store = InMemoryCounterStore::new();
            store.spawn_sweeper(Duration::from_secs(cfg.rate_limit.window_seconds.max(5)));
            Arc::new(store)
        }
        RateLimitBackendConfig::Redis { url, key_prefix } => Arc::new(
            RedisCounterStore::new(url.clone(), key_prefix.clone())
                .await
                .context("failed to connect rate limit store to redis")?,
        ),
    };

    let (usage, usage_drain) = UsageRecorder::from_config(&cfg.usage)
        .await
        .context("failed to start usage recorder")?;
    let usage_stats = usage.stats();

    let directory = InMemoryAccountDirectory::new();
    if let Some((email, password)) = &cfg.bootstrap_admin {
        directory
            .bootstrap_admin(email, password)
            .await
            .context("failed to create bootstrap admin")?;
    }
    let directory: Arc<dyn AccountDirectory> = Arc::new(directory);

    let gateway = Arc::new(
        Gateway::from_config(&cfg, verifier.clone(), store, routes.clone(), usage)
            .context("failed to build dispatch pipeline")?,
    );

    let state = AppState {
        service_name: cfg.service_name.clone(),
        gateway,
        verifier,
        routes,
        directory,
        usage_stats,
        billing_webhook: cfg
            .webhook
            .stripe_secret
            .as_deref()
            .map(|secret| Arc::new(StripeSignatureVerifier::new(secret, cfg.webhook.tolerance_secs))),
    };
    let app = build_router(state, &cfg.cors_allowed_origins);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(
        addr = %bind_addr,
        routes = cfg.routes.len(),
        window_secs = cfg.rate_limit.window_seconds,
        "API gateway listening"
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server error")?;

    // The router, and with it the last usage sender, is gone once serve
    // returns, so the drain finishes after flushing what is queued.
    match tokio::time::timeout(USAGE_FLUSH_TIMEOUT, usage_drain).await {
        Ok(Ok(())) => tracing::info!("usage events flushed"),
        Ok(Err(err)) => tracing::error!(error = %err, "usage drain task failed"),
        Err(_) => tracing::warn!("timed out flushing usage events"),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received, draining connections");
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,hyper=warn,reqwest=warn,tower_http=warn")
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::Json,
    routing::get,
    Extension, Router,
};
use prometheus::TextEncoder;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use news_ratelimit::{
    cache::CacheService,
    catalog::PolicyCatalog,
    config::Settings,
    metrics::Metrics,
    middleware::enforce_by_role,
    selector::StoreSelector,
    utils::TrustedProxies,
};

#[derive(Clone)]
struct AppState {
    catalog: Arc<PolicyCatalog>,
    selector: Arc<StoreSelector>,
    cache: Arc<CacheService>,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PolicySummary {
    scope: String,
    window_secs: u64,
    max: u32,
    backend: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "news_ratelimit=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting news API rate limiter");

    let config_path = std::env::var("CONFIG_PATH").ok();
    let mut settings = Settings::load(config_path.as_deref())?;
    if let Ok(url) = std::env::var("REDIS_URL") {
        settings.redis.url = Some(url).filter(|u| !u.trim().is_empty());
    }

    let metrics = Arc::new(Metrics::new()?);
    let selector = Arc::new(StoreSelector::new(&settings, metrics.clone()));
    let catalog = Arc::new(
        PolicyCatalog::build(&settings.policies, selector.clone(), metrics.clone()).await?,
    );
    let cache = Arc::new(CacheService::new(
        selector.cache_backend().await,
        &settings.cache,
        metrics.clone(),
    ));

    let state = AppState {
        catalog,
        selector,
        cache,
        metrics,
    };

    let addr = settings.server.listen.parse::<SocketAddr>()?;
    info!("HTTP server listening on {}", addr);

    let proxies = TrustedProxies(settings.server.trusted_proxies);
    if let Err(e) = start_http_server(state, addr, proxies).await {
        warn!("HTTP server error: {}", e);
    }

    info!("Service stopped");
    Ok(())
}

async fn start_http_server(
    state: AppState,
    addr: SocketAddr,
    proxies: TrustedProxies,
) -> Result<()> {
    let limited = Router::new()
        .route("/api/limits", get(limits_handler))
        .layer(
            ServiceBuilder::new()
                .layer(Extension(proxies))
                .layer(middleware::from_fn_with_state(
                    state.catalog.role_aware().clone(),
                    enforce_by_role,
                )),
        );

    let app: Router = Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .merge(limited)
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
    }
}

async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.selector.health_check().await {
        Ok(backend) => Ok(Json(json!({
            "status": "healthy",
            "backend": backend.as_str(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!("Health check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Configured policies, served through the cache
async fn limits_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<PolicySummary>>, StatusCode> {
    let catalog = state.catalog.clone();
    let summaries = state
        .cache
        .get_or_compute("limits:summary", state.cache.default_ttl(), || async move {
            Ok::<_, std::convert::Infallible>(
                catalog
                    .limiters()
                    .into_iter()
                    .map(|limiter| PolicySummary {
                        scope: limiter.policy().scope().to_string(),
                        window_secs: limiter.policy().window().as_secs(),
                        max: limiter.policy().max(),
                        backend: limiter.backend().to_string(),
                    })
                    .collect(),
            )
        })
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(summaries))
}

use anyhow::Result;
use axum::{extract::State, http::StatusCode, middleware, response::Json, routing::get, Router};
use prometheus::TextEncoder;
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_admission::{
    admission_middleware,
    config::Settings,
    manager::RateLimitManager,
    redis::RedisConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_admission=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rust Admission Service");

    let settings = Settings::load(None)?;
    info!(
        http_addr = %settings.http_addr,
        tokens_per_interval = settings.rate_limit.tokens_per_interval,
        interval = %settings.rate_limit.interval,
        "Configuration loaded"
    );

    let manager = create_manager(&settings).await?;
    let app = router(manager);

    let listener = TcpListener::bind(settings.http_addr).await?;
    info!("HTTP server listening on {}", settings.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Service stopped");
    Ok(())
}

async fn create_manager(settings: &Settings) -> Result<RateLimitManager> {
    let builder = RateLimitManager::builder(settings.rate_limit.clone()).options(settings.options());

    let manager = match &settings.redis_url {
        Some(url) => {
            builder
                .build_with_shared_redis(RedisConfig::with_url(url.clone()))
                .await?
        }
        None => {
            warn!("No redis_url configured, rate limit state will not survive restarts");
            builder.build()?
        }
    };
    Ok(manager)
}

fn router(manager: RateLimitManager) -> Router {
    let limited = Router::new()
        .route("/", get(root))
        .route_layer(middleware::from_fn_with_state(
            manager.clone(),
            admission_middleware,
        ));

    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(manager)
        .merge(limited)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn health_check(
    State(manager): State<RateLimitManager>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match manager.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "buckets": manager.bucket_count().await,
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(manager): State<RateLimitManager>) -> Result<String, StatusCode> {
    manager.bucket_count().await;

    let encoder = TextEncoder::new();
    let metric_families = manager.metrics().registry().gather();

    encoder
        .encode_to_string(&metric_families)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

use axum::{
    http::{header, Method, StatusCode},
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

mod adapters;
mod auth;
mod config;
mod db;
pub mod error;
mod handlers;
mod models;
mod oauth;
mod runner;
mod schema;
mod webhooks;

use config::AppConfig;
use db::DbPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub config: Arc<AppConfig>,
    pub http: reqwest::Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    dotenvy::dotenv().ok();

    let config = Arc::new(AppConfig::from_env()?);
    let pool = db::establish_connection_pool(&config.database_url)?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let state = AppState {
        pool: pool.clone(),
        config: config.clone(),
        http: http.clone(),
    };

    // Background worker; the /internal/process-jobs endpoint drains the same
    // queue for deployments without a resident worker.
    tokio::spawn(runner::start_sync_worker(pool, config.clone(), http));

    let protected = Router::new()
        .route("/oauth/authorize", get(handlers::oauth_authorize))
        .route("/integrations", get(handlers::list_integrations))
        .route("/integrations/:id", delete(handlers::disconnect_integration))
        .route("/sync", post(handlers::sync_now))
        .route("/sync/jobs", get(handlers::list_jobs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/oauth/callback", get(handlers::oauth_callback))
        .route("/webhooks/:provider", post(webhooks::receive_webhook))
        .route("/internal/process-jobs", post(handlers::process_jobs))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// Build CORS layer based on environment configuration.
///
/// If CORS_ALLOWED_ORIGINS is set, only those origins are allowed.
/// If not set, defaults to permissive CORS (for development only).
fn build_cors_layer() -> CorsLayer {
    let allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS").ok();

    match allowed_origins {
        Some(origins) => {
            let origins: Vec<_> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();

            if origins.is_empty() {
                tracing::warn!(
                    "CORS_ALLOWED_ORIGINS is set but empty, using permissive CORS (not recommended for production)"
                );
                CorsLayer::permissive()
            } else {
                tracing::info!("CORS configured for origins: {:?}", origins);
                CorsLayer::new()
                    .allow_origin(AllowOrigin::list(origins))
                    .allow_methods([
                        Method::GET,
                        Method::POST,
                        Method::DELETE,
                        Method::OPTIONS,
                    ])
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                    .allow_credentials(true)
            }
        }
        None => {
            tracing::warn!(
                "CORS_ALLOWED_ORIGINS not set, using permissive CORS (not recommended for production)"
            );
            CorsLayer::permissive()
        }
    }
}

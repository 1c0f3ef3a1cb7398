//! `fieldops serve`: HTTP JSON API over the lifecycle service.
//!
//! Security features:
//! - CORS headers on all responses (permissive for local dev)
//! - Per-IP rate limiting (default: 60 req/min, configurable)
//! - Optional API key authentication
//!
//! Endpoints:
//! - GET  /health                                   - Server status (exempt from auth)
//! - GET  /policy                                   - Policy table and its analysis
//! - POST /tickets                                  - Create a ticket
//! - GET  /tickets?state=                           - List tickets
//! - GET  /tickets/{id}                             - Ticket snapshot
//! - GET  /tickets/{id}/history                     - Status history
//! - GET  /tickets/{id}/time-log                    - Time log entries and report
//! - GET  /tickets/{id}/locations                   - Location samples
//! - GET  /tickets/{id}/transitions                 - Targets open to the actor's role
//! - POST /tickets/{id}/transitions                 - Execute a transition
//! - POST /tickets/{id}/confirmation-codes          - Issue a code (sent by SMS)
//! - POST /tickets/{id}/confirmation-codes/verify   - Verify a code
//!
//! Mutating and role-dependent endpoints read the actor from `X-Actor-Id`
//! and `X-Actor-Role`. All responses use Content-Type: application/json.

mod handlers;
mod middleware;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use fieldops_engine::{
    LifecycleService, LogDispatcher, NotificationDispatcher, PolicyTable, TransitionExecutor,
};
use fieldops_storage::MemoryStore;
use tower_http::cors::{Any, CorsLayer};

use self::handlers::{
    handle_available_transitions, handle_create_ticket, handle_get_ticket, handle_health,
    handle_history, handle_issue_code, handle_list_tickets, handle_locations, handle_not_found,
    handle_policy, handle_time_log, handle_transition, handle_verify_code,
};
use self::middleware::{auth_middleware, rate_limit_middleware};
use self::state::{AppState, RateLimiter};
use crate::config::ServeConfig;
use crate::sms::WebhookDispatcher;

/// Maximum request body size: 1 MB.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Rate limit window duration in seconds (1 minute).
const RATE_LIMIT_WINDOW_SECS: u64 = 60;

fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

fn build_state(config: &ServeConfig) -> Result<AppState, Box<dyn std::error::Error>> {
    let policy = match &config.policy_file {
        Some(path) => {
            let table = PolicyTable::load(path)?;
            tracing::info!(path = %path.display(), edges = table.len(), "loaded policy file");
            table
        }
        None => PolicyTable::standard(),
    };

    let store = MemoryStore::with_lock_timeout(config.lifecycle.lock_timeout());
    let executor = TransitionExecutor::new(store, policy, config.lifecycle.clone());
    let notifier: Arc<dyn NotificationDispatcher> = match &config.sms_gateway_url {
        Some(url) => {
            tracing::info!(%url, "sending SMS through gateway");
            Arc::new(WebhookDispatcher::new(url.clone()))
        }
        None => {
            tracing::info!("no SMS gateway configured, notifications are logged only");
            Arc::new(LogDispatcher)
        }
    };

    Ok(AppState {
        service: LifecycleService::new(executor, notifier),
        rate_limiter: RateLimiter::new(config.rate_limit),
        api_key: config.api_key.clone(),
    })
}

fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/policy", get(handle_policy))
        .route("/tickets", get(handle_list_tickets).post(handle_create_ticket))
        .route("/tickets/{id}", get(handle_get_ticket))
        .route("/tickets/{id}/history", get(handle_history))
        .route("/tickets/{id}/time-log", get(handle_time_log))
        .route("/tickets/{id}/locations", get(handle_locations))
        .route(
            "/tickets/{id}/transitions",
            get(handle_available_transitions).post(handle_transition),
        )
        .route("/tickets/{id}/confirmation-codes", post(handle_issue_code))
        .route(
            "/tickets/{id}/confirmation-codes/verify",
            post(handle_verify_code),
        )
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Serve until Ctrl+C.
///
/// When TLS cert/key paths are provided, the server listens over HTTPS
/// using `axum-server` with rustls. Otherwise it uses plain HTTP.
pub async fn start_server(
    config: ServeConfig,
    _tls_cert: Option<PathBuf>,
    _tls_key: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = Arc::new(build_state(&config)?);

    if state.api_key.is_some() {
        tracing::info!("API key authentication enabled");
    }
    tracing::info!(
        rate_limit = config.rate_limit,
        "rate limit per IP per minute"
    );

    let app = router(state);
    let addr = format!("0.0.0.0:{}", config.port);

    #[cfg(feature = "tls")]
    if let (Some(cert_path), Some(key_path)) = (&_tls_cert, &_tls_key) {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;
        let socket_addr: std::net::SocketAddr = addr.parse()?;
        tracing::info!("fieldops listening on https://{}", addr);
        axum_server::bind_rustls(socket_addr, tls)
            .serve(app.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .await?;
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("fieldops listening on http://{}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "could not install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}

//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod admin;
mod intake;

use crate::config::Settings;
use crate::membership::Stage;
use crate::metrics;
use crate::state::SharedState;
use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header, Method},
    middleware::{from_fn, Next},
    response::Response,
    routing::{get, post, put},
    Extension, Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Largest accepted agreement scan
const AGREEMENT_MAX_BYTES: usize = 16 * 1024 * 1024;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    // Build CORS layer
    let cors = build_cors_layer(settings);

    // Build tracing/logging layer
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Build middleware stack
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    let mut router = Router::new()
        // Health and counters
        .route("/health", get(health_check))
        .route("/status", get(status))

        // Intake
        .route("/api/applications", post(intake::submit_application))
        .route(
            "/api/applications/{key}/agreement",
            put(admin::attach_agreement).layer(DefaultBodyLimit::max(AGREEMENT_MAX_BYTES)),
        )

        // Lookups
        .route("/api/usernames/{username}", get(admin::get_member_by_username))

        // Transitions
        .route("/api/applications/{key}/approve", post(admin::approve_application))
        .route("/api/applications/{key}/reject", post(admin::reject_application))
        .route("/api/queue/{key}/trash", post(admin::trash_queued))
        .route("/api/members/{key}/trash", post(admin::trash_member));

    // Listing, fetch and field updates for every stage
    for stage in Stage::ALL {
        router = router.merge(stage_routes(stage));
    }

    // Apply middleware and state
    router
        .layer(from_fn(count_requests))
        .layer(middleware)
        .with_state(state)
}

/// `GET /api/{stage}`, `GET /api/{stage}/{key}` and `PATCH /api/{stage}/{key}`
/// for one stage. The stage reaches the handlers as an extension.
fn stage_routes(stage: Stage) -> Router<SharedState> {
    let base = format!("/api/{}", stage.path_segment());
    Router::new()
        .route(&base, get(admin::list_records))
        .route(
            &format!("{}/{{key}}", base),
            get(admin::get_record).patch(admin::update_record),
        )
        .layer(Extension(stage))
}

async fn count_requests(request: Request, next: Next) -> Response {
    metrics::record_request();
    next.run(request).await
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::PATCH,
        Method::OPTIONS,
    ];

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
            .max_age(Duration::from_secs(3600))
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
            .max_age(Duration::from_secs(3600))
    }
}

/// Health check endpoint
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Process counters and the active backend
async fn status(State(state): State<SharedState>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "backend": state.backend_name,
        "metrics": metrics::snapshot(),
    }))
}

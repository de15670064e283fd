//! REST API routes configuration

use crate::api::handlers::{self, ApiState};
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

/// Unknown routes get a JSON 404
async fn fallback_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(r#"{"error":"Not Found","retryable":false}"#),
    )
        .into_response()
}

/// Create the API router with all routes
pub fn create_router(state: ApiState) -> Router {
    // Configure CORS for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Invitations
        .route("/api/guardian/invite", post(handlers::create_invitation))
        .route("/api/guardian/{code}", get(handlers::get_invitation))
        .route(
            "/api/guardian/{code}/register",
            post(handlers::register_invitee),
        )
        .route(
            "/api/guardian/{code}/confirm",
            post(handlers::confirm_invitation),
        )
        // Owner actions
        .route("/api/guardian/remove", post(handlers::remove_guardian))
        .route("/api/guardian/status", post(handlers::set_guardian_status))
        .route("/api/wallet/recover", post(handlers::recover_access))
        // Multisig views
        .route(
            "/api/multisig/{address}/guardians",
            get(handlers::list_guardians),
        )
        .route(
            "/api/multisig/{address}/invitations",
            get(handlers::list_invitations),
        )
        .fallback(fallback_handler)
        // Add state and middleware
        .with_state(state)
        .layer(cors)
}

mod admin;
mod ice;
mod signaling;

use crate::rtc::RtcEngine;
use crate::state::AppState;
use axum::{
    Json, Router,
    http::HeaderValue,
    routing::{get, post},
};
use camrelay_protocol::HealthResponse;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router<E: RtcEngine>(state: AppState<E>) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        // Health check
        .route("/health", get(|| async { Json(HealthResponse::ok()) }))
        // Signaling
        .route("/publish", post(signaling::publish::<E>))
        .route("/viewer", post(signaling::connect_viewer::<E>))
        // Operator endpoints
        .route("/channels", get(admin::list_channels::<E>))
        .route("/channels/{channel_id}/unlock", post(admin::force_unlock_viewer::<E>))
        .route("/viewers", get(admin::query_state::<E>))
        .route("/viewers_count", get(admin::viewer_count::<E>))
        // ICE configuration for clients
        .route("/rtc/ice-servers", get(ice::get_ice_servers::<E>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if allowed_origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    cors.allow_origin(AllowOrigin::list(origins))
}

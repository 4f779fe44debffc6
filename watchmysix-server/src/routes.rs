use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header},
    routing::{get, post},
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::{
    AppState,
    handlers::{artifacts, jobs, logs, system},
    infra::config::CorsConfig,
};

/// Routes mounted under `/api`.
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(system::health))
        .route("/tools", get(system::list_tools))
        .route("/wordlists", get(system::list_wordlists))
        .route("/resolvers", get(system::list_resolvers))
        .route("/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route("/jobs/{id}", get(jobs::get_job).delete(jobs::cancel_job))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{id}/logs", get(logs::get_logs))
        .route("/jobs/{id}/logs/stream", get(logs::stream_logs))
        .route("/jobs/{id}/artifacts", get(artifacts::list_artifacts))
        .route(
            "/jobs/{id}/artifacts/{name}",
            get(artifacts::download_artifact),
        )
        .route("/jobs/{id}/archive", get(artifacts::download_archive))
}

pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors);
    Router::new()
        .nest("/api", create_api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("last-event-id"),
        ]);

    if config.is_wildcard() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::require_caller;

use super::export::export_events;
use super::handlers::{
    compare_links, create_report, get_devices, get_events, get_geographic, get_job_history,
    get_link_alerts, get_overview, get_performance, get_referrers, get_rollups, get_summary,
    get_timeline, get_trending, get_user_alerts, health_check, AppState,
};

pub fn create_api_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected_routes = Router::new()
        .route("/links/{id}/summary", get(get_summary))
        .route("/links/{id}/geographic", get(get_geographic))
        .route("/links/{id}/devices", get(get_devices))
        .route("/links/{id}/referrers", get(get_referrers))
        .route("/links/{id}/timeline", get(get_timeline))
        .route("/links/{id}/performance", get(get_performance))
        .route("/links/{id}/alerts", get(get_link_alerts))
        .route("/links/{id}/rollups", get(get_rollups))
        .route("/links/{id}/events", get(get_events))
        .route("/links/{id}/export", get(export_events))
        .route("/compare", get(compare_links))
        .route("/reports", post(create_report))
        .route("/me/overview", get(get_overview))
        .route("/me/trending", get(get_trending))
        .route("/me/alerts", get(get_user_alerts))
        .route("/jobs/history", get(get_job_history))
        .route_layer(middleware::from_fn(require_caller))
        .with_state(state);

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

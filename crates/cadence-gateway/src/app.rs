use axum::{
    routing::{get, post},
    Router,
};
use cadence_core::config::CadenceConfig;
use cadence_scheduler::SchedulerHandle;
use std::sync::Arc;

use crate::http::{health, items};

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CadenceConfig,
    pub scheduler: SchedulerHandle,
    /// Platforms with a registered publisher, reported by /health.
    pub platforms: Vec<String>,
}

impl AppState {
    pub fn new(config: CadenceConfig, scheduler: SchedulerHandle, platforms: Vec<String>) -> Self {
        Self {
            config,
            scheduler,
            platforms,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/items", post(items::create_item).get(items::list_items))
        .route("/items/due", get(items::due_items))
        .route("/items/stats", get(items::item_stats))
        .route(
            "/items/{id}",
            get(items::get_item)
                .patch(items::update_item)
                .delete(items::delete_item),
        )
        .route("/items/{id}/activate", post(items::activate_item))
        .route("/items/{id}/pause", post(items::pause_item))
        .route("/items/{id}/cancel", post(items::cancel_item))
        .route("/items/{id}/retry", post(items::retry_item))
        .route("/items/{id}/send-now", post(items::send_now))
        .route("/items/{id}/attempts", get(items::item_attempts))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

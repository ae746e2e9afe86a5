//! HTTP router assembly.

use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::chat::{ChatRouteState, ChatService, chat_routes};
use crate::roadmap::{RoadmapRouteState, roadmap_routes};
use crate::store::Database;

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "localdesk"
    }))
}

/// Build the full service router: health, chat, settings, roadmap and chat
/// history, behind a permissive CORS layer for the browser client.
pub fn build_router(service: Arc<ChatService>, store: Arc<dyn Database>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(chat_routes(ChatRouteState {
            service,
            store: Arc::clone(&store),
        }))
        .merge(roadmap_routes(RoadmapRouteState { store }))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
}

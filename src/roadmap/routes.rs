//! REST endpoints for user settings and the derived roadmap.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use super::derive::RoadmapSummary;
use super::model::{SettingsPatch, UserSettings};
use crate::error::ApiError;
use crate::store::Database;

/// Shared state for settings and roadmap routes.
#[derive(Clone)]
pub struct RoadmapRouteState {
    pub store: Arc<dyn Database>,
}

/// GET /api/settings/{user_id}
///
/// Users without a stored profile get default settings.
async fn get_settings(
    State(state): State<RoadmapRouteState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserSettings>, ApiError> {
    Ok(Json(state.store.get_user_settings(&user_id).await?))
}

/// PUT /api/settings/{user_id}
///
/// Fields present in the body replace the stored ones; the merged settings
/// are returned.
async fn put_settings(
    State(state): State<RoadmapRouteState>,
    Path(user_id): Path<String>,
    body: Bytes,
) -> Result<Json<UserSettings>, ApiError> {
    let patch: SettingsPatch = serde_json::from_slice(&body)
        .map_err(|e| ApiError::validation(format!("Invalid settings: {e}")))?;
    let merged = state.store.update_user_settings(&user_id, &patch).await?;
    tracing::info!(user_id = %user_id, "Settings updated");
    Ok(Json(merged))
}

/// GET /api/roadmap/{user_id}
async fn get_roadmap(
    State(state): State<RoadmapRouteState>,
    Path(user_id): Path<String>,
) -> Result<Json<RoadmapSummary>, ApiError> {
    let settings = state.store.get_user_settings(&user_id).await?;
    Ok(Json(RoadmapSummary::from_settings(&settings)))
}

/// POST /api/roadmap/preview
///
/// Renders a roadmap for settings held by the client, for guests. An empty
/// body previews the default settings.
async fn preview_roadmap(body: Bytes) -> Result<Json<RoadmapSummary>, ApiError> {
    let settings: UserSettings = if body.iter().all(u8::is_ascii_whitespace) {
        UserSettings::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::validation(format!("Invalid settings: {e}")))?
    };
    Ok(Json(RoadmapSummary::from_settings(&settings)))
}

/// Build the settings and roadmap routes.
pub fn roadmap_routes(state: RoadmapRouteState) -> Router {
    Router::new()
        .route("/api/settings/{user_id}", get(get_settings).put(put_settings))
        .route("/api/roadmap/{user_id}", get(get_roadmap))
        .route("/api/roadmap/preview", post(preview_roadmap))
        .with_state(state)
}

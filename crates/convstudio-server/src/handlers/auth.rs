//! Credential status handlers

use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::{error, info};

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let auth = state.auth.status().await;
    Json(json!({
        "authenticated": auth.is_authenticated(),
        "status": auth.status,
        "last_refresh": auth.last_refresh_at,
        "refresh_interval": state.auth.refresh_interval().as_secs(),
        "auth_type": auth.auth_type,
        "origin": auth.origin,
        "helper_path": auth.helper_artifact_path,
        "last_error": auth.last_error,
    }))
}

pub async fn refresh(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.auth.refresh_now().await {
        Ok(()) => {
            let auth = state.auth.status().await;
            info!("Manual credential refresh succeeded");
            (
                StatusCode::OK,
                Json(json!({ "success": true, "last_refresh": auth.last_refresh_at })),
            )
        }
        Err(e) => {
            error!("Manual credential refresh failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
        }
    }
}

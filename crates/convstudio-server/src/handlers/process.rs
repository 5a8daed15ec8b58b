//! Job control and job output streaming

use crate::handlers::{api_error, ApiError};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use convstudio_core::{SessionState, StreamEvent, SupervisorError};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    query: String,
}

pub async fn start(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<Value>, ApiError> {
    let query = req.query.trim();
    if query.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "No query provided"));
    }

    let command = state.config.agent.build_command(query);
    match state.supervisor.start(command) {
        Ok(handle) => {
            info!("Started job {}", handle.id());
            Ok(Json(json!({ "status": "started", "session_id": handle.id() })))
        }
        Err(SupervisorError::AlreadyRunning { session_id }) => Err((
            StatusCode::CONFLICT,
            Json(json!({
                "error": "A job is already running",
                "session_id": session_id,
            })),
        )),
        Err(e) => {
            error!("Failed to start job: {}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.supervisor.cancel(&id).await {
        Ok(session_state) => {
            let status = if session_state == SessionState::Cancelled {
                "cancelled"
            } else {
                "finished"
            };
            Ok(Json(json!({ "status": status, "state": session_state })))
        }
        Err(SupervisorError::SessionNotFound(_)) => {
            Err(api_error(StatusCode::NOT_FOUND, format!("Session not found: {}", id)))
        }
        Err(e) => {
            error!("Failed to cancel job {}: {}", id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    match state.supervisor.current() {
        Some(session) => Json(json!(session)),
        None => Json(json!({ "state": "idle" })),
    }
}

/// Job events as SSE; the stream ends after the job's terminal event
pub async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.supervisor.subscribe();

    let events = stream::unfold((subscription, false), |(mut subscription, done)| async move {
        if done {
            return None;
        }
        let event = subscription.recv().await?;
        let terminal = event.is_terminal();
        Some((Ok(to_sse(&event)), (subscription, terminal)))
    });

    Sse::new(events).keep_alive(KeepAlive::new().interval(state.config.stream.keepalive_interval()))
}

fn to_sse(event: &StreamEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|e| {
        warn!("Failed to encode stream event {}: {}", event.sequence, e);
        Event::default().comment("encode error")
    })
}

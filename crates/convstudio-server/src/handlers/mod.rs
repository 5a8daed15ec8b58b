//! HTTP handlers

pub mod auth;
pub mod files;
pub mod health;
pub mod process;

pub use health::health;

use axum::{http::StatusCode, Json};
use serde_json::{json, Value};

/// Error response: status plus a JSON body with an `error` field
pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::{build_router, AppState};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use convstudio_core::{StudioConfig, WatchedRoot};
    use serde_json::Value;
    use tower::ServiceExt;

    pub struct TestApp {
        pub dir: tempfile::TempDir,
        pub state: AppState,
        pub router: Router,
    }

    /// App rooted in a temp dir, with `program` standing in for the agent
    pub fn app(program: &str) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StudioConfig::default();
        config.auth.config_dir = dir.path().join("claude");
        config.auth.api_key_env = "CONVSTUDIO_SERVER_TEST_UNSET".to_string();
        config.auth.helper_flag = None;
        config.supervisor.grace_period_ms = 200;
        config.agent.program = program.to_string();
        config.watcher.roots = vec![
            WatchedRoot::new("input", dir.path().join("input")),
            WatchedRoot::new("output", dir.path().join("output")),
        ];

        let state = AppState::new(config).unwrap();
        let router = build_router(state.clone());
        TestApp { dir, state, router }
    }

    pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    pub fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}

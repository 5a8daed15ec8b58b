//! Single-job process supervisor with auth-aware retry
//!
//! At most one session is active at a time. Each session runs in its own task:
//! it spawns the agent, streams its output through an [`OutputStreamRouter`],
//! restarts the agent after an authentication failure (bounded by
//! `max_retries`) and falls back to the baseline invocation when the agent
//! rejects the credential helper flag.

use crate::auth::AuthRefreshDaemon;
use crate::classify::{FailureClassifier, FailureKind};
use crate::config::{StreamConfig, SupervisorConfig};
use crate::error::{JobFailure, Result, SupervisorError};
use crate::hub::{EventHub, Subscription};
use crate::process::{
    exit_message, exit_parts, spawn_child, spawn_message, spawn_pumps, terminate, OutputStream,
    SpawnSpec, TailBuffer,
};
use crate::router::OutputStreamRouter;
use crate::types::{
    AuthStatus, EventKind, InvocationMode, ProcessSession, SessionState, StreamEvent,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

struct SessionShared {
    info: RwLock<ProcessSession>,
    cancel: CancellationToken,
    state_tx: watch::Sender<SessionState>,
}

impl SessionShared {
    fn new(session: ProcessSession) -> Self {
        let (state_tx, _) = watch::channel(session.state);
        Self {
            info: RwLock::new(session),
            cancel: CancellationToken::new(),
            state_tx,
        }
    }

    fn id(&self) -> String {
        self.info.read().id.clone()
    }

    fn state(&self) -> SessionState {
        self.info.read().state
    }

    fn set_state(&self, state: SessionState) {
        {
            let mut info = self.info.write();
            info.state = state;
            match state {
                SessionState::Running if info.started_at.is_none() => {
                    info.started_at = Some(Utc::now());
                }
                s if s.is_terminal() => {
                    info.ended_at = Some(Utc::now());
                    info.pid = None;
                }
                _ => {}
            }
        }
        self.state_tx.send_replace(state);
    }

    fn update(&self, f: impl FnOnce(&mut ProcessSession)) {
        f(&mut self.info.write());
    }
}

/// Handle to a started session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn id(&self) -> String {
        self.shared.id()
    }

    pub fn snapshot(&self) -> ProcessSession {
        self.shared.info.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Resolves once the session reaches a terminal state
    pub async fn wait(&self) -> SessionState {
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.shared.state();
            }
        }
    }
}

struct SupervisorInner {
    config: SupervisorConfig,
    keepalive: Duration,
    auth: Arc<AuthRefreshDaemon>,
    classifier: FailureClassifier,
    hub: EventHub<StreamEvent>,
    slot: Mutex<Option<Arc<SessionShared>>>,
}

/// Launches and supervises agent processes, one at a time
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        stream: &StreamConfig,
        auth: Arc<AuthRefreshDaemon>,
    ) -> Result<Self> {
        let classifier = FailureClassifier::from_config(&config)?;
        Ok(Self {
            inner: Arc::new(SupervisorInner {
                config,
                keepalive: stream.keepalive_interval(),
                auth,
                classifier,
                hub: EventHub::new(stream.subscriber_capacity),
                slot: Mutex::new(None),
            }),
        })
    }

    /// Start a job. Fails fast if another session is still active.
    pub fn start(&self, command: Vec<String>) -> std::result::Result<SessionHandle, SupervisorError> {
        if command.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(SupervisorError::InvalidCommand);
        }

        let shared = {
            let mut slot = self.inner.slot.lock();
            if let Some(existing) = slot.as_ref() {
                let info = existing.info.read();
                if info.state.is_active() {
                    return Err(SupervisorError::AlreadyRunning {
                        session_id: info.id.clone(),
                    });
                }
            }
            let shared = Arc::new(SessionShared::new(ProcessSession::new(command.clone())));
            *slot = Some(Arc::clone(&shared));
            shared
        };

        let session_id = shared.id();
        let router = Arc::new(OutputStreamRouter::new(
            session_id.clone(),
            self.inner.hub.clone(),
        ));
        router.publish(
            EventKind::Init,
            json!({ "session_id": session_id, "command": command }).into(),
        );

        tracing::info!("Starting session {}: {:?}", session_id, command);
        tokio::spawn(run_session(
            Arc::clone(&self.inner),
            Arc::clone(&shared),
            router,
        ));

        Ok(SessionHandle { shared })
    }

    /// Cancel a session and wait (bounded) for it to stop
    pub async fn cancel(&self, session_id: &str) -> std::result::Result<SessionState, SupervisorError> {
        let shared = {
            let slot = self.inner.slot.lock();
            match slot.as_ref() {
                Some(shared) if shared.info.read().id == session_id => Arc::clone(shared),
                _ => return Err(SupervisorError::SessionNotFound(session_id.to_string())),
            }
        };

        let state = shared.state();
        if state.is_terminal() {
            return Ok(state);
        }

        tracing::info!("Cancelling session {}", session_id);
        shared.cancel.cancel();

        let handle = SessionHandle { shared };
        let bound = self.inner.config.grace_period() + Duration::from_secs(1);
        match tokio::time::timeout(bound, handle.wait()).await {
            Ok(state) => Ok(state),
            Err(_) => {
                tracing::warn!("Session {} did not stop within {:?}", session_id, bound);
                Ok(handle.state())
            }
        }
    }

    /// Latest session, active or not
    pub fn current(&self) -> Option<ProcessSession> {
        self.inner
            .slot
            .lock()
            .as_ref()
            .map(|shared| shared.info.read().clone())
    }

    pub fn subscribe(&self) -> Subscription<StreamEvent> {
        self.inner.hub.subscribe()
    }

    pub fn hub(&self) -> &EventHub<StreamEvent> {
        &self.inner.hub
    }

    /// Cancel the active session and close the event stream
    pub async fn shutdown(&self) {
        let active = self
            .current()
            .filter(|session| session.state.is_active())
            .map(|session| session.id);
        if let Some(id) = active {
            if let Err(e) = self.cancel(&id).await {
                tracing::warn!("Failed to cancel session {} on shutdown: {}", id, e);
            }
        }
        self.inner.hub.close();
    }
}

struct Conclusion {
    state: SessionState,
    kind: EventKind,
    payload: serde_json::Value,
}

impl Conclusion {
    fn failed(payload: serde_json::Value) -> Self {
        Self {
            state: SessionState::Failed,
            kind: EventKind::Error,
            payload,
        }
    }
}

enum AttemptOutcome {
    Exited(ExitStatus),
    AuthFailure { signature: String },
    EnhancedRejected,
    SpawnFailed(std::io::Error),
    Cancelled,
    Lost(std::io::Error),
}

async fn run_session(
    inner: Arc<SupervisorInner>,
    shared: Arc<SessionShared>,
    router: Arc<OutputStreamRouter>,
) {
    let keepalive = router.spawn_keepalive(inner.keepalive);
    let conclusion = drive(&inner, &shared, &router).await;

    tracing::info!(
        "Session {} finished: {}",
        router.session_id(),
        conclusion.state
    );
    // Terminal event goes out before the slot frees up
    router.finish(conclusion.kind, conclusion.payload.into());
    shared.set_state(conclusion.state);
    keepalive.abort();
}

async fn drive(
    inner: &SupervisorInner,
    shared: &SessionShared,
    router: &OutputStreamRouter,
) -> Conclusion {
    if inner.auth.status().await.status != AuthStatus::Fresh {
        if let Err(e) = inner.auth.refresh_now().await {
            tracing::error!("Credential refresh before job failed: {}", e);
        }
    }

    let command = shared.info.read().command.clone();
    let program = command.first().cloned().unwrap_or_default();
    let mut mode = InvocationMode::Enhanced;
    let mut attempts: u32 = 0;
    let mut tail = TailBuffer::new(inner.config.stderr_tail_lines);

    loop {
        if shared.cancel.is_cancelled() {
            return cancelled();
        }

        let mut argv = command.clone();
        if mode == InvocationMode::Enhanced {
            match inner.auth.helper_args().await {
                Some(extra) => argv.extend(extra),
                None => mode = InvocationMode::Baseline,
            }
        }
        let spec = SpawnSpec {
            argv,
            env: inner.auth.child_env().await,
            working_dir: inner.config.working_dir.clone(),
        };

        attempts += 1;
        shared.update(|s| s.mode = mode);
        shared.set_state(SessionState::Running);
        tail.clear();

        match run_attempt(inner, shared, router, &spec, mode, &mut tail).await {
            AttemptOutcome::Exited(status) => {
                let retry_count = shared.info.read().retry_count;
                let (code, signal) = exit_parts(&status);
                if status.success() {
                    return Conclusion {
                        state: SessionState::Completed,
                        kind: EventKind::Complete,
                        payload: json!({
                            "exit_code": 0,
                            "attempts": attempts,
                            "retry_count": retry_count,
                        }),
                    };
                }
                let failure = JobFailure::ProcessExit { code, signal };
                tracing::warn!("Session {}: {}", router.session_id(), failure);
                return Conclusion::failed(json!({
                    "error": "process_exit",
                    "exit_code": code,
                    "signal": signal,
                    "message": exit_message(code, signal),
                    "detail": failure.to_string(),
                    "stderr_tail": tail.lines(),
                }));
            }
            AttemptOutcome::AuthFailure { signature } => {
                let retry_count = {
                    let mut info = shared.info.write();
                    info.retry_count += 1;
                    info.retry_count
                };
                shared.set_state(SessionState::Retrying);
                router.publish(
                    EventKind::Message,
                    json!({
                        "notice": "auth_retry",
                        "attempt": retry_count,
                        "signature": signature,
                    })
                    .into(),
                );
                if let Err(e) = inner.auth.refresh_now().await {
                    tracing::error!("Credential refresh after auth failure failed: {}", e);
                }

                if retry_count >= inner.config.max_retries {
                    let failure = JobFailure::AuthFailureDetected {
                        signature,
                        attempts,
                    };
                    tracing::error!("Session {}: {}", router.session_id(), failure);
                    return Conclusion::failed(json!({
                        "error": "auth_failed",
                        "message": failure.to_string(),
                        "retry_count": retry_count,
                        "stderr_tail": tail.lines(),
                    }));
                }
                tracing::info!(
                    "Session {}: retrying after auth failure ({}/{})",
                    router.session_id(),
                    retry_count,
                    inner.config.max_retries
                );
            }
            AttemptOutcome::EnhancedRejected => {
                tracing::warn!(
                    "Agent rejected the credential helper flag, falling back to baseline invocation"
                );
                mode = InvocationMode::Baseline;
                shared.set_state(SessionState::Retrying);
            }
            AttemptOutcome::SpawnFailed(source) => {
                let message = spawn_message(&program, &source);
                let failure = JobFailure::Spawn {
                    program: program.clone(),
                    source,
                };
                tracing::error!("Session {}: {}", router.session_id(), failure);
                return Conclusion::failed(json!({
                    "error": "spawn",
                    "message": message,
                    "detail": failure.to_string(),
                }));
            }
            AttemptOutcome::Cancelled => return cancelled(),
            AttemptOutcome::Lost(source) => {
                let failure = JobFailure::Io(source);
                tracing::error!("Session {}: {}", router.session_id(), failure);
                return Conclusion::failed(json!({
                    "error": "io",
                    "message": failure.to_string(),
                }));
            }
        }
    }
}

fn cancelled() -> Conclusion {
    Conclusion {
        state: SessionState::Cancelled,
        kind: EventKind::Error,
        payload: json!({ "error": "cancelled", "message": "Job cancelled" }),
    }
}

async fn run_attempt(
    inner: &SupervisorInner,
    shared: &SessionShared,
    router: &OutputStreamRouter,
    spec: &SpawnSpec,
    mode: InvocationMode,
    tail: &mut TailBuffer,
) -> AttemptOutcome {
    let mut child = match spawn_child(spec) {
        Ok(child) => child,
        Err(e) => return AttemptOutcome::SpawnFailed(e),
    };
    let pid = child.id();
    shared.update(|s| s.pid = pid);
    tracing::debug!("Spawned {:?} as pid {:?} ({:?})", spec.argv, pid, mode);

    let (tx, mut rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let _pumps = spawn_pumps(&mut child, tx);
    let grace = inner.config.grace_period();

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                if let Err(e) = terminate(&mut child, grace).await {
                    tracing::warn!("Failed to terminate cancelled child: {}", e);
                }
                return AttemptOutcome::Cancelled;
            }
            line = rx.recv() => {
                let Some(line) = line else { break };
                if line.stream == OutputStream::Stderr {
                    tail.push(&line.text);
                }
                match inner.classifier.classify(line.stream, &line.text) {
                    FailureKind::Unauthorized { signature } => {
                        tracing::warn!("Auth failure detected in agent output: {}", line.text);
                        if let Err(e) = terminate(&mut child, grace).await {
                            tracing::warn!("Failed to terminate child after auth failure: {}", e);
                        }
                        return AttemptOutcome::AuthFailure { signature };
                    }
                    FailureKind::EnhancedModeRejected if mode == InvocationMode::Enhanced => {
                        if let Err(e) = terminate(&mut child, grace).await {
                            tracing::warn!("Failed to terminate rejected child: {}", e);
                        }
                        return AttemptOutcome::EnhancedRejected;
                    }
                    _ => {
                        router.route_line(&line.text);
                    }
                }
            }
        }
    }

    tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {
            if let Err(e) = terminate(&mut child, grace).await {
                tracing::warn!("Failed to terminate cancelled child: {}", e);
            }
            AttemptOutcome::Cancelled
        }
        status = child.wait() => match status {
            Ok(status) => AttemptOutcome::Exited(status),
            Err(e) => AttemptOutcome::Lost(e),
        },
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::AuthConfig;

    struct Fixture {
        _dir: tempfile::TempDir,
        supervisor: ProcessSupervisor,
    }

    fn fixture(enhanced: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut auth_config = AuthConfig::in_dir(dir.path());
        auth_config.api_key_env = "CONVSTUDIO_SUPERVISOR_TEST_UNSET".to_string();
        if !enhanced {
            auth_config.helper_flag = None;
        }
        std::fs::write(auth_config.api_key_path(), "sk-test").unwrap();

        let config = SupervisorConfig {
            grace_period_ms: 200,
            ..SupervisorConfig::default()
        };
        let stream = StreamConfig {
            keepalive_interval_secs: 60,
            ..StreamConfig::default()
        };
        let auth = Arc::new(AuthRefreshDaemon::new(auth_config));
        let supervisor = ProcessSupervisor::new(config, &stream, auth).unwrap();
        Fixture {
            _dir: dir,
            supervisor,
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    async fn until_terminal(sub: &mut Subscription<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(15), sub.recv())
                .await
                .expect("timed out waiting for events")
                .expect("hub closed");
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    fn kinds(events: &[StreamEvent]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    fn assert_gapless(events: &[StreamEvent]) {
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=events.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_successful_job_streams_init_message_complete() {
        let f = fixture(false);
        let mut sub = f.supervisor.subscribe();
        let handle = f.supervisor.start(sh("echo ok")).unwrap();

        let events = until_terminal(&mut sub).await;
        assert_eq!(
            kinds(&events),
            vec![EventKind::Init, EventKind::Message, EventKind::Complete]
        );
        assert_eq!(
            events[0].content.as_structured().unwrap()["session_id"],
            handle.id()
        );
        assert_eq!(events[1].content.as_text(), Some("ok"));
        assert_eq!(events[2].content.as_structured().unwrap()["exit_code"], 0);
        assert_gapless(&events);

        assert_eq!(handle.wait().await, SessionState::Completed);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.retry_count, 0);
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.ended_at.is_some());
        assert_eq!(snapshot.pid, None);
    }

    #[tokio::test]
    async fn test_status_codes_in_progress_output_are_not_auth_failures() {
        let f = fixture(false);
        let mut sub = f.supervisor.subscribe();
        let handle = f
            .supervisor
            .start(sh("echo 'Converted 403 files'; echo 'skipped 401 modules' >&2; echo done"))
            .unwrap();

        let events = until_terminal(&mut sub).await;
        assert_eq!(handle.wait().await, SessionState::Completed);
        assert_eq!(handle.snapshot().retry_count, 0);
        assert!(events
            .iter()
            .any(|e| e.content.as_text() == Some("Converted 403 files")));
        assert!(events.iter().any(|e| e.content.as_text() == Some("done")));
    }

    #[tokio::test]
    async fn test_agent_init_record_does_not_repeat_init() {
        let f = fixture(false);
        let mut sub = f.supervisor.subscribe();
        f.supervisor
            .start(sh(
                r#"echo '{"type":"system","subtype":"init","session_id":"agent-1234"}'; echo ok"#,
            ))
            .unwrap();

        let events = until_terminal(&mut sub).await;
        let inits = events.iter().filter(|e| e.kind == EventKind::Init).count();
        assert_eq!(inits, 1);
        assert_eq!(events[0].kind, EventKind::Init);
        assert_eq!(
            events[1].content.as_structured().unwrap()["record_type"],
            "init"
        );
    }

    #[tokio::test]
    async fn test_auth_failures_retry_then_succeed() {
        let f = fixture(false);
        let counter = f._dir.path().join("attempts");
        let script = format!(
            "n=$(cat '{c}' 2>/dev/null || echo 0); n=$((n+1)); echo $n > '{c}'; \
             if [ $n -le 2 ]; then echo '{{\"type\":\"error\",\"content\":\"401 Unauthorized\"}}'; sleep 5; exit 1; fi; \
             echo converted",
            c = counter.display()
        );

        let mut sub = f.supervisor.subscribe();
        let handle = f.supervisor.start(sh(&script)).unwrap();
        let events = until_terminal(&mut sub).await;

        assert_eq!(handle.wait().await, SessionState::Completed);
        assert_eq!(handle.snapshot().retry_count, 2);

        let notices: Vec<_> = events
            .iter()
            .filter_map(|e| e.content.as_structured())
            .filter(|c| c["notice"] == "auth_retry")
            .map(|c| c["attempt"].as_u64().unwrap())
            .collect();
        assert_eq!(notices, vec![1, 2]);
        assert!(events.iter().any(|e| e.content.as_text() == Some("converted")));

        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Complete);
        assert_eq!(last.content.as_structured().unwrap()["retry_count"], 2);
        assert_eq!(last.content.as_structured().unwrap()["attempts"], 3);
        assert_gapless(&events);
    }

    #[tokio::test]
    async fn test_auth_failures_exhaust_retries() {
        let f = fixture(false);
        let mut sub = f.supervisor.subscribe();
        let handle = f
            .supervisor
            .start(sh("echo 'Error: Invalid API key' >&2; sleep 5"))
            .unwrap();

        let events = until_terminal(&mut sub).await;
        assert_eq!(handle.wait().await, SessionState::Failed);
        assert_eq!(handle.snapshot().retry_count, 3);

        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].kind, EventKind::Error);
        assert_eq!(terminal[0].content.as_structured().unwrap()["error"], "auth_failed");

        // Nothing follows the terminal event
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_active() {
        let f = fixture(false);
        let first = f.supervisor.start(sh("sleep 30")).unwrap();

        match f.supervisor.start(sh("echo second")) {
            Err(SupervisorError::AlreadyRunning { session_id }) => {
                assert_eq!(session_id, first.id())
            }
            other => panic!("expected AlreadyRunning, got {:?}", other.map(|h| h.id())),
        }

        assert_eq!(
            f.supervisor.cancel(&first.id()).await.unwrap(),
            SessionState::Cancelled
        );
        f.supervisor.start(sh("echo again")).unwrap().wait().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_job() {
        let f = fixture(false);
        let mut sub = f.supervisor.subscribe();
        let handle = f.supervisor.start(sh("echo started; sleep 30")).unwrap();

        loop {
            let event = sub.recv().await.unwrap();
            if event.content.as_text() == Some("started") {
                break;
            }
        }

        let state = f.supervisor.cancel(&handle.id()).await.unwrap();
        assert_eq!(state, SessionState::Cancelled);

        let events = until_terminal(&mut sub).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Error);
        assert_eq!(last.content.as_structured().unwrap()["error"], "cancelled");

        // Already terminal: no-op
        assert_eq!(
            f.supervisor.cancel(&handle.id()).await.unwrap(),
            SessionState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_kills_child_ignoring_sigterm() {
        let f = fixture(false);
        let mut sub = f.supervisor.subscribe();
        let handle = f
            .supervisor
            .start(sh("trap '' TERM; echo started; sleep 30"))
            .unwrap();

        loop {
            if sub.recv().await.unwrap().content.as_text() == Some("started") {
                break;
            }
        }

        let began = std::time::Instant::now();
        let state = f.supervisor.cancel(&handle.id()).await.unwrap();
        assert_eq!(state, SessionState::Cancelled);
        assert!(began.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_unknown_session() {
        let f = fixture(false);
        assert_eq!(
            f.supervisor.cancel("missing").await,
            Err(SupervisorError::SessionNotFound("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn test_rejected_helper_flag_falls_back_to_baseline() {
        let f = fixture(true);
        let script = "if [ \"$0\" = \"--api-key-helper\" ]; then \
                      echo \"error: unknown option '--api-key-helper'\" >&2; exit 1; fi; \
                      echo baseline-ok";

        let mut sub = f.supervisor.subscribe();
        let handle = f.supervisor.start(sh(script)).unwrap();
        let events = until_terminal(&mut sub).await;

        assert_eq!(handle.wait().await, SessionState::Completed);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.mode, InvocationMode::Baseline);
        assert_eq!(snapshot.retry_count, 0);
        assert!(events.iter().any(|e| e.content.as_text() == Some("baseline-ok")));
        assert_gapless(&events);
    }

    #[tokio::test]
    async fn test_enhanced_invocation_passes_helper() {
        let f = fixture(true);
        let mut sub = f.supervisor.subscribe();
        let handle = f
            .supervisor
            .start(sh("echo \"$0\"; echo \"$CONVSTUDIO_SUPERVISOR_TEST_UNSET\""))
            .unwrap();
        let events = until_terminal(&mut sub).await;

        assert_eq!(handle.snapshot().mode, InvocationMode::Enhanced);
        assert_eq!(events[1].content.as_text(), Some("--api-key-helper"));
        assert_eq!(events[2].content.as_text(), Some("sk-test"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_code_and_stderr() {
        let f = fixture(false);
        let mut sub = f.supervisor.subscribe();
        let handle = f
            .supervisor
            .start(sh("echo 'disk on fire' >&2; exit 3"))
            .unwrap();

        let events = until_terminal(&mut sub).await;
        assert_eq!(handle.wait().await, SessionState::Failed);

        let content = events.last().unwrap().content.as_structured().unwrap().clone();
        assert_eq!(content["error"], "process_exit");
        assert_eq!(content["exit_code"], 3);
        assert_eq!(content["stderr_tail"], json!(["disk on fire"]));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let f = fixture(false);
        let mut sub = f.supervisor.subscribe();
        let handle = f
            .supervisor
            .start(vec!["/nonexistent/convstudio-agent".to_string()])
            .unwrap();

        let events = until_terminal(&mut sub).await;
        assert_eq!(handle.wait().await, SessionState::Failed);
        let content = events.last().unwrap().content.as_structured().unwrap().clone();
        assert_eq!(content["error"], "spawn");
        assert!(content["message"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let f = fixture(false);
        assert!(matches!(
            f.supervisor.start(Vec::new()),
            Err(SupervisorError::InvalidCommand)
        ));
        assert!(f.supervisor.current().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_admit_one() {
        let f = fixture(false);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let supervisor = f.supervisor.clone();
            tasks.push(tokio::spawn(async move {
                supervisor.start(sh("sleep 2")).map(|h| h.id())
            }));
        }

        let mut started = Vec::new();
        for task in tasks {
            if let Ok(id) = task.await.unwrap() {
                started.push(id);
            }
        }
        assert_eq!(started.len(), 1);
        f.supervisor.cancel(&started[0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_closes() {
        let f = fixture(false);
        let mut sub = f.supervisor.subscribe();
        let handle = f.supervisor.start(sh("sleep 30")).unwrap();

        f.supervisor.shutdown().await;
        assert_eq!(handle.state(), SessionState::Cancelled);

        let events = until_terminal(&mut sub).await;
        assert_eq!(events.last().unwrap().kind, EventKind::Error);
        assert!(sub.recv().await.is_none());
    }
}

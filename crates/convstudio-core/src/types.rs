//! Core type definitions for Conversion Studio

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a supervised job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Running => "running",
            SessionState::Retrying => "retrying",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// Active sessions occupy the supervisor's single slot
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the external tool is invoked
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    /// Argv carries the credential helper flag
    Enhanced,
    /// Plain argv, for tool versions that reject the helper flag
    Baseline,
}

/// Snapshot of one job invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSession {
    pub id: String,
    pub command: Vec<String>,
    pub state: SessionState,
    pub retry_count: u32,
    pub pid: Option<u32>,
    pub mode: InvocationMode,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProcessSession {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command,
            state: SessionState::Pending,
            retry_count: 0,
            pid: None,
            mode: InvocationMode::Enhanced,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Kind of a job stream event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Init,
    Message,
    Error,
    Complete,
    Keepalive,
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Error | EventKind::Complete)
    }
}

/// Event content: nothing, raw text, or a structured record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    None,
    Text(String),
    Structured(serde_json::Value),
}

impl EventPayload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            EventPayload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            EventPayload::Structured(value) => Some(value),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for EventPayload {
    fn from(value: serde_json::Value) -> Self {
        EventPayload::Structured(value)
    }
}

impl From<String> for EventPayload {
    fn from(text: String) -> Self {
        EventPayload::Text(text)
    }
}

/// One record of a job's output stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub content: EventPayload,
    pub sequence: u64,
    pub session_id: String,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// A node of a directory snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTreeNode {
    pub name: String,
    /// Relative to the watched root, `/`-separated
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Modification time in seconds since the epoch (files only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<f64>,
    #[serde(default)]
    pub children: Vec<FileTreeNode>,
}

/// Record published on the file update channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileTreeEvent {
    FileTreeUpdate {
        folder_type: String,
        data: Vec<FileTreeNode>,
    },
}

impl FileTreeEvent {
    pub fn folder_type(&self) -> &str {
        match self {
            FileTreeEvent::FileTreeUpdate { folder_type, .. } => folder_type,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Uninitialized,
    Fresh,
    Stale,
    Failed,
}

/// Where the current credential came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialOrigin {
    Environment,
    File,
    Command,
    OAuth,
    Cache,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    OAuth,
    None,
}

/// Process-wide authentication state
#[derive(Clone, Serialize)]
pub struct AuthState {
    #[serde(skip)]
    pub credential: String,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub refresh_interval_secs: u64,
    pub helper_artifact_path: PathBuf,
    pub status: AuthStatus,
    pub origin: Option<CredentialOrigin>,
    pub auth_type: AuthType,
    pub last_error: Option<String>,
}

impl AuthState {
    pub fn new(refresh_interval_secs: u64, helper_artifact_path: PathBuf) -> Self {
        Self {
            credential: String::new(),
            last_refresh_at: None,
            refresh_interval_secs,
            helper_artifact_path,
            status: AuthStatus::Uninitialized,
            origin: None,
            auth_type: AuthType::None,
            last_error: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.credential.is_empty() && self.status == AuthStatus::Fresh
    }
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let credential = if self.credential.is_empty() {
            "<empty>"
        } else {
            "<redacted>"
        };
        f.debug_struct("AuthState")
            .field("credential", &credential)
            .field("last_refresh_at", &self.last_refresh_at)
            .field("refresh_interval_secs", &self.refresh_interval_secs)
            .field("helper_artifact_path", &self.helper_artifact_path)
            .field("status", &self.status)
            .field("origin", &self.origin)
            .field("auth_type", &self.auth_type)
            .field("last_error", &self.last_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_event_wire_shape() {
        let event = StreamEvent {
            kind: EventKind::Message,
            content: EventPayload::Text("hello".to_string()),
            sequence: 4,
            session_id: "s1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "message", "content": "hello", "sequence": 4, "session_id": "s1"})
        );

        let keepalive = StreamEvent {
            kind: EventKind::Keepalive,
            content: EventPayload::None,
            sequence: 5,
            session_id: "s1".to_string(),
        };
        assert_eq!(serde_json::to_value(&keepalive).unwrap()["content"], json!(null));
    }

    #[test]
    fn test_file_tree_event_wire_shape() {
        let event = FileTreeEvent::FileTreeUpdate {
            folder_type: "input".to_string(),
            data: vec![FileTreeNode {
                name: "a.txt".to_string(),
                path: "a.txt".to_string(),
                kind: NodeKind::File,
                size: Some(3),
                modified: None,
                children: Vec::new(),
            }],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "file_tree_update");
        assert_eq!(value["folder_type"], "input");
        assert_eq!(value["data"][0]["type"], "file");
        assert_eq!(value["data"][0]["size"], 3);
    }

    #[test]
    fn test_session_state_terminality() {
        assert!(SessionState::Retrying.is_active());
        assert!(SessionState::Pending.is_active());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(EventKind::Complete.is_terminal());
        assert!(!EventKind::Keepalive.is_terminal());
    }

    #[test]
    fn test_auth_state_never_leaks_credential() {
        let mut state = AuthState::new(240, PathBuf::from("/tmp/helper.sh"));
        state.credential = "sk-secret".to_string();
        assert!(!format!("{:?}", state).contains("sk-secret"));
        assert!(!serde_json::to_string(&state).unwrap().contains("sk-secret"));
    }
}

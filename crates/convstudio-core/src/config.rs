//! Configuration for Conversion Studio
//!
//! Every section is fully defaulted so a missing file or a partial one still
//! yields a usable configuration. The server layers a config file and
//! `STUDIO_*` environment variables on top of these defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default signature of an authentication failure reported by the agent CLI.
///
/// Status codes only count next to HTTP or error context, so a count such as
/// "403 files" is ordinary output.
pub const DEFAULT_AUTH_FAILURE_PATTERN: &str = r"(?i)(\b(http|status|error|code)\b[^\n\d]{0,12}\b40[13]\b|\b40[13] (unauthori[sz]ed|forbidden)\b|\bunauthori[sz]ed\b|auth(entication)? (failed|failure|error|required)|invalid (x-)?api[ -]key|(api[ -]key|token|credentials?) (has |have )?expired)";

/// Default signature of the agent CLI rejecting the helper flag
pub const DEFAULT_ENHANCED_REJECTION_PATTERN: &str =
    r#"(?i)(unknown|unrecognized|unexpected) (option|argument|flag)[^\n]*api-key-helper"#;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub supervisor: SupervisorConfig,
    pub stream: StreamConfig,
    pub watcher: WatcherConfig,
    pub agent: AgentConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Directory served as static fallback (the browser UI)
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            static_dir: None,
        }
    }
}

/// Credential resolution and refresh settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Seconds between refreshes; must stay below the tool's 5 minute threshold
    pub refresh_interval_secs: u64,
    /// Fixed configuration directory of the external tool (`~/.claude`)
    pub config_dir: PathBuf,
    pub api_key_env: String,
    pub api_key_file: String,
    pub helper_file: String,
    pub oauth_credentials_file: String,
    /// Flag passed to the tool in enhanced mode; `None` disables enhanced mode
    pub helper_flag: Option<String>,
    /// Optional helper command whose stdout is the credential
    pub credential_command: Option<Vec<String>>,
    pub credential_command_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 240,
            config_dir: default_config_dir(),
            api_key_env: "CLAUDE_API_KEY".to_string(),
            api_key_file: "api_key".to_string(),
            helper_file: "auth_helper.sh".to_string(),
            oauth_credentials_file: ".credentials.json".to_string(),
            helper_flag: Some("--api-key-helper".to_string()),
            credential_command: None,
            credential_command_timeout_secs: 10,
        }
    }
}

impl AuthConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn helper_path(&self) -> PathBuf {
        self.config_dir.join(&self.helper_file)
    }

    pub fn api_key_path(&self) -> PathBuf {
        self.config_dir.join(&self.api_key_file)
    }

    pub fn oauth_credentials_path(&self) -> PathBuf {
        self.config_dir.join(&self.oauth_credentials_file)
    }

    /// Configuration rooted at `dir`, used for sandboxes and tests
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            config_dir: dir.to_path_buf(),
            ..Self::default()
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

/// Process supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_retries: u32,
    /// Time between SIGTERM and SIGKILL when stopping a child
    pub grace_period_ms: u64,
    pub working_dir: Option<PathBuf>,
    pub auth_failure_pattern: String,
    pub enhanced_rejection_pattern: String,
    /// Number of trailing stderr lines attached to failure events
    pub stderr_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            grace_period_ms: 3000,
            working_dir: None,
            auth_failure_pattern: DEFAULT_AUTH_FAILURE_PATTERN.to_string(),
            enhanced_rejection_pattern: DEFAULT_ENHANCED_REJECTION_PATTERN.to_string(),
            stderr_tail_lines: 20,
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Event streaming settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub keepalive_interval_secs: u64,
    /// Per-subscriber queue bound
    pub subscriber_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 15,
            subscriber_capacity: 1024,
        }
    }
}

impl StreamConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// A directory tree published on the file update channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedRoot {
    /// Identifier sent as `folder_type` (`input`, `output`)
    pub id: String,
    pub path: PathBuf,
}

impl WatchedRoot {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

/// Directory watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    pub roots: Vec<WatchedRoot>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            roots: vec![
                WatchedRoot::new("input", "input"),
                WatchedRoot::new("output", "output"),
            ],
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// How a job query is turned into an agent invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub program: String,
    pub allowed_tools: String,
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            allowed_tools: "Read,Write,Bash".to_string(),
            extra_args: vec![
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
        }
    }
}

impl AgentConfig {
    /// Build the argv for a job query
    pub fn build_command(&self, query: &str) -> Vec<String> {
        let mut argv = vec![
            self.program.clone(),
            "-p".to_string(),
            query.to_string(),
            "--allowedTools".to_string(),
            self.allowed_tools.clone(),
        ];
        argv.extend(self.extra_args.iter().cloned());
        argv
    }
}

//! Error types for Conversion Studio

use thiserror::Error;

/// Credential resolution failure. Never fatal: the refresh daemon logs it and
/// tries again on the next tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credential could be resolved (tried: {tried})")]
    Unresolved { tried: String },
}

/// Errors surfaced synchronously by the process supervisor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("a job is already running (session {session_id})")]
    AlreadyRunning { session_id: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("command must contain at least a program name")]
    InvalidCommand,
}

/// Terminal failure of a job attempt, rendered into the session's `Error` event.
#[derive(Error, Debug)]
pub enum JobFailure {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("authentication failure persisted after {attempts} attempts: {signature}")]
    AuthFailureDetected { signature: String, attempts: u32 },

    #[error("process exited with {}", describe_exit(.code, .signal))]
    ProcessExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("lost track of the child process: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "unknown status".to_string(),
    }
}

/// Main error type for the core crate
#[derive(Error, Debug)]
pub enum StudioError {
    #[error("Invalid {name} pattern: {source}")]
    InvalidPattern {
        name: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Job(#[from] JobFailure),
}

pub type Result<T> = std::result::Result<T, StudioError>;

//! Credential lookup for the external tool

use crate::config::AuthConfig;
use crate::types::CredentialOrigin;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Credential value reported when the tool authenticates through its own OAuth login
pub const OAUTH_PLACEHOLDER: &str = "claude-oauth";

/// A place a credential may be found
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn origin(&self) -> CredentialOrigin;

    /// The credential, or `None` if this source has nothing usable
    async fn resolve(&self) -> Option<String>;
}

fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Credential from an environment variable
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl CredentialSource for EnvCredential {
    fn origin(&self) -> CredentialOrigin {
        CredentialOrigin::Environment
    }

    async fn resolve(&self) -> Option<String> {
        std::env::var(&self.var).ok().and_then(|v| normalize(&v))
    }
}

/// Credential stored in a file
pub struct FileCredential {
    path: PathBuf,
}

impl FileCredential {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialSource for FileCredential {
    fn origin(&self) -> CredentialOrigin {
        CredentialOrigin::File
    }

    async fn resolve(&self) -> Option<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => normalize(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("Failed to read credential file {:?}: {}", self.path, e);
                None
            }
        }
    }
}

/// Credential printed by a helper command
pub struct CommandCredential {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandCredential {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

#[async_trait]
impl CredentialSource for CommandCredential {
    fn origin(&self) -> CredentialOrigin {
        CredentialOrigin::Command
    }

    async fn resolve(&self) -> Option<String> {
        let (program, args) = self.argv.split_first()?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                normalize(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(Ok(output)) => {
                tracing::warn!(
                    "Credential command {} exited with {}",
                    program,
                    output.status
                );
                None
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to run credential command {}: {}", program, e);
                None
            }
            Err(_) => {
                tracing::warn!(
                    "Credential command {} timed out after {:?}",
                    program,
                    self.timeout
                );
                None
            }
        }
    }
}

/// OAuth login of the tool itself, detected by its credentials file
pub struct OAuthCredential {
    marker: PathBuf,
}

impl OAuthCredential {
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for OAuthCredential {
    fn origin(&self) -> CredentialOrigin {
        CredentialOrigin::OAuth
    }

    async fn resolve(&self) -> Option<String> {
        match tokio::fs::metadata(&self.marker).await {
            Ok(meta) if meta.is_file() => Some(OAUTH_PLACEHOLDER.to_string()),
            _ => None,
        }
    }
}

/// Sources in resolution order: environment, key file, helper command, OAuth login
pub fn default_sources(config: &AuthConfig) -> Vec<Box<dyn CredentialSource>> {
    let mut sources: Vec<Box<dyn CredentialSource>> = Vec::new();
    sources.push(Box::new(EnvCredential::new(config.api_key_env.clone())));
    sources.push(Box::new(FileCredential::new(config.api_key_path())));
    if let Some(argv) = config.credential_command.as_ref().filter(|a| !a.is_empty()) {
        sources.push(Box::new(CommandCredential::new(
            argv.clone(),
            Duration::from_secs(config.credential_command_timeout_secs),
        )));
    }
    sources.push(Box::new(OAuthCredential::new(
        config.oauth_credentials_path(),
    )));
    sources
}

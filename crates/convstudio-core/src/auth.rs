//! Background refresh of the external tool's credential
//!
//! The tool re-reads its credential helper whenever the helper file looks
//! stale, so the daemon keeps the file's modification time inside the refresh
//! interval and keeps the resolved credential cached for child processes.

use crate::config::AuthConfig;
use crate::credentials::{default_sources, CredentialSource, OAUTH_PLACEHOLDER};
use crate::error::AuthError;
use crate::types::{AuthState, AuthStatus, AuthType, CredentialOrigin};
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Keeps the tool authenticated for the lifetime of the server
pub struct AuthRefreshDaemon {
    config: AuthConfig,
    interval: Duration,
    sources: Vec<Box<dyn CredentialSource>>,
    state: Mutex<AuthState>,
    started: AtomicBool,
    timer_reset: Notify,
    shutdown: CancellationToken,
}

impl AuthRefreshDaemon {
    pub fn new(config: AuthConfig) -> Self {
        let sources = default_sources(&config);
        Self::with_sources(config, sources)
    }

    pub fn with_sources(config: AuthConfig, sources: Vec<Box<dyn CredentialSource>>) -> Self {
        let interval = config.refresh_interval();
        let state = AuthState::new(config.refresh_interval_secs, config.helper_path());
        Self {
            config,
            interval,
            sources,
            state: Mutex::new(state),
            started: AtomicBool::new(false),
            timer_reset: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the refresh interval (sub-second intervals for tests)
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self.state.get_mut().refresh_interval_secs = interval.as_secs();
        self
    }

    pub fn refresh_interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the refresh loop. Returns `false` if it was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Auth refresh daemon already running");
            return false;
        }

        let daemon = Arc::clone(self);
        tokio::spawn(async move { daemon.run().await });
        tracing::info!(
            "Started auth refresh daemon (every {:?}, helper {:?})",
            self.interval,
            self.config.helper_path()
        );
        true
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                // Manual refresh happened: restart the wait from now
                _ = self.timer_reset.notified() => continue,
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.refresh().await {
                        tracing::error!("Scheduled credential refresh failed: {}", e);
                    }
                }
            }
        }
        tracing::info!("Auth refresh daemon stopped");
    }

    /// Resolve the credential and refresh the helper artifact now
    pub async fn refresh_now(&self) -> Result<(), AuthError> {
        let result = self.refresh().await;
        self.timer_reset.notify_one();
        result
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;

        let (credential, origin) = match self.resolve().await {
            Some(found) => found,
            None if !state.credential.is_empty() => {
                tracing::warn!("No credential source resolved, reusing cached credential");
                (state.credential.clone(), CredentialOrigin::Cache)
            }
            None => {
                let err = AuthError::Unresolved {
                    tried: self.tried(),
                };
                state.last_error = Some(err.to_string());
                state.status = derive_status(&state, self.interval);
                return Err(err);
            }
        };

        state.auth_type = if credential == OAUTH_PLACEHOLDER {
            AuthType::OAuth
        } else {
            AuthType::ApiKey
        };
        state.credential = credential;
        state.origin = Some(origin);
        state.last_refresh_at = Some(Utc::now());
        state.last_error = None;

        let helper = state.helper_artifact_path.clone();
        let script = helper_script(&self.config);
        let written = tokio::task::spawn_blocking(move || refresh_helper(&helper, &script)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    "Failed to refresh helper {:?}: {}",
                    state.helper_artifact_path,
                    e
                );
                state.last_error = Some(format!("helper artifact: {}", e));
            }
            Err(e) => {
                tracing::warn!("Helper refresh task failed: {}", e);
                state.last_error = Some(format!("helper artifact: {}", e));
            }
        }

        state.status = derive_status(&state, self.interval);
        tracing::debug!("Refreshed credential from {:?}", origin);
        Ok(())
    }

    async fn resolve(&self) -> Option<(String, CredentialOrigin)> {
        for source in &self.sources {
            if let Some(credential) = source.resolve().await {
                return Some((credential, source.origin()));
            }
        }
        None
    }

    fn tried(&self) -> String {
        let mut names: Vec<String> = self
            .sources
            .iter()
            .map(|s| format!("{:?}", s.origin()).to_lowercase())
            .collect();
        names.push("cache".to_string());
        names.join(", ")
    }

    /// Snapshot of the auth state with a freshly derived status
    pub async fn status(&self) -> AuthState {
        let mut snapshot = self.state.lock().await.clone();
        snapshot.status = derive_status(&snapshot, self.interval);
        snapshot
    }

    /// Argv suffix for the enhanced invocation
    pub async fn helper_args(&self) -> Option<Vec<String>> {
        let flag = self.config.helper_flag.as_ref()?;
        let state = self.state.lock().await;
        if state.auth_type != AuthType::ApiKey {
            return None;
        }
        Some(vec![
            flag.clone(),
            state.helper_artifact_path.display().to_string(),
        ])
    }

    /// Environment injected into the child process
    pub async fn child_env(&self) -> Vec<(String, String)> {
        let state = self.state.lock().await;
        match state.auth_type {
            AuthType::ApiKey => vec![(self.config.api_key_env.clone(), state.credential.clone())],
            AuthType::OAuth | AuthType::None => Vec::new(),
        }
    }
}

fn derive_status(state: &AuthState, interval: Duration) -> AuthStatus {
    match state.last_refresh_at {
        None if state.last_error.is_some() => AuthStatus::Failed,
        None => AuthStatus::Uninitialized,
        Some(at) => {
            let age = (Utc::now() - at).to_std().unwrap_or(Duration::ZERO);
            if age < interval * 2 {
                AuthStatus::Fresh
            } else {
                AuthStatus::Stale
            }
        }
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The helper never embeds the secret; it reads the same places the daemon does
fn helper_script(config: &AuthConfig) -> String {
    let key_file = shell_quote(&config.api_key_path().display().to_string());
    let var = &config.api_key_env;
    format!(
        "#!/bin/sh\n\
         # Credential helper maintained by convstudio-server\n\
         if [ -n \"${{{var}}}\" ]; then\n\
         \x20   printf '%s\\n' \"${{{var}}}\"\n\
         elif [ -f {key_file} ]; then\n\
         \x20   cat {key_file}\n\
         else\n\
         \x20   exit 1\n\
         fi\n"
    )
}

/// Write the helper if missing, otherwise bump its modification time
fn refresh_helper(path: &Path, script: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        let file = std::fs::OpenOptions::new().append(true).open(path)?;
        file.set_modified(SystemTime::now())?;
        return Ok(());
    }

    std::fs::write(path, script)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    tracing::info!("Created credential helper at {:?}", path);
    Ok(())
}

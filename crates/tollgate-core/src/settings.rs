//! Settings contract.
//!
//! A fresh [`PolicySnapshot`] is fetched at every decision point. Sources
//! never fail: any error degrades to [`PolicySnapshot::default`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::policy::PolicySnapshot;

/// Default timeout for remote settings fetches.
pub const DEFAULT_SETTINGS_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings fetch errors.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings service could not be reached.
    #[error("settings service unreachable: {0}")]
    Unreachable(String),

    /// The settings service answered with an error status.
    #[error("settings service returned HTTP {0}")]
    Status(u16),

    /// The settings body could not be parsed.
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Source of policy snapshots.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Returns the current settings, or the safe default on failure.
    async fn fetch_settings(&self) -> PolicySnapshot;
}

/// Fixed settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticSettings {
    snapshot: PolicySnapshot,
}

impl StaticSettings {
    /// Creates a source that always returns the given snapshot.
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl SettingsSource for StaticSettings {
    async fn fetch_settings(&self) -> PolicySnapshot {
        self.snapshot
    }
}

/// Settings served as JSON by an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpSettings {
    /// Creates a source reading from the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: DEFAULT_SETTINGS_TIMEOUT,
        }
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetches the settings, surfacing errors.
    pub async fn try_fetch(&self) -> Result<PolicySnapshot, SettingsError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SettingsError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SettingsError::Status(response.status().as_u16()));
        }

        response
            .json::<PolicySnapshot>()
            .await
            .map_err(|e| SettingsError::Invalid(e.to_string()))
    }
}

#[async_trait]
impl SettingsSource for HttpSettings {
    async fn fetch_settings(&self) -> PolicySnapshot {
        match self.try_fetch().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(url = %self.url, "Falling back to default settings: {}", e);
                PolicySnapshot::default()
            }
        }
    }
}

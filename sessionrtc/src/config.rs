//! Session configuration, presets and validation
//!
//! Configuration is supplied once when a session starts and is never
//! reloaded mid-session. Durations are carried as milliseconds in JSON.

use serde::{Deserialize, Serialize};
use sessionrtc_core::{ProviderKind, SessionError};
use sessionrtc_diagnostics::{MonitorConfig, RelayServerConfig, DEFAULT_PROBE_TIMEOUT};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Everything a session needs to know up front
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Relay servers probed by the reachability diagnostic
    pub relay_servers: Vec<RelayServerConfig>,
    /// Provider priority list, most preferred first
    pub providers: Vec<ProviderKind>,
    /// Extra attempts per provider after a transient failure
    pub max_retries: u32,
    /// Pause between retries of the same provider
    #[serde(rename = "retry_backoff_ms", with = "duration_ms")]
    pub retry_backoff: Duration,
    /// Timeout for a single provider attempt
    #[serde(rename = "attempt_timeout_ms", with = "duration_ms")]
    pub attempt_timeout: Duration,
    /// Per-server relay diagnostic timeout
    #[serde(rename = "diagnostic_timeout_ms", with = "duration_ms")]
    pub diagnostic_timeout: Duration,
    /// How long quality may stay degraded before reconnecting
    #[serde(rename = "degradation_grace_ms", with = "duration_ms")]
    pub degradation_grace: Duration,
    /// Quality sampling period
    #[serde(rename = "monitor_interval_ms", with = "duration_ms")]
    pub monitor_interval: Duration,
    /// Cap for the backed-off sampling period
    #[serde(rename = "monitor_max_backoff_ms", with = "duration_ms")]
    pub monitor_max_backoff: Duration,
    /// Bound on releasing resources when the session ends
    #[serde(rename = "shutdown_timeout_ms", with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Publish audio on connect
    pub audio_enabled: bool,
    /// Publish video on connect
    pub video_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_servers: Vec::new(),
            providers: vec![
                ProviderKind::DirectP2p,
                ProviderKind::RelayedP2p,
                ProviderKind::HostedFallback,
            ],
            max_retries: 2,
            retry_backoff: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(12),
            diagnostic_timeout: DEFAULT_PROBE_TIMEOUT,
            degradation_grace: Duration::from_secs(15),
            monitor_interval: Duration::from_secs(30),
            monitor_max_backoff: Duration::from_secs(240),
            shutdown_timeout: Duration::from_secs(2),
            audio_enabled: true,
            video_enabled: true,
        }
    }
}

impl SessionConfig {
    /// Settings tuned for mobile links (slower handshakes, sparser sampling)
    pub fn mobile() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(15),
            monitor_interval: Duration::from_secs(60),
            monitor_max_backoff: Duration::from_secs(480),
            ..Self::default()
        }
    }

    /// Settings tuned for wired desktop clients
    pub fn desktop() -> Self {
        Self {
            max_retries: 1,
            attempt_timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// Start a fluent builder from the defaults
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SessionError::configuration("json", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SessionError::configuration("path", format!("{}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Render as pretty JSON
    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SessionError::configuration("json", e.to_string()))
    }

    /// Reject configurations the session cannot run with
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.providers.is_empty() {
            return Err(SessionError::configuration(
                "providers",
                "provider priority list is empty",
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider) {
                return Err(SessionError::configuration(
                    "providers",
                    format!("{} listed more than once", provider),
                ));
            }
        }

        for server in &self.relay_servers {
            server.validate()?;
        }

        let timeouts = [
            ("attempt_timeout", self.attempt_timeout),
            ("diagnostic_timeout", self.diagnostic_timeout),
            ("degradation_grace", self.degradation_grace),
            ("monitor_interval", self.monitor_interval),
            ("shutdown_timeout", self.shutdown_timeout),
        ];
        for (field, value) in timeouts {
            if value.is_zero() {
                return Err(SessionError::configuration(field, "must be greater than zero"));
            }
        }

        if self.monitor_max_backoff < self.monitor_interval {
            return Err(SessionError::configuration(
                "monitor_max_backoff",
                "must not be shorter than monitor_interval",
            ));
        }

        Ok(())
    }

    /// Quality monitor settings derived from this configuration
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: self.monitor_interval,
            max_backoff: self.monitor_max_backoff,
            ..MonitorConfig::default()
        }
    }
}

/// Fluent builder for [`SessionConfig`]
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Add a relay server
    pub fn relay_server(mut self, server: RelayServerConfig) -> Self {
        self.config.relay_servers.push(server);
        self
    }

    /// Replace the provider priority list
    pub fn providers(mut self, providers: impl IntoIterator<Item = ProviderKind>) -> Self {
        self.config.providers = providers.into_iter().collect();
        self
    }

    /// Set the retry budget per provider
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the pause between retries
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    /// Set the provider attempt timeout
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.attempt_timeout = timeout;
        self
    }

    /// Set the relay diagnostic timeout
    pub fn diagnostic_timeout(mut self, timeout: Duration) -> Self {
        self.config.diagnostic_timeout = timeout;
        self
    }

    /// Set the degradation grace period
    pub fn degradation_grace(mut self, grace: Duration) -> Self {
        self.config.degradation_grace = grace;
        self
    }

    /// Set the quality sampling period
    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.config.monitor_interval = interval;
        if self.config.monitor_max_backoff < interval {
            self.config.monitor_max_backoff = interval * 8;
        }
        self
    }

    /// Set the backoff cap for the sampling period
    pub fn monitor_max_backoff(mut self, cap: Duration) -> Self {
        self.config.monitor_max_backoff = cap;
        self
    }

    /// Set the shutdown bound
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Publish audio on connect
    pub fn audio(mut self, enabled: bool) -> Self {
        self.config.audio_enabled = enabled;
        self
    }

    /// Publish video on connect
    pub fn video(mut self, enabled: bool) -> Self {
        self.config.video_enabled = enabled;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<SessionConfig, SessionError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

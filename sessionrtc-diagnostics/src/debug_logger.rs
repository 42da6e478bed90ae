//! Structured logging initialisation

use serde::{Deserialize, Serialize};
use sessionrtc_core::SessionError;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Logging setup
///
/// `RUST_LOG` takes precedence over [`LoggingConfig::default_directive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub default_directive: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Include the event target (module path)
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            json: false,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Verbose output for local debugging
    pub fn verbose() -> Self {
        Self {
            default_directive: "debug".to_string(),
            ..Self::default()
        }
    }

    /// JSON lines for log shipping
    pub fn json() -> Self {
        Self {
            json: true,
            ..Self::default()
        }
    }

    fn filter(&self) -> Result<EnvFilter, SessionError> {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.default_directive))
            .map_err(|e| {
                SessionError::configuration(
                    "logging.default_directive",
                    format!("invalid filter directive {:?}: {}", self.default_directive, e),
                )
            })
    }
}

/// Install the global tracing subscriber
///
/// Fails if the directive is invalid or a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), SessionError> {
    let filter = config.filter()?;

    let result = if config.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .try_init()
    };

    result.map_err(|e| SessionError::configuration("logging", e.to_string()))
}

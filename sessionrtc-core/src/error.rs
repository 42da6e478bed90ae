//! Error types for session RTC

use crate::transport::ProviderKind;
use std::time::Duration;
use thiserror::Error;

/// Main error type for session orchestration
///
/// Only [`SessionError::Configuration`] and [`SessionError::TransportExhausted`]
/// ever reach the caller as errors. Every other variant is absorbed internally
/// and drives retries or state transitions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Invalid configuration (bad relay credentials, empty provider list, ...)
    #[error("Configuration error in {field}: {reason}")]
    Configuration {
        /// Configuration field at fault
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// A single quality or diagnostic probe failed
    #[error("Probe {probe} failed: {reason}")]
    ProbeFailure {
        /// Probe name
        probe: String,
        /// Reason for the failure
        reason: String,
    },

    /// One transport provider failed to connect
    #[error("Provider {provider} attempt failed: {reason}")]
    ProviderAttempt {
        /// Provider that failed
        provider: ProviderKind,
        /// Reason for the failure
        reason: String,
        /// Whether retrying the same provider may help
        transient: bool,
    },

    /// Every provider has been tried and none connected
    #[error("All transport providers failed after {attempts} attempts")]
    TransportExhausted {
        /// Number of recorded attempts
        attempts: usize,
        /// Suggested action to resolve the issue
        suggested_action: String,
    },

    /// Quality stayed poor past the degradation grace period
    #[error("Connection degraded for {elapsed:?}")]
    DegradationTimeout {
        /// How long the session stayed degraded
        elapsed: Duration,
    },

    /// Transport-level I/O error
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for transport error
        reason: String,
    },

    /// Operation timed out
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Duration after which timeout occurred
        duration: Duration,
    },

    /// Rejected session state transition
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Phase the session was in
        from: String,
        /// Phase that was requested
        to: String,
    },

    /// The media capture collaborator has no usable device
    #[error("No media device available: {reason}")]
    NoDeviceAvailable {
        /// Reason reported by the capture collaborator
        reason: String,
    },

    /// The session has already ended
    #[error("Session {session_id} has ended")]
    SessionEnded {
        /// Session identifier
        session_id: String,
    },
}

impl SessionError {
    /// Shorthand for a configuration error
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SessionError::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            SessionError::Configuration { .. } => "CONFIGURATION_ERROR".to_string(),
            SessionError::ProbeFailure { .. } => "PROBE_FAILURE".to_string(),
            SessionError::ProviderAttempt { .. } => "PROVIDER_ATTEMPT_FAILURE".to_string(),
            SessionError::TransportExhausted { .. } => "TRANSPORT_EXHAUSTED".to_string(),
            SessionError::DegradationTimeout { .. } => "DEGRADATION_TIMEOUT".to_string(),
            SessionError::Transport { .. } => "TRANSPORT_ERROR".to_string(),
            SessionError::Timeout { .. } => "TIMEOUT".to_string(),
            SessionError::InvalidTransition { .. } => "INVALID_TRANSITION".to_string(),
            SessionError::NoDeviceAvailable { .. } => "NO_DEVICE_AVAILABLE".to_string(),
            SessionError::SessionEnded { .. } => "SESSION_ENDED".to_string(),
        }
    }

    /// Whether this error is reported to the caller rather than absorbed
    pub fn is_caller_facing(&self) -> bool {
        matches!(
            self,
            SessionError::Configuration { .. } | SessionError::TransportExhausted { .. }
        )
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SessionError::ProviderAttempt { transient, .. } => *transient,
            SessionError::Transport { .. } | SessionError::Timeout { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configuration_and_exhaustion_are_caller_facing() {
        assert!(SessionError::configuration("providers", "empty").is_caller_facing());
        assert!(SessionError::TransportExhausted {
            attempts: 3,
            suggested_action: "check network".to_string(),
        }
        .is_caller_facing());

        assert!(!SessionError::ProbeFailure {
            probe: "latency".to_string(),
            reason: "timeout".to_string(),
        }
        .is_caller_facing());
        assert!(!SessionError::DegradationTimeout {
            elapsed: Duration::from_secs(15),
        }
        .is_caller_facing());
    }

    #[test]
    fn test_transient_classification() {
        let timeout = SessionError::Timeout {
            operation: "connect".to_string(),
            duration: Duration::from_secs(12),
        };
        assert!(timeout.is_transient());

        let refused = SessionError::ProviderAttempt {
            provider: ProviderKind::DirectP2p,
            reason: "peer refused".to_string(),
            transient: false,
        };
        assert!(!refused.is_transient());
        assert_eq!(refused.error_code(), "PROVIDER_ATTEMPT_FAILURE");
    }
}

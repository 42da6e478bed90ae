//! # Session RTC Diagnostics
//!
//! Network-facing diagnostics for the session orchestrator: the relay
//! reachability diagnostic, the periodic connection quality monitor and the
//! structured logging setup shared by all crates.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod candidate;
pub mod connection_analyzer;
pub mod debug_logger;
pub mod network_profiler;
pub mod relay_probe;
pub mod stun;

// Re-export main types
pub use candidate::{CandidateType, IceCandidate};
pub use connection_analyzer::LatencySeries;
pub use debug_logger::{init_logging, LoggingConfig};
pub use network_profiler::{
    CallbackId, MonitorConfig, NetworkProbe, QualityMonitor, QualitySample, StunNetworkProbe,
};
pub use relay_probe::{
    GatheringContext, NegotiationEngine, RelayCandidateResult, RelayDiagnostic, RelayReport,
    RelayServerConfig, CONTEXT_CLOSE_TIMEOUT, DEFAULT_PROBE_TIMEOUT,
};

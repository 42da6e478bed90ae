//! # Session RTC Core
//!
//! Shared foundation for the session connectivity orchestrator: the error
//! taxonomy, the network quality model with its classification function, and
//! the transport provider abstraction with its concrete QUIC and WebSocket
//! implementations.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod quality;
pub mod transport;

// Re-export main types
pub use error::SessionError;
pub use quality::{
    classify, ConnectionType, NetworkConditions, QualityAssessment, QualityTier,
    TransportRecommendation, VideoQualityHint,
};
pub use transport::{
    ConnectRequest, ControlMessage, MediaStreamHandle, ProviderCapabilities, ProviderConnection,
    ProviderKind, QuicPeerConfig, QuicPeerProvider, TransportHandle, TransportProvider,
    TransportStats, WebSocketFallbackProvider,
};

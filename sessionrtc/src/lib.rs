//! # Session RTC - Connectivity Orchestration for Two-Party Calls
//!
//! Session RTC keeps a two-party real-time session connected. It measures the
//! network, verifies relay reachability, picks a transport provider and
//! switches to another one when quality stays poor for too long.
//!
//! ## Key Features
//!
//! - **Quality-aware provider choice**: the first quality tier reorders the
//!   provider priority list before connecting
//! - **Relay gating**: relay-dependent providers are skipped when no relay
//!   server answers
//! - **Graceful degradation**: poor quality gets a grace period before the
//!   session reconnects on the next provider
//! - **Race-free lifecycle**: one driver task owns the session state, and stale
//!   async results are discarded by revision
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sessionrtc::{ChannelObserver, Session, SessionConfig, SessionPhase};
//! use sessionrtc_core::{QuicPeerConfig, QuicPeerProvider, WebSocketFallbackProvider};
//! use sessionrtc_diagnostics::StunNetworkProbe;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let peer = QuicPeerConfig::new("203.0.113.7:4433".parse()?, "peer.example.com");
//!     let (observer, mut events) = ChannelObserver::new();
//!
//!     let session = Session::builder(SessionConfig::desktop())
//!         .participants("alice", "bob")
//!         .provider(Arc::new(QuicPeerProvider::direct(peer.clone())))
//!         .provider(Arc::new(QuicPeerProvider::relayed(peer)))
//!         .provider(Arc::new(WebSocketFallbackProvider::new("wss://calls.example.com/ws")))
//!         .network_probe(Arc::new(StunNetworkProbe::new("198.51.100.1:3478".parse()?)))
//!         .observer(Arc::new(observer))
//!         .start()?;
//!
//!     session.wait_for(SessionPhase::Connected).await?;
//!     while let Some(event) = events.next().await {
//!         println!("Session event: {:?}", event);
//!     }
//!
//!     session.end().await;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use sessionrtc_core::{
    MediaStreamHandle, NetworkConditions, ProviderKind, QualityTier, SessionError,
    TransportHandle, TransportProvider,
};

pub use sessionrtc_diagnostics::{
    init_logging, LoggingConfig, NegotiationEngine, NetworkProbe, RelayReport, RelayServerConfig,
};

// Public API modules
pub mod config;
pub mod controller;
pub mod event;
pub mod media;
pub mod session;

// Re-export main API types
pub use config::{SessionConfig, SessionConfigBuilder};
pub use controller::{AttemptOutcome, ProviderAttempt, ProviderChange, ProviderController};
pub use event::{ChannelObserver, Event, EventStream, NoopObserver, SessionObserver};
pub use media::{MediaSource, StaticMediaSource};
pub use session::{Session, SessionBuilder, SessionPhase, SessionState};

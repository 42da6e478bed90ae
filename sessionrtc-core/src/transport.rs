//! Transport providers and the opaque handles the orchestrator passes around
//!
//! Each concrete transport strategy implements [`TransportProvider`] and is
//! selected through its [`ProviderKind`]. The orchestrator never looks inside a
//! provider; it only sees [`TransportHandle`] and [`TransportStats`].

use crate::error::SessionError;
use async_trait::async_trait;
use futures::SinkExt;
use parking_lot::Mutex;
use quinn::{ClientConfig, Connection, Endpoint, VarInt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tungstenite::Message;
use uuid::Uuid;

/// Concrete transport strategies, in no particular priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Direct peer-to-peer path (best latency, needs NAT cooperation)
    DirectP2p,
    /// Peer-to-peer through a TURN-class relay
    RelayedP2p,
    /// Third-party hosted conferencing service
    HostedFallback,
}

impl ProviderKind {
    /// Capabilities a provider of this kind has unless it says otherwise
    pub fn default_capabilities(self) -> ProviderCapabilities {
        match self {
            ProviderKind::DirectP2p => ProviderCapabilities {
                requires_relay: false,
                low_bandwidth_capable: false,
            },
            ProviderKind::RelayedP2p => ProviderCapabilities {
                requires_relay: true,
                low_bandwidth_capable: false,
            },
            ProviderKind::HostedFallback => ProviderCapabilities {
                requires_relay: false,
                low_bandwidth_capable: true,
            },
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderKind::DirectP2p => "direct_p2p",
            ProviderKind::RelayedP2p => "relayed_p2p",
            ProviderKind::HostedFallback => "hosted_fallback",
        };
        f.write_str(label)
    }
}

/// What a provider needs from the network to work well
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Needs a reachable relay server
    pub requires_relay: bool,
    /// Keeps working on constrained links
    pub low_bandwidth_capable: bool,
}

/// Opaque reference to a local or remote media stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaStreamHandle {
    id: Uuid,
    label: String,
}

impl MediaStreamHandle {
    /// Create a handle with a fresh id
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
        }
    }

    /// Stream id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Human-readable label
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Everything a provider needs to join the two-party session
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Session identifier
    pub session_id: String,
    /// Local participant identifier
    pub local_participant: String,
    /// Remote participant identifier
    pub remote_participant: String,
    /// Local media to publish, if capture succeeded
    pub local_stream: Option<MediaStreamHandle>,
}

/// Result of a successful provider connect
#[derive(Debug, Clone)]
pub struct ProviderConnection {
    /// Remote media, once the provider has it
    pub remote_stream: Option<MediaStreamHandle>,
}

/// Opaque handle to the active transport
///
/// Owned by the provider controller; the session only compares and reports it.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    id: Uuid,
    provider: ProviderKind,
    remote_stream: Option<MediaStreamHandle>,
    established_at: Instant,
}

impl TransportHandle {
    /// Wrap a fresh provider connection
    pub fn new(provider: ProviderKind, connection: ProviderConnection) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            remote_stream: connection.remote_stream,
            established_at: Instant::now(),
        }
    }

    /// Handle id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Provider carrying this transport
    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// Remote media stream, if any
    pub fn remote_stream(&self) -> Option<&MediaStreamHandle> {
        self.remote_stream.as_ref()
    }

    /// Time since the transport was established
    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }
}

impl PartialEq for TransportHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TransportHandle {}

/// Provider-reported transport statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Smoothed round-trip time
    pub rtt: Option<Duration>,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Packet loss in percent
    pub loss_percent: Option<f64>,
}

/// Control frames providers send to the remote side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Sent once after the transport is up
    Hello {
        /// Session identifier
        session_id: String,
        /// Sending participant
        participant_id: String,
        /// Whether local media is attached
        has_media: bool,
    },
    /// Local audio mute state changed
    AudioEnabled {
        /// New state
        enabled: bool,
    },
    /// Local video mute state changed
    VideoEnabled {
        /// New state
        enabled: bool,
    },
}

impl ControlMessage {
    fn encode(&self) -> Result<Vec<u8>, SessionError> {
        serde_json::to_vec(self).map_err(|e| SessionError::Transport {
            reason: format!("Failed to encode control message: {}", e),
        })
    }
}

/// Trait for transport provider implementations
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Which strategy this provider implements
    fn kind(&self) -> ProviderKind;

    /// Network requirements of this provider
    fn capabilities(&self) -> ProviderCapabilities {
        self.kind().default_capabilities()
    }

    /// Establish the transport
    async fn connect(&self, request: &ConnectRequest) -> Result<ProviderConnection, SessionError>;

    /// Release the transport; must be safe to call when not connected
    async fn disconnect(&self) -> Result<(), SessionError>;

    /// Mute or unmute local audio
    async fn toggle_audio(&self, enabled: bool) -> Result<(), SessionError>;

    /// Pause or resume local video
    async fn toggle_video(&self, enabled: bool) -> Result<(), SessionError>;

    /// Current transport statistics
    async fn stats(&self) -> Result<TransportStats, SessionError>;
}

/// Configuration for a QUIC peer transport
#[derive(Debug, Clone)]
pub struct QuicPeerConfig {
    /// Peer (or relay-allocated) address
    pub remote_addr: SocketAddr,
    /// TLS server name presented by the peer
    pub server_name: String,
    /// Keep-alive interval
    pub keep_alive_interval: Duration,
    /// Maximum idle timeout
    pub max_idle_timeout: Duration,
}

impl QuicPeerConfig {
    /// Configuration with mobile-friendly keep-alive settings
    pub fn new(remote_addr: SocketAddr, server_name: impl Into<String>) -> Self {
        Self {
            remote_addr,
            server_name: server_name.into(),
            keep_alive_interval: Duration::from_secs(15),
            max_idle_timeout: Duration::from_secs(60),
        }
    }
}

struct QuicLink {
    endpoint: Endpoint,
    connection: Connection,
}

/// QUIC transport to the remote peer, either directly or through a relay
pub struct QuicPeerProvider {
    kind: ProviderKind,
    config: QuicPeerConfig,
    link: Mutex<Option<QuicLink>>,
}

impl fmt::Debug for QuicPeerProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicPeerProvider")
            .field("kind", &self.kind)
            .field("config", &self.config)
            .field("connected", &self.link.lock().is_some())
            .finish()
    }
}

impl QuicPeerProvider {
    /// Direct peer-to-peer provider
    pub fn direct(config: QuicPeerConfig) -> Self {
        Self {
            kind: ProviderKind::DirectP2p,
            config,
            link: Mutex::new(None),
        }
    }

    /// Provider that reaches the peer through a relay-allocated address
    pub fn relayed(config: QuicPeerConfig) -> Self {
        Self {
            kind: ProviderKind::RelayedP2p,
            config,
            link: Mutex::new(None),
        }
    }

    fn connection(&self) -> Result<Connection, SessionError> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.connection.clone())
            .ok_or_else(|| SessionError::Transport {
                reason: format!("{} transport is not connected", self.kind),
            })
    }

    async fn send_control(
        connection: &Connection,
        message: &ControlMessage,
    ) -> Result<(), SessionError> {
        let payload = message.encode()?;
        let mut send = connection
            .open_uni()
            .await
            .map_err(|e| SessionError::Transport {
                reason: format!("Failed to open control stream: {}", e),
            })?;
        send.write_all(&payload)
            .await
            .map_err(|e| SessionError::Transport {
                reason: format!("Failed to send control message: {}", e),
            })?;
        send.finish().map_err(|e| SessionError::Transport {
            reason: format!("Failed to finish control stream: {}", e),
        })?;
        Ok(())
    }
}

#[async_trait]
impl TransportProvider for QuicPeerProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<ProviderConnection, SessionError> {
        let crypto = rustls::crypto::aws_lc_rs::default_provider();
        let _ = rustls::crypto::CryptoProvider::install_default(crypto);

        let mut client_config = ClientConfig::with_platform_verifier();

        let idle_timeout = self.config.max_idle_timeout.try_into().map_err(|_| {
            SessionError::configuration("max_idle_timeout", "value exceeds QUIC idle limit")
        })?;
        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Some(idle_timeout));
        transport_config.keep_alive_interval(Some(self.config.keep_alive_interval));
        client_config.transport_config(Arc::new(transport_config));

        let bind_addr: SocketAddr = if self.config.remote_addr.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let mut endpoint = Endpoint::client(bind_addr).map_err(|e| SessionError::Transport {
            reason: format!("Failed to create QUIC endpoint: {}", e),
        })?;
        endpoint.set_default_client_config(client_config);

        debug!(
            provider = %self.kind,
            remote = %self.config.remote_addr,
            "Initiating QUIC connection"
        );

        let connecting = endpoint
            .connect(self.config.remote_addr, &self.config.server_name)
            .map_err(|e| SessionError::ProviderAttempt {
                provider: self.kind,
                reason: format!("Failed to initiate QUIC connection: {}", e),
                transient: false,
            })?;

        let connection = connecting.await.map_err(|e| SessionError::ProviderAttempt {
            provider: self.kind,
            reason: format!("QUIC connection failed: {}", e),
            transient: true,
        })?;

        Self::send_control(
            &connection,
            &ControlMessage::Hello {
                session_id: request.session_id.clone(),
                participant_id: request.local_participant.clone(),
                has_media: request.local_stream.is_some(),
            },
        )
        .await?;

        info!(
            provider = %self.kind,
            remote = %connection.remote_address(),
            "QUIC transport established"
        );

        *self.link.lock() = Some(QuicLink {
            endpoint,
            connection,
        });

        Ok(ProviderConnection {
            remote_stream: Some(MediaStreamHandle::new(format!(
                "remote:{}",
                request.remote_participant
            ))),
        })
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.connection.close(VarInt::from_u32(0), b"session ended");
            link.endpoint.close(VarInt::from_u32(0), b"session ended");
            debug!(provider = %self.kind, "QUIC transport closed");
        }
        Ok(())
    }

    async fn toggle_audio(&self, enabled: bool) -> Result<(), SessionError> {
        let connection = self.connection()?;
        Self::send_control(&connection, &ControlMessage::AudioEnabled { enabled }).await
    }

    async fn toggle_video(&self, enabled: bool) -> Result<(), SessionError> {
        let connection = self.connection()?;
        Self::send_control(&connection, &ControlMessage::VideoEnabled { enabled }).await
    }

    async fn stats(&self) -> Result<TransportStats, SessionError> {
        let stats = self.connection()?.stats();
        let loss_percent = if stats.path.sent_packets > 0 {
            Some(stats.path.lost_packets as f64 * 100.0 / stats.path.sent_packets as f64)
        } else {
            None
        };
        Ok(TransportStats {
            rtt: Some(stats.path.rtt),
            bytes_sent: stats.udp_tx.bytes,
            bytes_received: stats.udp_rx.bytes,
            loss_percent,
        })
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Hosted conferencing service reached over a WebSocket
pub struct WebSocketFallbackProvider {
    url: String,
    stream: tokio::sync::Mutex<Option<WsStream>>,
    bytes_sent: AtomicU64,
}

impl fmt::Debug for WebSocketFallbackProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketFallbackProvider")
            .field("url", &self.url)
            .field("bytes_sent", &self.bytes_sent.load(Ordering::Relaxed))
            .finish()
    }
}

impl WebSocketFallbackProvider {
    /// Provider for the service at `url` (`ws://` or `wss://`)
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: tokio::sync::Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
        }
    }

    fn session_url(&self, request: &ConnectRequest) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}session={}&participant={}",
            self.url, separator, request.session_id, request.local_participant
        )
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<(), SessionError> {
        let payload = message.encode()?;
        let len = payload.len() as u64;
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| SessionError::Transport {
            reason: "hosted fallback transport is not connected".to_string(),
        })?;
        stream
            .send(Message::Binary(payload))
            .await
            .map_err(|e| SessionError::Transport {
                reason: format!("Failed to send control message: {}", e),
            })?;
        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl TransportProvider for WebSocketFallbackProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::HostedFallback
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<ProviderConnection, SessionError> {
        let url = self.session_url(request);
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| {
            let transient = matches!(e, tungstenite::Error::Io(_));
            SessionError::ProviderAttempt {
                provider: ProviderKind::HostedFallback,
                reason: format!("WebSocket connection failed: {}", e),
                transient,
            }
        })?;

        *self.stream.lock().await = Some(ws_stream);

        self.send_control(&ControlMessage::Hello {
            session_id: request.session_id.clone(),
            participant_id: request.local_participant.clone(),
            has_media: request.local_stream.is_some(),
        })
        .await?;

        info!(url = %self.url, "Hosted fallback transport established");

        Ok(ProviderConnection {
            remote_stream: Some(MediaStreamHandle::new(format!(
                "remote:{}",
                request.remote_participant
            ))),
        })
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        let stream = self.stream.lock().await.take();
        if let Some(mut stream) = stream {
            if let Err(e) = stream.close(None).await {
                warn!("Hosted fallback close failed: {}", e);
            }
        }
        Ok(())
    }

    async fn toggle_audio(&self, enabled: bool) -> Result<(), SessionError> {
        self.send_control(&ControlMessage::AudioEnabled { enabled })
            .await
    }

    async fn toggle_video(&self, enabled: bool) -> Result<(), SessionError> {
        self.send_control(&ControlMessage::VideoEnabled { enabled })
            .await
    }

    async fn stats(&self) -> Result<TransportStats, SessionError> {
        Ok(TransportStats {
            rtt: None,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: 0,
            loss_percent: None,
        })
    }
}

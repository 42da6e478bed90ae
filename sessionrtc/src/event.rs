//! Caller-facing session callbacks and their channel adapter

use crate::session::SessionState;
use sessionrtc_core::{MediaStreamHandle, NetworkConditions, ProviderKind, QualityTier};
use tokio::sync::mpsc;
use tracing::debug;

/// Callbacks a caller supplies to observe a session
///
/// All methods are invoked from the session's driver task, one at a time and
/// never re-entrantly. None fire after the session reached `Ended`.
pub trait SessionObserver: Send + Sync {
    /// A lifecycle transition was applied
    fn on_state_change(&self, _state: &SessionState) {}

    /// The measured quality tier changed
    fn on_quality_change(&self, _tier: QualityTier, _conditions: &NetworkConditions) {}

    /// A provider took over the transport
    fn on_provider_changed(&self, _provider: ProviderKind, _reason: &str) {}

    /// Something went wrong; `recoverable == false` means the session failed
    fn on_error(&self, _message: &str, _recoverable: bool) {}

    /// Remote media became available
    fn on_remote_stream(&self, _stream: &MediaStreamHandle) {}

    /// Local media was acquired
    fn on_local_stream(&self, _stream: &MediaStreamHandle) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Session events, one per observer callback
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A lifecycle transition was applied
    StateChanged {
        /// New state
        state: SessionState,
    },
    /// The measured quality tier changed
    QualityChanged {
        /// New tier
        tier: QualityTier,
        /// Conditions that produced it
        conditions: NetworkConditions,
    },
    /// A provider took over the transport
    ProviderChanged {
        /// Provider now carrying the session
        provider: ProviderKind,
        /// Why the change happened
        reason: String,
    },
    /// An error was reported
    Error {
        /// Error message
        message: String,
        /// Whether the session keeps running
        recoverable: bool,
    },
    /// Remote media became available
    RemoteStream {
        /// Remote stream
        stream: MediaStreamHandle,
    },
    /// Local media was acquired
    LocalStream {
        /// Local stream
        stream: MediaStreamHandle,
    },
}

impl Event {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::StateChanged { .. } => "state_changed",
            Event::QualityChanged { .. } => "quality_changed",
            Event::ProviderChanged { .. } => "provider_changed",
            Event::Error { .. } => "error",
            Event::RemoteStream { .. } => "remote_stream",
            Event::LocalStream { .. } => "local_stream",
        }
    }

    /// Check if this is an error event
    pub fn is_error_event(&self) -> bool {
        matches!(self, Event::Error { .. })
    }

    /// Check if this is a media stream event
    pub fn is_stream_event(&self) -> bool {
        matches!(self, Event::RemoteStream { .. } | Event::LocalStream { .. })
    }
}

/// Stream of session events for async iteration
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Create a new event stream with a receiver
    pub fn new(receiver: mpsc::UnboundedReceiver<Event>) -> Self {
        Self { receiver }
    }

    /// Get the next event; `None` once the session is gone and drained
    pub async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Try to get the next event without blocking
    pub fn try_next(&mut self) -> Result<Option<Event>, mpsc::error::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(mpsc::error::TryRecvError::Disconnected)
            }
        }
    }

    /// Close the event stream
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Observer that forwards every callback into an [`EventStream`]
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelObserver {
    /// Create an observer and the stream it feeds
    pub fn new() -> (Self, EventStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, EventStream::new(receiver))
    }

    fn forward(&self, event: Event) {
        if self.sender.send(event).is_err() {
            debug!("Event stream dropped, discarding session event");
        }
    }
}

impl SessionObserver for ChannelObserver {
    fn on_state_change(&self, state: &SessionState) {
        self.forward(Event::StateChanged { state: *state });
    }

    fn on_quality_change(&self, tier: QualityTier, conditions: &NetworkConditions) {
        self.forward(Event::QualityChanged {
            tier,
            conditions: conditions.clone(),
        });
    }

    fn on_provider_changed(&self, provider: ProviderKind, reason: &str) {
        self.forward(Event::ProviderChanged {
            provider,
            reason: reason.to_string(),
        });
    }

    fn on_error(&self, message: &str, recoverable: bool) {
        self.forward(Event::Error {
            message: message.to_string(),
            recoverable,
        });
    }

    fn on_remote_stream(&self, stream: &MediaStreamHandle) {
        self.forward(Event::RemoteStream {
            stream: stream.clone(),
        });
    }

    fn on_local_stream(&self, stream: &MediaStreamHandle) {
        self.forward(Event::LocalStream {
            stream: stream.clone(),
        });
    }
}

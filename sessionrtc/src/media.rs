//! Local media capture boundary
//!
//! The session never picks devices or constraints. It asks a [`MediaSource`]
//! for a ready stream and treats [`SessionError::NoDeviceAvailable`] as a
//! signal to continue receive-only.

use async_trait::async_trait;
use sessionrtc_core::{MediaStreamHandle, SessionError};
use tracing::debug;

/// Supplies the local audio/video stream
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire a ready local stream
    async fn acquire(&self) -> Result<MediaStreamHandle, SessionError>;

    /// Give the stream back when the session ends
    async fn release(&self, _stream: &MediaStreamHandle) {}
}

/// Media source with a fixed outcome, for headless clients and tests
#[derive(Debug, Clone)]
pub struct StaticMediaSource {
    outcome: Result<String, String>,
}

impl StaticMediaSource {
    /// Always yields a fresh stream with `label`
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            outcome: Ok(label.into()),
        }
    }

    /// Always reports that no device is available
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            outcome: Err(reason.into()),
        }
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self) -> Result<MediaStreamHandle, SessionError> {
        match &self.outcome {
            Ok(label) => Ok(MediaStreamHandle::new(label.clone())),
            Err(reason) => Err(SessionError::NoDeviceAvailable {
                reason: reason.clone(),
            }),
        }
    }

    async fn release(&self, stream: &MediaStreamHandle) {
        debug!(stream = %stream.id(), "Released local stream {}", stream.label());
    }
}

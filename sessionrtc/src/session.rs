//! Session state machine
//!
//! A session is driven by one task that owns all lifecycle state. Everything
//! else (local setup, provider attempts, quality samples, the degradation
//! timer) runs in its own task and reports back over the driver's inbox. Each
//! report carries the revision it was started under. A report whose revision
//! is no longer current is dropped, so a slow result can never be applied
//! after a newer transition.
//!
//! Observer callbacks are only ever invoked by the driver, so they are
//! serialised and none fire once the session has ended.

use crate::config::SessionConfig;
use crate::controller::{ProviderAttempt, ProviderChange, ProviderController};
use crate::event::{NoopObserver, SessionObserver};
use crate::media::MediaSource;
use serde::Serialize;
use sessionrtc_core::{
    ConnectRequest, MediaStreamHandle, NetworkConditions, ProviderKind, QualityTier,
    SessionError, TransportHandle, TransportProvider, TransportStats,
};
use sessionrtc_diagnostics::{
    CallbackId, NegotiationEngine, NetworkProbe, QualityMonitor, QualitySample, RelayDiagnostic,
    RelayReport,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Consecutive degraded samples that move a connected session to `Degraded`
pub const DEGRADED_SAMPLES_THRESHOLD: u32 = 2;

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Acquiring media and the first quality assessment
    Initializing,
    /// Trying transport providers
    Connecting,
    /// Transport up, quality acceptable
    Connected,
    /// Transport up, quality poor
    Degraded,
    /// Switching to another provider
    Reconnecting,
    /// No provider could carry the session
    Failed,
    /// Ended by the caller
    Ended,
}

impl SessionPhase {
    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Initializing, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Degraded)
                | (Degraded, Connected)
                | (Degraded, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Connecting | Connected | Degraded | Reconnecting | Failed, Ended)
        )
    }

    /// No transition leaves this phase
    pub fn is_terminal(self) -> bool {
        self == SessionPhase::Ended
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Initializing => "initializing",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Connected => "connected",
            SessionPhase::Degraded => "degraded",
            SessionPhase::Reconnecting => "reconnecting",
            SessionPhase::Failed => "failed",
            SessionPhase::Ended => "ended",
        };
        f.write_str(label)
    }
}

/// Phase plus the revision that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionState {
    /// Current phase
    pub phase: SessionPhase,
    /// Incremented by exactly one on every applied transition
    pub revision: u64,
}

impl SessionState {
    /// State before any transition
    pub fn initial() -> Self {
        Self {
            phase: SessionPhase::Initializing,
            revision: 0,
        }
    }
}

/// Transition table, revision counter and quality bookkeeping
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: SessionState,
    degraded_streak: u32,
    last_sequence: u64,
    reported_tier: Option<QualityTier>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: SessionState::initial(),
            degraded_streak: 0,
            last_sequence: 0,
            reported_tier: None,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    pub(crate) fn is_current(&self, revision: u64) -> bool {
        self.state.revision == revision
    }

    /// Apply a transition, or reject it without touching any state
    pub(crate) fn apply(&mut self, next: SessionPhase) -> Result<SessionState, SessionError> {
        if !self.state.phase.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state.phase.to_string(),
                to: next.to_string(),
            });
        }
        self.state = SessionState {
            phase: next,
            revision: self.state.revision + 1,
        };
        self.degraded_streak = 0;
        Ok(self.state)
    }

    /// Accept only samples newer than every sample seen before
    pub(crate) fn accept_sample(&mut self, sequence: u64) -> bool {
        if sequence <= self.last_sequence {
            return false;
        }
        self.last_sequence = sequence;
        true
    }

    /// Whether `tier` differs from the last reported tier
    pub(crate) fn tier_changed(&mut self, tier: QualityTier) -> bool {
        if self.reported_tier == Some(tier) {
            return false;
        }
        self.reported_tier = Some(tier);
        true
    }

    /// Transition a quality sample asks for, if any
    pub(crate) fn quality_action(&mut self, tier: QualityTier) -> Option<SessionPhase> {
        match self.state.phase {
            SessionPhase::Connected if tier.is_degraded() => {
                self.degraded_streak += 1;
                (self.degraded_streak >= DEGRADED_SAMPLES_THRESHOLD)
                    .then_some(SessionPhase::Degraded)
            }
            SessionPhase::Connected => {
                self.degraded_streak = 0;
                None
            }
            SessionPhase::Degraded if tier >= QualityTier::Good => Some(SessionPhase::Connected),
            _ => None,
        }
    }
}

enum DriverMessage {
    Setup {
        revision: u64,
        local_stream: Result<Option<MediaStreamHandle>, SessionError>,
        sample: QualitySample,
    },
    Transport {
        revision: u64,
        result: Result<TransportHandle, SessionError>,
    },
    Sample(QualitySample),
    GraceExpired {
        revision: u64,
    },
    End {
        ack: oneshot::Sender<()>,
    },
}

/// Fluent builder for a [`Session`]
pub struct SessionBuilder {
    config: SessionConfig,
    session_id: String,
    local_participant: String,
    remote_participant: String,
    providers: Vec<Arc<dyn TransportProvider>>,
    probe: Option<Arc<dyn NetworkProbe>>,
    engine: Option<Arc<dyn NegotiationEngine>>,
    media: Option<Arc<dyn MediaSource>>,
    observer: Arc<dyn SessionObserver>,
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("session_id", &self.session_id)
            .field("providers", &self.providers.len())
            .field("has_probe", &self.probe.is_some())
            .field("has_engine", &self.engine.is_some())
            .field("has_media", &self.media.is_some())
            .finish()
    }
}

impl SessionBuilder {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            session_id: Uuid::new_v4().to_string(),
            local_participant: "local".to_string(),
            remote_participant: "remote".to_string(),
            providers: Vec::new(),
            probe: None,
            engine: None,
            media: None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Override the generated session id
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = id.into();
        self
    }

    /// Set both participant ids
    pub fn participants(mut self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.local_participant = local.into();
        self.remote_participant = remote.into();
        self
    }

    /// Register a transport provider implementation
    pub fn provider(mut self, provider: Arc<dyn TransportProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Probe used by the quality monitor (required)
    pub fn network_probe(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Engine used by the relay diagnostic
    pub fn negotiation_engine(mut self, engine: Arc<dyn NegotiationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Local media collaborator; without one the session is receive-only
    pub fn media_source(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    /// Caller callbacks
    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Validate everything and start the session driver
    ///
    /// Must be called from within a Tokio runtime. Only configuration errors
    /// are returned here; everything later is reported through the observer.
    pub fn start(self) -> Result<Session, SessionError> {
        self.config.validate()?;
        let probe = self.probe.ok_or_else(|| {
            SessionError::configuration("network_probe", "a network probe is required")
        })?;

        let diagnostic = self.engine.map(|engine| {
            Arc::new(RelayDiagnostic::new(engine).with_timeout(self.config.diagnostic_timeout))
        });
        let controller =
            ProviderController::new(self.config.clone(), self.providers, diagnostic.clone())?;
        let monitor = Arc::new(QualityMonitor::new(probe, self.config.monitor_config()));

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::initial());
        let provider_events = controller.subscribe();

        let driver = Driver {
            session_id: self.session_id.clone(),
            local_participant: self.local_participant,
            remote_participant: self.remote_participant,
            config: self.config,
            observer: self.observer,
            controller: controller.clone(),
            monitor: monitor.clone(),
            media: self.media,
            inbox: inbox_tx.clone(),
            state_tx,
            lifecycle: Lifecycle::new(),
            local_stream: None,
            monitor_callback: None,
            setup_task: None,
            operation_task: None,
            grace_task: None,
        };

        info!(session_id = %self.session_id, "Starting session");
        tokio::spawn(driver.run(inbox_rx, provider_events));

        Ok(Session {
            session_id: self.session_id,
            inbox: inbox_tx,
            state: state_rx,
            controller,
            monitor,
            diagnostic,
        })
    }
}

struct Driver {
    session_id: String,
    local_participant: String,
    remote_participant: String,
    config: SessionConfig,
    observer: Arc<dyn SessionObserver>,
    controller: ProviderController,
    monitor: Arc<QualityMonitor>,
    media: Option<Arc<dyn MediaSource>>,
    inbox: mpsc::UnboundedSender<DriverMessage>,
    state_tx: watch::Sender<SessionState>,
    lifecycle: Lifecycle,
    local_stream: Option<MediaStreamHandle>,
    monitor_callback: Option<CallbackId>,
    setup_task: Option<JoinHandle<()>>,
    operation_task: Option<JoinHandle<()>>,
    grace_task: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<DriverMessage>,
        mut provider_events: broadcast::Receiver<ProviderChange>,
    ) {
        self.spawn_setup();
        let mut provider_events_open = true;

        loop {
            tokio::select! {
                biased;

                change = provider_events.recv(), if provider_events_open => match change {
                    Ok(change) => self.observer.on_provider_changed(change.provider, &change.reason),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(session_id = %self.session_id, missed, "Provider changes dropped");
                    }
                    Err(RecvError::Closed) => provider_events_open = false,
                },

                message = inbox.recv() => {
                    match message {
                        Some(DriverMessage::End { ack }) => {
                            self.shutdown().await;
                            let _ = ack.send(());
                            break;
                        }
                        Some(message) => self.handle(message),
                        None => break,
                    }
                }
            }
        }
    }

    fn handle(&mut self, message: DriverMessage) {
        match message {
            DriverMessage::Setup {
                revision,
                local_stream,
                sample,
            } => self.on_setup(revision, local_stream, sample),
            DriverMessage::Transport { revision, result } => self.on_transport(revision, result),
            DriverMessage::Sample(sample) => self.on_sample(sample),
            DriverMessage::GraceExpired { revision } => self.on_grace_expired(revision),
            DriverMessage::End { .. } => {}
        }
    }

    fn transition(&mut self, next: SessionPhase) -> bool {
        let from = self.lifecycle.phase();
        match self.lifecycle.apply(next) {
            Ok(state) => {
                info!(
                    session_id = %self.session_id,
                    from = %from,
                    to = %state.phase,
                    revision = state.revision,
                    "Session state changed"
                );
                self.state_tx.send_replace(state);
                self.observer.on_state_change(&state);
                true
            }
            Err(e) => {
                error!(session_id = %self.session_id, "Invariant violation: {}", e);
                false
            }
        }
    }

    fn is_stale(&self, revision: u64, what: &str) -> bool {
        if self.lifecycle.is_current(revision) {
            return false;
        }
        debug!(
            session_id = %self.session_id,
            revision,
            current = self.lifecycle.state().revision,
            "Discarding stale {}",
            what
        );
        true
    }

    fn spawn_setup(&mut self) {
        let media = self.media.clone();
        let monitor = self.monitor.clone();
        let inbox = self.inbox.clone();
        let revision = self.lifecycle.state().revision;

        self.setup_task = Some(tokio::spawn(async move {
            let acquire = async {
                match &media {
                    Some(media) => media.acquire().await.map(Some),
                    None => Ok(None),
                }
            };
            let (local_stream, sample) = tokio::join!(acquire, monitor.sample());
            let _ = inbox.send(DriverMessage::Setup {
                revision,
                local_stream,
                sample,
            });
        }));
    }

    fn on_setup(
        &mut self,
        revision: u64,
        local_stream: Result<Option<MediaStreamHandle>, SessionError>,
        sample: QualitySample,
    ) {
        if self.is_stale(revision, "setup result") {
            return;
        }
        self.setup_task = None;

        match local_stream {
            Ok(Some(stream)) => {
                self.observer.on_local_stream(&stream);
                self.local_stream = Some(stream);
            }
            Ok(None) => debug!(session_id = %self.session_id, "No media source, receive-only"),
            Err(e) => {
                warn!(session_id = %self.session_id, "Local media unavailable: {}", e);
                self.observer
                    .on_error(&format!("{}; continuing receive-only", e), true);
            }
        }

        let hint = sample.tier();
        self.on_sample(sample);

        if self.transition(SessionPhase::Connecting) {
            self.spawn_connect(hint);
        }
    }

    fn spawn_connect(&mut self, hint: QualityTier) {
        let request = ConnectRequest {
            session_id: self.session_id.clone(),
            local_participant: self.local_participant.clone(),
            remote_participant: self.remote_participant.clone(),
            local_stream: self.local_stream.clone(),
        };
        let controller = self.controller.clone();
        let config = self.config.clone();
        let inbox = self.inbox.clone();
        let revision = self.lifecycle.state().revision;

        self.operation_task = Some(tokio::spawn(async move {
            let result = controller.connect(request, hint).await;
            if result.is_ok() {
                apply_media_preferences(&controller, &config).await;
            }
            let _ = inbox.send(DriverMessage::Transport { revision, result });
        }));
    }

    fn spawn_switch(&mut self, reason: String) {
        let controller = self.controller.clone();
        let config = self.config.clone();
        let inbox = self.inbox.clone();
        let revision = self.lifecycle.state().revision;

        self.operation_task = Some(tokio::spawn(async move {
            let result = controller.switch_provider(&reason).await;
            if result.is_ok() {
                apply_media_preferences(&controller, &config).await;
            }
            let _ = inbox.send(DriverMessage::Transport { revision, result });
        }));
    }

    fn on_transport(&mut self, revision: u64, result: Result<TransportHandle, SessionError>) {
        if self.is_stale(revision, "transport result") {
            return;
        }
        self.operation_task = None;

        match result {
            Ok(handle) => {
                if let Some(stream) = handle.remote_stream() {
                    self.observer.on_remote_stream(stream);
                }
                if self.transition(SessionPhase::Connected) {
                    self.ensure_monitoring();
                }
            }
            Err(e) => {
                error!(session_id = %self.session_id, "Transport failed: {}", e);
                self.observer.on_error(&e.to_string(), false);
                self.transition(SessionPhase::Failed);
                self.stop_monitoring();
            }
        }
    }

    fn on_sample(&mut self, sample: QualitySample) {
        if !self.lifecycle.accept_sample(sample.sequence) {
            debug!(
                session_id = %self.session_id,
                sequence = sample.sequence,
                "Discarding stale quality sample"
            );
            return;
        }

        let tier = sample.tier();
        if self.lifecycle.tier_changed(tier) {
            self.observer.on_quality_change(tier, &sample.conditions);
        }

        match self.lifecycle.quality_action(tier) {
            Some(SessionPhase::Degraded) => {
                if self.transition(SessionPhase::Degraded) {
                    self.spawn_grace_timer();
                }
            }
            Some(SessionPhase::Connected) => {
                self.cancel_grace_timer();
                self.transition(SessionPhase::Connected);
            }
            _ => {}
        }
    }

    fn spawn_grace_timer(&mut self) {
        let inbox = self.inbox.clone();
        let grace = self.config.degradation_grace;
        let revision = self.lifecycle.state().revision;

        self.cancel_grace_timer();
        self.grace_task = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = inbox.send(DriverMessage::GraceExpired { revision });
        }));
    }

    fn cancel_grace_timer(&mut self) {
        if let Some(task) = self.grace_task.take() {
            task.abort();
        }
    }

    fn on_grace_expired(&mut self, revision: u64) {
        if self.is_stale(revision, "grace timer") {
            return;
        }
        self.grace_task = None;

        let trigger = SessionError::DegradationTimeout {
            elapsed: self.config.degradation_grace,
        };
        warn!(session_id = %self.session_id, "{}, reconnecting", trigger);
        if self.transition(SessionPhase::Reconnecting) {
            self.spawn_switch(trigger.to_string());
        }
    }

    fn ensure_monitoring(&mut self) {
        if self.monitor_callback.is_some() {
            return;
        }
        let inbox = self.inbox.clone();
        self.monitor_callback = Some(self.monitor.start_monitoring(move |sample| {
            let _ = inbox.send(DriverMessage::Sample(sample.clone()));
        }));
    }

    fn stop_monitoring(&mut self) {
        if let Some(id) = self.monitor_callback.take() {
            self.monitor.unregister(id);
        }
    }

    async fn shutdown(&mut self) {
        for task in [
            self.setup_task.take(),
            self.operation_task.take(),
            self.grace_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.stop_monitoring();
        self.monitor.stop_monitoring();

        if self.lifecycle.phase() == SessionPhase::Initializing {
            // Setup was aborted; no negotiation is started on the way out
            self.transition(SessionPhase::Connecting);
        }
        if !self.lifecycle.phase().is_terminal() {
            self.transition(SessionPhase::Ended);
        }

        let controller = self.controller.clone();
        let media = self.media.clone();
        let local_stream = self.local_stream.take();
        let release = async move {
            controller.release().await;
            if let (Some(media), Some(stream)) = (media, local_stream) {
                media.release(&stream).await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, release)
            .await
            .is_err()
        {
            warn!(
                session_id = %self.session_id,
                "Resources not released within {:?}",
                self.config.shutdown_timeout
            );
        }
        info!(session_id = %self.session_id, "Session ended");
    }
}

async fn apply_media_preferences(controller: &ProviderController, config: &SessionConfig) {
    if !config.audio_enabled {
        if let Err(e) = controller.toggle_audio(false).await {
            warn!("Failed to mute audio: {}", e);
        }
    }
    if !config.video_enabled {
        if let Err(e) = controller.toggle_video(false).await {
            warn!("Failed to pause video: {}", e);
        }
    }
}

/// Handle to a running session
///
/// Dropping the handle ends the session.
pub struct Session {
    session_id: String,
    inbox: mpsc::UnboundedSender<DriverMessage>,
    state: watch::Receiver<SessionState>,
    controller: ProviderController,
    monitor: Arc<QualityMonitor>,
    diagnostic: Option<Arc<RelayDiagnostic>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("controller", &self.controller)
            .finish()
    }
}

impl Session {
    /// Start building a session
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Session id
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Current phase and revision
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session is in `phase`
    ///
    /// Fails with [`SessionError::SessionEnded`] if the session ends first.
    pub async fn wait_for(&self, phase: SessionPhase) -> Result<SessionState, SessionError> {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current.phase == phase {
                return Ok(current);
            }
            if current.phase.is_terminal() || state.changed().await.is_err() {
                return Err(self.ended());
            }
        }
    }

    /// Provider attempt history
    pub fn attempts(&self) -> Vec<ProviderAttempt> {
        self.controller.attempts()
    }

    /// Provider carrying the session, if connected
    pub fn active_provider(&self) -> Option<ProviderKind> {
        self.controller.active().map(|handle| handle.provider())
    }

    /// Most recently measured network conditions
    pub fn latest_conditions(&self) -> Option<NetworkConditions> {
        self.monitor.latest().map(|sample| sample.conditions)
    }

    /// Most recent relay diagnostic report
    pub fn relay_report(&self) -> Option<Arc<RelayReport>> {
        self.diagnostic.as_ref().and_then(|d| d.latest())
    }

    /// Mute or unmute local audio
    pub async fn toggle_audio(&self, enabled: bool) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.controller.toggle_audio(enabled).await
    }

    /// Pause or resume local video
    pub async fn toggle_video(&self, enabled: bool) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.controller.toggle_video(enabled).await
    }

    /// Statistics of the active transport
    pub async fn stats(&self) -> Result<TransportStats, SessionError> {
        self.ensure_live()?;
        self.controller.stats().await
    }

    /// End the session and wait until its resources are released
    ///
    /// Ending before setup finishes still reports `Connecting` then `Ended`,
    /// since `Ended` is only reachable from `Connecting` onwards. No provider
    /// is contacted in that case.
    ///
    /// Safe to call more than once.
    pub async fn end(&self) {
        let (ack, done) = oneshot::channel();
        if self.inbox.send(DriverMessage::End { ack }).is_ok() {
            let _ = done.await;
        }
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.state().phase.is_terminal() {
            return Err(self.ended());
        }
        Ok(())
    }

    fn ended(&self) -> SessionError {
        SessionError::SessionEnded {
            session_id: self.session_id.clone(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let (ack, _) = oneshot::channel();
        let _ = self.inbox.send(DriverMessage::End { ack });
    }
}

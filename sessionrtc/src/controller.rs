//! Transport provider controller
//!
//! The controller owns the provider registry, the active transport and the
//! attempt history. Providers are tried strictly in priority order. The order
//! is the configured list reordered (never filtered) by the latest quality
//! tier. Relay-dependent providers are gated on the relay diagnostic, and
//! transient failures are retried a bounded number of times.
//!
//! [`ProviderController::switch_provider`] is idempotent: while a switch is in
//! flight every caller awaits the same shared result, so only one negotiation
//! runs and only one [`ProviderChange`] is published.

use crate::config::SessionConfig;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use sessionrtc_core::{
    ConnectRequest, ProviderCapabilities, ProviderKind, QualityTier, SessionError,
    TransportHandle, TransportProvider, TransportRecommendation, TransportStats,
};
use sessionrtc_diagnostics::{RelayDiagnostic, CONTEXT_CLOSE_TIMEOUT};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Attempt-history reason recorded for skipped relay-dependent providers
pub const RELAY_UNREACHABLE: &str = "relay unreachable";

/// Provider-change reason for the first successful connect
pub const INITIAL_CONNECTION: &str = "initial connection";

/// Outcome of one provider attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Still negotiating
    Pending,
    /// Transport established
    Succeeded,
    /// Failed, timed out or skipped
    Failed,
}

/// One entry of the attempt history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderAttempt {
    /// Provider that was tried
    pub provider: ProviderKind,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// How it ended
    pub outcome: AttemptOutcome,
    /// Failure reason
    pub reason: Option<String>,
}

/// Published whenever a provider takes over the transport
#[derive(Debug, Clone)]
pub struct ProviderChange {
    /// Provider now carrying the session
    pub provider: ProviderKind,
    /// Why the change happened
    pub reason: String,
    /// The new transport
    pub handle: TransportHandle,
}

/// Reorder providers for a quality recommendation
///
/// The sort is stable, so providers that compare equal keep their configured
/// relative order.
pub fn prioritize(
    order: &[ProviderKind],
    capabilities: impl Fn(ProviderKind) -> ProviderCapabilities,
    recommendation: TransportRecommendation,
) -> Vec<ProviderKind> {
    let mut ordered = order.to_vec();
    match recommendation {
        TransportRecommendation::KeepOrder => {}
        TransportRecommendation::PreferDirect => ordered.sort_by_key(|kind| {
            let caps = capabilities(*kind);
            caps.requires_relay || caps.low_bandwidth_capable
        }),
        TransportRecommendation::PreferLowBandwidth => {
            ordered.sort_by_key(|kind| !capabilities(*kind).low_bandwidth_capable)
        }
    }
    ordered
}

/// Order for a switch away from `current`
///
/// Starts after `current`, wraps around, and leaves `current` for last, so
/// the provider being switched away from is retried only after every other
/// provider has failed.
pub fn switch_order(order: &[ProviderKind], current: Option<ProviderKind>) -> Vec<ProviderKind> {
    match current.and_then(|kind| order.iter().position(|k| *k == kind)) {
        Some(index) => order[index + 1..]
            .iter()
            .chain(order[..=index].iter())
            .copied()
            .collect(),
        None => order.to_vec(),
    }
}

type SwitchFuture = Shared<BoxFuture<'static, Result<TransportHandle, SessionError>>>;

struct InFlightSwitch {
    future: SwitchFuture,
    abort: AbortHandle,
}

#[derive(Default)]
struct ControllerState {
    request: Option<ConnectRequest>,
    order: Vec<ProviderKind>,
    active: Option<TransportHandle>,
    last_tried: Option<ProviderKind>,
    attempts: Vec<ProviderAttempt>,
    switch: Option<InFlightSwitch>,
}

struct ControllerInner {
    config: SessionConfig,
    providers: HashMap<ProviderKind, Arc<dyn TransportProvider>>,
    diagnostic: Option<Arc<RelayDiagnostic>>,
    state: Mutex<ControllerState>,
    events: broadcast::Sender<ProviderChange>,
}

/// Chooses, connects and switches transport providers
#[derive(Clone)]
pub struct ProviderController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for ProviderController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ProviderController")
            .field("order", &state.order)
            .field("active", &state.active.as_ref().map(|h| h.provider()))
            .field("attempts", &state.attempts.len())
            .field("switching", &state.switch.is_some())
            .finish()
    }
}

impl ProviderController {
    /// Build a controller over the given provider implementations
    ///
    /// Every provider named in `config.providers` must have an implementation.
    pub fn new(
        config: SessionConfig,
        providers: Vec<Arc<dyn TransportProvider>>,
        diagnostic: Option<Arc<RelayDiagnostic>>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let mut registry: HashMap<ProviderKind, Arc<dyn TransportProvider>> = HashMap::new();
        for provider in providers {
            let kind = provider.kind();
            if registry.insert(kind, provider).is_some() {
                return Err(SessionError::configuration(
                    "providers",
                    format!("more than one implementation registered for {}", kind),
                ));
            }
        }
        for kind in &config.providers {
            if !registry.contains_key(kind) {
                return Err(SessionError::configuration(
                    "providers",
                    format!("no implementation registered for {}", kind),
                ));
            }
        }

        let (events, _) = broadcast::channel(16);
        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                providers: registry,
                diagnostic,
                state: Mutex::new(ControllerState::default()),
                events,
            }),
        })
    }

    /// Receive provider changes published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderChange> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the attempt history
    pub fn attempts(&self) -> Vec<ProviderAttempt> {
        self.inner.state.lock().attempts.clone()
    }

    /// The active transport, if any
    pub fn active(&self) -> Option<TransportHandle> {
        self.inner.state.lock().active.clone()
    }

    /// Current priority order
    pub fn priority_order(&self) -> Vec<ProviderKind> {
        self.inner.state.lock().order.clone()
    }

    /// Whether a switch is in flight
    pub fn is_switching(&self) -> bool {
        self.inner.state.lock().switch.is_some()
    }

    /// Establish the first transport, trying providers in hint-adjusted order
    pub async fn connect(
        &self,
        request: ConnectRequest,
        hint: QualityTier,
    ) -> Result<TransportHandle, SessionError> {
        let inner = &self.inner;
        let order = prioritize(
            &inner.config.providers,
            |kind| inner.capabilities(kind),
            hint.recommendation(),
        );
        info!(
            session_id = %request.session_id,
            tier = %hint,
            order = ?order,
            "Connecting transport"
        );

        let previous = {
            let mut state = inner.state.lock();
            state.request = Some(request);
            state.order = order.clone();
            state.active.take()
        };
        if let Some(handle) = previous {
            inner.disconnect(handle.provider()).await;
        }

        inner.run_attempts(order, INITIAL_CONNECTION).await
    }

    /// Release the current transport and move to the next provider
    ///
    /// Providers are tried in [`switch_order`]: the released provider gets one
    /// last try after all the others, and only when that fails too does the
    /// switch report [`SessionError::TransportExhausted`].
    ///
    /// Concurrent calls share the in-flight switch and its result.
    pub async fn switch_provider(&self, reason: &str) -> Result<TransportHandle, SessionError> {
        let future = {
            let mut state = self.inner.state.lock();
            let in_flight = state
                .switch
                .as_ref()
                .filter(|in_flight| in_flight.future.peek().is_none())
                .map(|in_flight| in_flight.future.clone());
            match in_flight {
                Some(future) => {
                    debug!(reason, "Switch already in flight, joining it");
                    future
                }
                None => {
                    let inner = self.inner.clone();
                    let reason = reason.to_string();
                    let task = tokio::spawn(async move { inner.switch(reason).await });
                    let abort = task.abort_handle();
                    let future = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(SessionError::Transport {
                                reason: format!("provider switch cancelled: {}", e),
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    state.switch = Some(InFlightSwitch {
                        future: future.clone(),
                        abort,
                    });
                    future
                }
            }
        };

        let result = future.clone().await;

        let mut state = self.inner.state.lock();
        if state
            .switch
            .as_ref()
            .is_some_and(|in_flight| in_flight.future.ptr_eq(&future))
        {
            state.switch = None;
        }
        result
    }

    /// Abort any switch and disconnect the active transport
    ///
    /// Pending attempts are closed out as cancelled.
    pub async fn release(&self) {
        let (active, switch, interrupted) = {
            let mut state = self.inner.state.lock();
            let mut interrupted = Vec::new();
            for attempt in state
                .attempts
                .iter_mut()
                .filter(|a| a.outcome == AttemptOutcome::Pending)
            {
                attempt.outcome = AttemptOutcome::Failed;
                attempt.reason = Some("cancelled".to_string());
                interrupted.push(attempt.provider);
            }
            (state.active.take(), state.switch.take(), interrupted)
        };

        if let Some(switch) = switch {
            switch.abort.abort();
        }
        for kind in interrupted {
            self.inner.disconnect(kind).await;
        }
        if let Some(handle) = active {
            info!(provider = %handle.provider(), "Releasing transport");
            self.inner.disconnect(handle.provider()).await;
        }
    }

    /// Mute or unmute audio on the active transport
    pub async fn toggle_audio(&self, enabled: bool) -> Result<(), SessionError> {
        self.inner.active_provider()?.toggle_audio(enabled).await
    }

    /// Pause or resume video on the active transport
    pub async fn toggle_video(&self, enabled: bool) -> Result<(), SessionError> {
        self.inner.active_provider()?.toggle_video(enabled).await
    }

    /// Statistics of the active transport
    pub async fn stats(&self) -> Result<TransportStats, SessionError> {
        self.inner.active_provider()?.stats().await
    }
}

impl ControllerInner {
    fn capabilities(&self, kind: ProviderKind) -> ProviderCapabilities {
        self.providers
            .get(&kind)
            .map(|provider| provider.capabilities())
            .unwrap_or_else(|| kind.default_capabilities())
    }

    fn active_provider(&self) -> Result<Arc<dyn TransportProvider>, SessionError> {
        let kind = self
            .state
            .lock()
            .active
            .as_ref()
            .map(|handle| handle.provider())
            .ok_or_else(|| SessionError::Transport {
                reason: "no active transport".to_string(),
            })?;
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| SessionError::Transport {
                reason: format!("no implementation registered for {}", kind),
            })
    }

    async fn switch(self: Arc<Self>, reason: String) -> Result<TransportHandle, SessionError> {
        let (previous, order, last_tried) = {
            let mut state = self.state.lock();
            (state.active.take(), state.order.clone(), state.last_tried)
        };

        let current = previous.as_ref().map(|h| h.provider()).or(last_tried);
        if let Some(handle) = previous {
            info!(provider = %handle.provider(), "Releasing transport before switch");
            self.disconnect(handle.provider()).await;
        }

        let order = switch_order(&order, current);
        info!(reason = %reason, from = ?current, order = ?order, "Switching provider");
        self.run_attempts(order, &reason).await
    }

    async fn run_attempts(
        &self,
        order: Vec<ProviderKind>,
        reason: &str,
    ) -> Result<TransportHandle, SessionError> {
        let (request, first) = {
            let state = self.state.lock();
            (state.request.clone(), state.attempts.len())
        };
        let request = request.ok_or_else(|| {
            SessionError::configuration("request", "switch requested before connect")
        })?;

        for kind in order {
            let Some(provider) = self.providers.get(&kind).cloned() else {
                continue;
            };

            if provider.capabilities().requires_relay && !self.relay_available().await {
                warn!(provider = %kind, "Skipping provider: {}", RELAY_UNREACHABLE);
                let mut state = self.state.lock();
                state.attempts.push(ProviderAttempt {
                    provider: kind,
                    started_at: Utc::now(),
                    outcome: AttemptOutcome::Failed,
                    reason: Some(RELAY_UNREACHABLE.to_string()),
                });
                state.last_tried = Some(kind);
                continue;
            }

            self.state.lock().last_tried = Some(kind);
            if let Ok(handle) = self.attempt_with_retries(&provider, &request).await {
                self.state.lock().active = Some(handle.clone());
                info!(
                    session_id = %request.session_id,
                    provider = %kind,
                    reason,
                    "Transport established"
                );
                let _ = self.events.send(ProviderChange {
                    provider: kind,
                    reason: reason.to_string(),
                    handle: handle.clone(),
                });
                return Ok(handle);
            }
        }

        let attempts = self.state.lock().attempts.len() - first;
        error!(
            session_id = %request.session_id,
            attempts,
            "All transport providers failed"
        );
        Err(SessionError::TransportExhausted {
            attempts,
            suggested_action: "Check network connectivity, firewall rules and relay server \
                               configuration"
                .to_string(),
        })
    }

    async fn attempt_with_retries(
        &self,
        provider: &Arc<dyn TransportProvider>,
        request: &ConnectRequest,
    ) -> Result<TransportHandle, SessionError> {
        let kind = provider.kind();
        let mut retries = 0;

        loop {
            let index = {
                let mut state = self.state.lock();
                state.attempts.push(ProviderAttempt {
                    provider: kind,
                    started_at: Utc::now(),
                    outcome: AttemptOutcome::Pending,
                    reason: None,
                });
                state.attempts.len() - 1
            };
            debug!(provider = %kind, retry = retries, "Attempting provider");

            let result =
                match tokio::time::timeout(self.config.attempt_timeout, provider.connect(request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        self.disconnect(kind).await;
                        Err(SessionError::Timeout {
                            operation: format!("{} connect", kind),
                            duration: self.config.attempt_timeout,
                        })
                    }
                };

            match result {
                Ok(connection) => {
                    self.finish_attempt(index, AttemptOutcome::Succeeded, None);
                    return Ok(TransportHandle::new(kind, connection));
                }
                Err(e) => {
                    self.finish_attempt(index, AttemptOutcome::Failed, Some(e.to_string()));
                    if e.is_transient() && retries < self.config.max_retries {
                        retries += 1;
                        warn!(provider = %kind, retry = retries, "Transient failure, retrying: {}", e);
                        tokio::time::sleep(self.config.retry_backoff).await;
                        continue;
                    }
                    warn!(provider = %kind, "Provider attempt failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    fn finish_attempt(&self, index: usize, outcome: AttemptOutcome, reason: Option<String>) {
        let mut state = self.state.lock();
        if let Some(attempt) = state.attempts.get_mut(index) {
            // release() may already have closed it out
            if attempt.outcome == AttemptOutcome::Pending {
                attempt.outcome = outcome;
                attempt.reason = reason;
            }
        }
    }

    async fn relay_available(&self) -> bool {
        let Some(diagnostic) = &self.diagnostic else {
            debug!("No relay diagnostic attached, relay path unverified");
            return true;
        };
        if let Some(report) = diagnostic.latest() {
            return report.relay_reachable();
        }
        let bound = diagnostic.timeout() + CONTEXT_CLOSE_TIMEOUT;
        match tokio::time::timeout(bound, diagnostic.run(&self.config.relay_servers)).await {
            Ok(report) => report.relay_reachable(),
            Err(_) => {
                warn!("Relay diagnostic did not finish within {:?}", bound);
                false
            }
        }
    }

    async fn disconnect(&self, kind: ProviderKind) {
        let Some(provider) = self.providers.get(&kind) else {
            return;
        };
        match tokio::time::timeout(self.config.shutdown_timeout, provider.disconnect()).await {
            Ok(Ok(())) => debug!(provider = %kind, "Provider disconnected"),
            Ok(Err(e)) => warn!(provider = %kind, "Disconnect failed: {}", e),
            Err(_) => warn!(provider = %kind, "Disconnect timed out"),
        }
    }
}

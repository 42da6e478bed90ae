//! Scripted collaborators shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sessionrtc::{Event, EventStream, SessionConfig, SessionPhase};
use sessionrtc_core::{
    ConnectRequest, MediaStreamHandle, ProviderConnection, ProviderKind, SessionError,
    TransportProvider, TransportStats,
};
use sessionrtc_diagnostics::{GatheringContext, NegotiationEngine, NetworkProbe, RelayServerConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const HOST: &str = "candidate:1 1 udp 2130706431 192.168.1.10 50000 typ host";
pub const RELAY: &str =
    "candidate:3 1 udp 16777215 203.0.113.5 60000 typ relay raddr 198.51.100.20 rport 50001";

/// What one `connect` call does
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Succeed(Duration),
    Fail { transient: bool },
    Hang,
}

pub struct ScriptedProvider {
    kind: ProviderKind,
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    toggles: Mutex<Vec<(&'static str, bool)>>,
}

impl ScriptedProvider {
    pub fn scripted(kind: ProviderKind, script: Vec<Outcome>, fallback: Outcome) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script: Mutex::new(script.into()),
            fallback,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            toggles: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding(kind: ProviderKind) -> Arc<Self> {
        Self::scripted(kind, Vec::new(), Outcome::Succeed(Duration::ZERO))
    }

    pub fn slow(kind: ProviderKind, delay: Duration) -> Arc<Self> {
        Self::scripted(kind, Vec::new(), Outcome::Succeed(delay))
    }

    pub fn failing(kind: ProviderKind) -> Arc<Self> {
        Self::scripted(kind, Vec::new(), Outcome::Fail { transient: false })
    }

    pub fn hanging(kind: ProviderKind) -> Arc<Self> {
        Self::scripted(kind, Vec::new(), Outcome::Hang)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn toggles(&self) -> Vec<(&'static str, bool)> {
        self.toggles.lock().clone()
    }
}

#[async_trait]
impl TransportProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn connect(&self, _request: &ConnectRequest) -> Result<ProviderConnection, SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().pop_front().unwrap_or(self.fallback);
        match outcome {
            Outcome::Succeed(delay) => {
                tokio::time::sleep(delay).await;
                Ok(ProviderConnection {
                    remote_stream: Some(MediaStreamHandle::new(format!("{} remote", self.kind))),
                })
            }
            Outcome::Fail { transient } => Err(SessionError::ProviderAttempt {
                provider: self.kind,
                reason: "scripted failure".to_string(),
                transient,
            }),
            Outcome::Hang => futures::future::pending().await,
        }
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn toggle_audio(&self, enabled: bool) -> Result<(), SessionError> {
        self.toggles.lock().push(("audio", enabled));
        Ok(())
    }

    async fn toggle_video(&self, enabled: bool) -> Result<(), SessionError> {
        self.toggles.lock().push(("video", enabled));
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, SessionError> {
        Ok(TransportStats::default())
    }
}

/// Probe whose round-trip time can be changed mid-test
pub struct AdjustableProbe {
    rtt: Mutex<Option<Duration>>,
}

impl AdjustableProbe {
    /// 40 ms at 10 Mbps classifies as excellent
    pub fn excellent() -> Arc<Self> {
        Self::with_rtt(40)
    }

    pub fn with_rtt(rtt_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            rtt: Mutex::new(Some(Duration::from_millis(rtt_ms))),
        })
    }

    pub fn set_rtt(&self, rtt_ms: u64) {
        *self.rtt.lock() = Some(Duration::from_millis(rtt_ms));
    }

    /// 600 ms classifies as poor regardless of bandwidth
    pub fn degrade(&self) {
        self.set_rtt(600);
    }

    pub fn take_down(&self) {
        *self.rtt.lock() = None;
    }
}

#[async_trait]
impl NetworkProbe for AdjustableProbe {
    async fn round_trip(&self) -> Result<Duration, SessionError> {
        let rtt = *self.rtt.lock();
        rtt.ok_or_else(|| SessionError::Transport {
            reason: "network unreachable".to_string(),
        })
    }

    async fn platform_bandwidth_bps(&self) -> Option<f64> {
        self.rtt.lock().map(|_| 10_000_000.0)
    }

    async fn timed_transfer(&self, _payload: Bytes) -> Result<Duration, SessionError> {
        Err(SessionError::Transport {
            reason: "no echo endpoint".to_string(),
        })
    }
}

/// Engine whose every context emits fixed candidates and completes
pub struct FixedEngine {
    candidates: Vec<&'static str>,
    stall_open: bool,
    opened: AtomicUsize,
}

impl FixedEngine {
    pub fn reachable() -> Arc<Self> {
        Arc::new(Self {
            candidates: vec![HOST, RELAY],
            stall_open: false,
            opened: AtomicUsize::new(0),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            candidates: vec![HOST],
            stall_open: false,
            opened: AtomicUsize::new(0),
        })
    }

    /// Context construction never returns
    pub fn stalled() -> Arc<Self> {
        Arc::new(Self {
            candidates: vec![HOST, RELAY],
            stall_open: true,
            opened: AtomicUsize::new(0),
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

struct FixedContext {
    candidates: VecDeque<&'static str>,
}

#[async_trait]
impl GatheringContext for FixedContext {
    async fn next_candidate(&mut self) -> Option<String> {
        self.candidates.pop_front().map(str::to_string)
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl NegotiationEngine for FixedEngine {
    async fn open_context(
        &self,
        _server: &RelayServerConfig,
    ) -> Result<Box<dyn GatheringContext>, SessionError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.stall_open {
            return futures::future::pending().await;
        }
        Ok(Box::new(FixedContext {
            candidates: self.candidates.iter().copied().collect(),
        }))
    }
}

pub fn relay_server() -> RelayServerConfig {
    RelayServerConfig::turn("turn:relay.example.com:3478", "user", "secret")
}

/// Five-second sampling, fifteen-second grace
pub fn test_config() -> SessionConfig {
    SessionConfig::builder()
        .monitor_interval(Duration::from_secs(5))
        .degradation_grace(Duration::from_secs(15))
        .diagnostic_timeout(Duration::from_secs(2))
        .build()
        .expect("valid test config")
}

/// Collect events up to and including the transition into `phase`
pub async fn events_until(events: &mut EventStream, phase: SessionPhase) -> Vec<Event> {
    let collect = async {
        let mut seen = Vec::new();
        while let Some(event) = events.next().await {
            let reached = matches!(&event, Event::StateChanged { state } if state.phase == phase);
            seen.push(event);
            if reached {
                return seen;
            }
        }
        panic!("event stream closed before reaching {}: {:?}", phase, seen);
    };
    tokio::time::timeout(Duration::from_secs(600), collect)
        .await
        .unwrap_or_else(|_| panic!("session never reached {}", phase))
}

/// Drain the stream until the session drops its observer
pub async fn remaining_events(events: &mut EventStream) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        seen.push(event);
    }
    seen
}

pub fn phases(events: &[Event]) -> Vec<SessionPhase> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::StateChanged { state } => Some(state.phase),
            _ => None,
        })
        .collect()
}

pub fn event_types(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(Event::event_type).collect()
}

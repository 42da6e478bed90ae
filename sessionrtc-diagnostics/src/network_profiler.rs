//! Connection quality monitoring
//!
//! [`QualityMonitor::sample`] runs three independent sub-probes against a
//! [`NetworkProbe`] and folds them into one [`NetworkConditions`] value:
//!
//! - latency: median of a few round trips
//! - bandwidth: platform estimate, or a timed transfer of a small payload
//! - stability: spread of several spaced round trips
//!
//! Probe failures never abort a sample. They are replaced with pessimistic
//! values and counted towards the loss estimate.
//!
//! The most recent sample is kept in a single-slot watch channel. Samples carry
//! a monotonically increasing sequence number so consumers can drop stale ones.

use crate::connection_analyzer::{inferred_bandwidth_mbps, loss_percent, LatencySeries};
use crate::stun;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sessionrtc_core::{
    classify, ConnectionType, NetworkConditions, QualityAssessment, QualityTier, SessionError,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::Message;

/// Source of raw network measurements
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// One small round trip to a reference endpoint
    async fn round_trip(&self) -> Result<Duration, SessionError>;

    /// Bandwidth estimate reported by the platform, in bits per second
    async fn platform_bandwidth_bps(&self) -> Option<f64> {
        None
    }

    /// Move `payload` through the network and report how long it took
    async fn timed_transfer(&self, payload: Bytes) -> Result<Duration, SessionError>;

    /// Link type label
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Unknown
    }
}

/// Monitor tuning
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Sampling period
    pub interval: Duration,
    /// Upper bound for the backed-off period after failed samples
    pub max_backoff: Duration,
    /// Round trips for the latency sub-probe
    pub latency_probes: usize,
    /// Round trips for the stability sub-probe
    pub stability_probes: usize,
    /// Pause between stability round trips
    pub stability_spacing: Duration,
    /// Timeout applied to every individual probe
    pub probe_timeout: Duration,
    /// Payload size for the timed transfer
    pub transfer_payload_bytes: usize,
    /// Latency assumed for a failed round trip (ms)
    pub fallback_latency_ms: f64,
    /// Bandwidth assumed when no estimate is available (Mbps)
    pub fallback_bandwidth_mbps: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_backoff: Duration::from_secs(240),
            latency_probes: 3,
            stability_probes: 5,
            stability_spacing: Duration::from_millis(200),
            probe_timeout: Duration::from_secs(3),
            transfer_payload_bytes: 64 * 1024,
            fallback_latency_ms: 1000.0,
            fallback_bandwidth_mbps: 0.5,
        }
    }
}

/// One completed assessment
#[derive(Debug, Clone, PartialEq)]
pub struct QualitySample {
    /// Monotonic sample number, starting at 1
    pub sequence: u64,
    /// Measured conditions
    pub conditions: NetworkConditions,
    /// Classification of `conditions`
    pub assessment: QualityAssessment,
    /// Probes that failed or timed out
    pub failed_probes: usize,
    /// Probes attempted
    pub total_probes: usize,
    /// Wall-clock time the sample completed
    pub measured_at: DateTime<Utc>,
}

impl QualitySample {
    /// Tier of this sample
    pub fn tier(&self) -> QualityTier {
        self.assessment.tier
    }

    /// Whether the assessment found no connectivity at all
    pub fn is_failure(&self) -> bool {
        self.assessment.tier == QualityTier::Failed
    }
}

/// Identifies a registered monitoring callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type SampleCallback = Arc<dyn Fn(&QualitySample) + Send + Sync>;

struct MonitorInner {
    probe: Arc<dyn NetworkProbe>,
    config: MonitorConfig,
    sequence: AtomicU64,
    latest: watch::Sender<Option<QualitySample>>,
    callbacks: DashMap<u64, SampleCallback>,
    next_callback_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Periodic connection quality monitor
pub struct QualityMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for QualityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityMonitor")
            .field("config", &self.inner.config)
            .field("callbacks", &self.inner.callbacks.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl QualityMonitor {
    /// Create an idle monitor
    pub fn new(probe: Arc<dyn NetworkProbe>, config: MonitorConfig) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            inner: Arc::new(MonitorInner {
                probe,
                config,
                sequence: AtomicU64::new(0),
                latest,
                callbacks: DashMap::new(),
                next_callback_id: AtomicU64::new(1),
                task: Mutex::new(None),
            }),
        }
    }

    /// Monitor configuration
    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Measure current conditions once
    pub async fn assess(&self) -> NetworkConditions {
        self.inner.sample().await.conditions
    }

    /// Measure once and return the full sample
    pub async fn sample(&self) -> QualitySample {
        self.inner.sample().await
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<QualitySample> {
        self.inner.latest.borrow().clone()
    }

    /// Watch the latest-sample slot
    pub fn subscribe(&self) -> watch::Receiver<Option<QualitySample>> {
        self.inner.latest.subscribe()
    }

    /// Register a callback and make sure the sampling loop runs
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_monitoring<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&QualitySample) + Send + Sync + 'static,
    {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.insert(id, Arc::new(callback));

        let mut task = self.inner.task.lock();
        let running = task.as_ref().is_some_and(|handle| !handle.is_finished());
        if !running {
            let weak = Arc::downgrade(&self.inner);
            let config = self.inner.config.clone();
            *task = Some(tokio::spawn(monitor_loop(weak, config)));
            info!(
                interval_ms = self.inner.config.interval.as_millis() as u64,
                "Started quality monitoring"
            );
        }

        CallbackId(id)
    }

    /// Remove a callback; removing the last one stops the loop
    pub fn unregister(&self, id: CallbackId) -> bool {
        let removed = self.inner.callbacks.remove(&id.0).is_some();
        if removed && self.inner.callbacks.is_empty() {
            self.abort_loop();
        }
        removed
    }

    /// Drop every callback and stop the loop
    pub fn stop_monitoring(&self) {
        self.inner.callbacks.clear();
        self.abort_loop();
    }

    /// Whether the background loop is alive
    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn abort_loop(&self) {
        if let Some(handle) = self.inner.task.lock().take() {
            handle.abort();
            info!("Stopped quality monitoring");
        }
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.task.lock().take() {
            handle.abort();
        }
    }
}

async fn monitor_loop(inner: Weak<MonitorInner>, config: MonitorConfig) {
    let mut delay = config.interval;

    loop {
        tokio::time::sleep(delay).await;

        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.callbacks.is_empty() {
            debug!("No quality observers left, monitor going idle");
            break;
        }

        let sample = inner.sample().await;

        let callbacks: Vec<SampleCallback> = inner
            .callbacks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for callback in callbacks {
            callback(&sample);
        }

        delay = if sample.is_failure() {
            let backed_off = (delay * 2).min(config.max_backoff);
            warn!(
                sequence = sample.sequence,
                next_ms = backed_off.as_millis() as u64,
                "Quality assessment failed, backing off"
            );
            backed_off
        } else {
            config.interval
        };
    }
}

impl MonitorInner {
    async fn sample(&self) -> QualitySample {
        let (latency, bandwidth, stability) = tokio::join!(
            self.latency_series(),
            self.bandwidth_mbps(),
            self.stability_series(),
        );
        let (bandwidth_mbps, bandwidth_failed) = bandwidth;

        let measured = if latency.all_failed() && stability.all_failed() {
            NetworkConditions::unreachable()
        } else {
            NetworkConditions::new(
                bandwidth_mbps,
                latency.median_with_fallback(self.config.fallback_latency_ms),
                loss_percent(&[&latency, &stability]),
                stability.is_stable(),
            )
        };
        let conditions = measured.with_connection_type(self.probe.connection_type());

        let assessment = classify(&conditions);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let sample = QualitySample {
            sequence,
            assessment,
            failed_probes: latency.failures() + stability.failures() + usize::from(bandwidth_failed),
            total_probes: latency.total() + stability.total() + 1,
            conditions,
            measured_at: Utc::now(),
        };

        debug!(
            sequence,
            tier = %sample.assessment.tier,
            rtt_ms = sample.conditions.rtt_ms,
            bandwidth_mbps = sample.conditions.bandwidth_mbps(),
            loss_percent = sample.conditions.loss_percent,
            stable = sample.conditions.stable,
            "Quality sample"
        );

        // Concurrent samples may finish out of order; never regress the slot
        self.latest.send_if_modified(|slot| {
            let newer = slot.as_ref().map_or(true, |s| s.sequence < sample.sequence);
            if newer {
                *slot = Some(sample.clone());
            }
            newer
        });

        sample
    }

    async fn timed_round_trip(&self, probe: &'static str) -> Option<Duration> {
        match self.bounded(probe, self.probe.round_trip()).await {
            Ok(rtt) => Some(rtt),
            Err(e) => {
                debug!("{}", e);
                None
            }
        }
    }

    async fn latency_series(&self) -> LatencySeries {
        let mut series = LatencySeries::new();
        for _ in 0..self.config.latency_probes {
            series.record(self.timed_round_trip("latency").await);
        }
        series
    }

    async fn stability_series(&self) -> LatencySeries {
        let mut series = LatencySeries::new();
        for i in 0..self.config.stability_probes {
            if i > 0 {
                tokio::time::sleep(self.config.stability_spacing).await;
            }
            series.record(self.timed_round_trip("stability").await);
        }
        series
    }

    /// Bandwidth in Mbps and whether the estimate had to fall back
    async fn bandwidth_mbps(&self) -> (f64, bool) {
        if let Some(bps) = self.probe.platform_bandwidth_bps().await {
            if bps.is_finite() && bps > 0.0 {
                return (bps / 1_000_000.0, false);
            }
        }

        let payload = Bytes::from(vec![0u8; self.config.transfer_payload_bytes]);
        match self
            .bounded("bandwidth", self.probe.timed_transfer(payload))
            .await
        {
            Ok(elapsed) => (
                inferred_bandwidth_mbps(self.config.transfer_payload_bytes, elapsed),
                false,
            ),
            Err(e) => {
                debug!("{}", e);
                (self.config.fallback_bandwidth_mbps, true)
            }
        }
    }

    async fn bounded<T>(
        &self,
        probe: &'static str,
        operation: impl Future<Output = Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        match tokio::time::timeout(self.config.probe_timeout, operation).await {
            Ok(result) => result.map_err(|e| match e {
                failure @ SessionError::ProbeFailure { .. } => failure,
                other => SessionError::ProbeFailure {
                    probe: probe.to_string(),
                    reason: other.to_string(),
                },
            }),
            Err(_) => Err(SessionError::ProbeFailure {
                probe: probe.to_string(),
                reason: format!("no answer within {:?}", self.config.probe_timeout),
            }),
        }
    }
}

/// Probe backed by STUN binding requests and an optional WebSocket echo
#[derive(Debug, Clone)]
pub struct StunNetworkProbe {
    stun_server: SocketAddr,
    echo_url: Option<String>,
    connection_type: ConnectionType,
}

impl StunNetworkProbe {
    /// Probe round trips against a STUN server
    pub fn new(stun_server: SocketAddr) -> Self {
        Self {
            stun_server,
            echo_url: None,
            connection_type: ConnectionType::Unknown,
        }
    }

    /// Use a WebSocket echo endpoint for the timed transfer
    pub fn with_echo_url(mut self, url: impl Into<String>) -> Self {
        self.echo_url = Some(url.into());
        self
    }

    /// Label samples with a link type
    pub fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    fn failure(probe: &str, reason: impl std::fmt::Display) -> SessionError {
        SessionError::ProbeFailure {
            probe: probe.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl NetworkProbe for StunNetworkProbe {
    async fn round_trip(&self) -> Result<Duration, SessionError> {
        let bind_addr: SocketAddr = if self.stun_server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Self::failure("stun", format!("bind failed: {}", e)))?;

        let transaction_id = stun::TransactionId::random();
        let request = stun::encode_binding_request(&transaction_id);

        let started = Instant::now();
        socket
            .send_to(&request, self.stun_server)
            .await
            .map_err(|e| Self::failure("stun", format!("send failed: {}", e)))?;

        let mut buf = [0u8; 512];
        loop {
            let (len, from) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| Self::failure("stun", format!("receive failed: {}", e)))?;
            if from == self.stun_server && stun::is_binding_response(&buf[..len], &transaction_id)
            {
                return Ok(started.elapsed());
            }
        }
    }

    async fn timed_transfer(&self, payload: Bytes) -> Result<Duration, SessionError> {
        let url = self
            .echo_url
            .as_deref()
            .ok_or_else(|| Self::failure("bandwidth", "no echo endpoint configured"))?;

        let (mut stream, _) = connect_async(url)
            .await
            .map_err(|e| Self::failure("bandwidth", format!("connect failed: {}", e)))?;

        let expected = payload.len();
        let started = Instant::now();
        stream
            .send(Message::Binary(payload.to_vec()))
            .await
            .map_err(|e| Self::failure("bandwidth", format!("send failed: {}", e)))?;

        let result = loop {
            match stream.next().await {
                Some(Ok(Message::Binary(echo))) if echo.len() == expected => {
                    break Ok(started.elapsed())
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => break Err(Self::failure("bandwidth", e)),
                None => break Err(Self::failure("bandwidth", "echo endpoint closed")),
            }
        };

        let _ = stream.close(None).await;
        result
    }

    fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }
}

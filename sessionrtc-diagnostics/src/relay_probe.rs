//! Relay (TURN/STUN-class) reachability diagnostic
//!
//! Each configured relay server is tested in its own negotiation context: the
//! engine gathers candidates against that single server and the diagnostic
//! classifies what comes back. Servers are tested concurrently and never share
//! state, so a hung or failing server cannot affect another server's result.
//!
//! The diagnostic holds no connection after [`RelayDiagnostic::run`] returns.
//! Every context it opened has been closed, including on timeout.

use crate::candidate::{CandidateType, IceCandidate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sessionrtc_core::SessionError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default per-server gathering timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(12);

/// Bound on releasing a gathering context
pub const CONTEXT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// One relay server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayServerConfig {
    /// Server URL (`turn:`, `turns:`, `stun:` or `stuns:`)
    pub url: String,
    /// Long-term credential username (required for TURN)
    #[serde(default)]
    pub username: Option<String>,
    /// Long-term credential password (required for TURN)
    #[serde(default)]
    pub credential: Option<String>,
}

impl RelayServerConfig {
    /// TURN server with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Credential-less STUN server
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    /// Whether the URL names a TURN server
    pub fn is_turn(&self) -> bool {
        self.url.starts_with("turn:") || self.url.starts_with("turns:")
    }

    /// Check URL scheme and credentials
    pub fn validate(&self) -> Result<(), SessionError> {
        let known_scheme = ["turn:", "turns:", "stun:", "stuns:"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme));
        if !known_scheme {
            return Err(SessionError::configuration(
                "relay_servers.url",
                format!("unsupported relay URL scheme: {}", self.url),
            ));
        }

        let host = self.url.split_once(':').map(|(_, rest)| rest).unwrap_or("");
        if host.trim_start_matches('/').is_empty() {
            return Err(SessionError::configuration(
                "relay_servers.url",
                format!("relay URL has no host: {}", self.url),
            ));
        }

        if self.is_turn() {
            let has_username = self.username.as_deref().is_some_and(|u| !u.is_empty());
            let has_credential = self.credential.as_deref().is_some_and(|c| !c.is_empty());
            if !has_username || !has_credential {
                return Err(SessionError::configuration(
                    "relay_servers.credential",
                    format!("TURN server {} requires username and credential", self.url),
                ));
            }
        }

        Ok(())
    }
}

/// A candidate-gathering session scoped to one relay server
///
/// Implementations must release their resources on drop as well as on
/// [`GatheringContext::close`], since a cancelled diagnostic drops the
/// context without closing it.
#[async_trait]
pub trait GatheringContext: Send {
    /// Next discovered candidate line, or `None` once gathering is complete
    async fn next_candidate(&mut self) -> Option<String>;

    /// Release the context
    async fn close(&mut self);
}

/// The real-time transport engine that performs candidate gathering
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Build an isolated gathering context for a single relay server
    async fn open_context(
        &self,
        server: &RelayServerConfig,
    ) -> Result<Box<dyn GatheringContext>, SessionError>;
}

/// Outcome of testing one relay server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayCandidateResult {
    /// Server URL
    pub server_url: String,
    /// Server produced at least one server-derived candidate
    pub reachable: bool,
    /// At least one relay candidate was discovered
    pub relay_found: bool,
    /// Relay candidates discovered
    pub relay_candidates: Vec<IceCandidate>,
    /// Number of server-reflexive (and peer-reflexive) candidates
    pub server_reflexive_count: usize,
    /// Number of host candidates
    pub host_count: usize,
    /// Time spent on this server in milliseconds
    pub elapsed_ms: u64,
    /// Gathering hit the timeout before completing
    pub timed_out: bool,
    /// Error that ended the test, if any
    pub error: Option<String>,
}

impl RelayCandidateResult {
    fn failed(server: &RelayServerConfig, started: Instant, error: &SessionError) -> Self {
        Self {
            server_url: server.url.clone(),
            reachable: false,
            relay_found: false,
            relay_candidates: Vec::new(),
            server_reflexive_count: 0,
            host_count: 0,
            elapsed_ms: started.elapsed().as_millis() as u64,
            timed_out: false,
            error: Some(error.to_string()),
        }
    }

    /// Whether this server can carry relayed transport
    pub fn is_successful(&self) -> bool {
        self.relay_found
    }
}

/// Aggregated diagnostic output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayReport {
    /// Per-server results in configuration order
    pub results: Vec<RelayCandidateResult>,
    /// Human-readable recommendations
    pub recommendations: Vec<String>,
    /// When the report was produced
    pub generated_at: DateTime<Utc>,
}

impl RelayReport {
    /// Build a report and derive its recommendations
    pub fn new(results: Vec<RelayCandidateResult>) -> Self {
        let recommendations = recommendations_for(&results);
        Self {
            results,
            recommendations,
            generated_at: Utc::now(),
        }
    }

    /// Number of servers that produced a relay candidate
    pub fn successful_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_successful()).count()
    }

    /// Whether at least one relay path exists
    pub fn relay_reachable(&self) -> bool {
        self.successful_count() > 0
    }

    /// Render the report as pretty JSON
    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string_pretty(self).map_err(|e| SessionError::ProbeFailure {
            probe: "relay_report".to_string(),
            reason: format!("Failed to serialize report: {}", e),
        })
    }
}

fn recommendations_for(results: &[RelayCandidateResult]) -> Vec<String> {
    let total = results.len();
    let successful = results.iter().filter(|r| r.is_successful()).count();
    let mut recommendations = Vec::new();

    if total == 0 {
        recommendations.push(
            "No relay servers configured: sessions on restrictive networks will fail. \
             Configure at least one TURN server."
                .to_string(),
        );
        return recommendations;
    }

    if successful == 0 {
        recommendations.push(
            "No relay reachable: sessions on restrictive networks will fail. \
             Check firewall rules and relay credentials."
                .to_string(),
        );
    } else if successful < total {
        recommendations.push(format!(
            "Only {} of {} relay servers produced relay candidates: add redundant relay servers.",
            successful, total
        ));
    } else {
        recommendations.push(format!(
            "Relay path confirmed on {} of {} servers.",
            successful, total
        ));
    }

    for result in results.iter().filter(|r| !r.is_successful()) {
        let detail = match (&result.error, result.reachable) {
            (Some(error), _) => error.clone(),
            (None, true) => {
                "server answered but allocated no relay address; check TURN credentials"
                    .to_string()
            }
            (None, false) if result.timed_out => "no response before timeout".to_string(),
            (None, false) => "gathering completed without server candidates".to_string(),
        };
        recommendations.push(format!("{}: {}", result.server_url, detail));
    }

    recommendations
}

#[derive(Default)]
struct CandidateTally {
    relay: Vec<IceCandidate>,
    reflexive: usize,
    host: usize,
}

impl CandidateTally {
    fn record(&mut self, server_url: &str, line: &str) {
        match line.parse::<IceCandidate>() {
            Ok(candidate) => {
                debug!(
                    server = server_url,
                    candidate_type = %candidate.candidate_type,
                    address = %candidate.address,
                    "Candidate discovered"
                );
                match candidate.candidate_type {
                    CandidateType::Host => self.host += 1,
                    CandidateType::ServerReflexive | CandidateType::PeerReflexive => {
                        self.reflexive += 1
                    }
                    CandidateType::Relay => self.relay.push(candidate),
                }
            }
            Err(e) => debug!(server = server_url, "Ignoring unparseable candidate: {}", e),
        }
    }
}

/// Runs relay reachability tests and keeps the latest report
pub struct RelayDiagnostic {
    engine: Arc<dyn NegotiationEngine>,
    timeout: Duration,
    latest: watch::Sender<Option<Arc<RelayReport>>>,
}

impl std::fmt::Debug for RelayDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayDiagnostic")
            .field("timeout", &self.timeout)
            .field("has_report", &self.latest.borrow().is_some())
            .finish()
    }
}

impl RelayDiagnostic {
    /// Create a diagnostic using the default timeout
    pub fn new(engine: Arc<dyn NegotiationEngine>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            engine,
            timeout: DEFAULT_PROBE_TIMEOUT,
            latest,
        }
    }

    /// Override the per-server timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Per-server timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Most recent report, if any run completed
    pub fn latest(&self) -> Option<Arc<RelayReport>> {
        self.latest.borrow().clone()
    }

    /// Watch the latest-report slot
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<RelayReport>>> {
        self.latest.subscribe()
    }

    /// Test every server concurrently and publish the report
    pub async fn run(&self, servers: &[RelayServerConfig]) -> Arc<RelayReport> {
        info!("Testing reachability of {} relay servers", servers.len());

        let results = join_all(
            servers
                .iter()
                .map(|server| test_server(self.engine.as_ref(), server, self.timeout)),
        )
        .await;

        let report = Arc::new(RelayReport::new(results));
        info!(
            successful = report.successful_count(),
            total = report.results.len(),
            "Relay diagnostic complete"
        );
        self.latest.send_replace(Some(report.clone()));
        report
    }
}

/// Test a single relay server in its own context
pub async fn test_server(
    engine: &dyn NegotiationEngine,
    server: &RelayServerConfig,
    timeout: Duration,
) -> RelayCandidateResult {
    let started = Instant::now();

    if let Err(e) = server.validate() {
        warn!(server = %server.url, "Relay server rejected: {}", e);
        return RelayCandidateResult::failed(server, started, &e);
    }

    let deadline = started + timeout;
    let mut context = match tokio::time::timeout_at(deadline, engine.open_context(server)).await {
        Ok(Ok(context)) => context,
        Ok(Err(e)) => {
            warn!(server = %server.url, "Failed to open negotiation context: {}", e);
            return RelayCandidateResult::failed(server, started, &e);
        }
        Err(_) => {
            warn!(server = %server.url, "Negotiation context not ready within {:?}", timeout);
            let error = SessionError::Timeout {
                operation: format!("open context for {}", server.url),
                duration: timeout,
            };
            return RelayCandidateResult {
                timed_out: true,
                ..RelayCandidateResult::failed(server, started, &error)
            };
        }
    };

    let mut tally = CandidateTally::default();

    let timed_out = loop {
        match tokio::time::timeout_at(deadline, context.next_candidate()).await {
            Ok(Some(line)) => tally.record(&server.url, &line),
            Ok(None) => break false,
            Err(_) => break true,
        }
    };

    if tokio::time::timeout(CONTEXT_CLOSE_TIMEOUT, context.close())
        .await
        .is_err()
    {
        warn!(server = %server.url, "Context close timed out, dropping it");
    }
    drop(context);

    if timed_out {
        debug!(
            server = %server.url,
            relay = tally.relay.len(),
            "Gathering timed out, keeping partial results"
        );
    }

    RelayCandidateResult {
        server_url: server.url.clone(),
        reachable: tally.reflexive > 0 || !tally.relay.is_empty(),
        relay_found: !tally.relay.is_empty(),
        relay_candidates: tally.relay,
        server_reflexive_count: tally.reflexive,
        host_count: tally.host,
        elapsed_ms: started.elapsed().as_millis() as u64,
        timed_out,
        error: None,
    }
}

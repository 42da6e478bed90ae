//! Provider controller tests against scripted providers on a paused clock

mod common;

use common::{relay_server, FixedEngine, Outcome, ScriptedProvider};
use sessionrtc::controller::{INITIAL_CONNECTION, RELAY_UNREACHABLE};
use sessionrtc::{AttemptOutcome, ProviderController, SessionConfig};
use sessionrtc_core::ProviderKind::{DirectP2p, HostedFallback, RelayedP2p};
use sessionrtc_core::{ConnectRequest, ProviderKind, QualityTier, SessionError, TransportProvider};
use sessionrtc_diagnostics::{RelayDiagnostic, CONTEXT_CLOSE_TIMEOUT};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

fn request() -> ConnectRequest {
    ConnectRequest {
        session_id: "session-1".to_string(),
        local_participant: "alice".to_string(),
        remote_participant: "bob".to_string(),
        local_stream: None,
    }
}

fn controller(
    config: SessionConfig,
    providers: &[Arc<ScriptedProvider>],
    diagnostic: Option<Arc<RelayDiagnostic>>,
) -> ProviderController {
    let providers = providers
        .iter()
        .map(|p| p.clone() as Arc<dyn TransportProvider>)
        .collect();
    ProviderController::new(config, providers, diagnostic).expect("valid controller")
}

fn tried(controller: &ProviderController) -> Vec<ProviderKind> {
    controller.attempts().iter().map(|a| a.provider).collect()
}

#[tokio::test(start_paused = true)]
async fn test_poor_hint_reorders_without_filtering() {
    let providers = [
        ScriptedProvider::failing(DirectP2p),
        ScriptedProvider::failing(RelayedP2p),
        ScriptedProvider::failing(HostedFallback),
    ];
    let controller = controller(SessionConfig::default(), &providers, None);

    let error = assert_err!(controller.connect(request(), QualityTier::Poor).await);

    assert_eq!(
        controller.priority_order(),
        vec![HostedFallback, DirectP2p, RelayedP2p]
    );
    assert_eq!(tried(&controller), vec![HostedFallback, DirectP2p, RelayedP2p]);
    assert!(error.is_caller_facing());
    match error {
        SessionError::TransportExhausted {
            attempts,
            suggested_action,
        } => {
            assert_eq!(attempts, 3);
            assert!(!suggested_action.is_empty());
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_relay_skips_relay_provider() {
    let direct = ScriptedProvider::failing(DirectP2p);
    let relayed = ScriptedProvider::succeeding(RelayedP2p);
    let hosted = ScriptedProvider::succeeding(HostedFallback);
    let config = SessionConfig::builder()
        .relay_server(relay_server())
        .build()
        .unwrap();
    let engine = FixedEngine::unreachable();
    let diagnostic = Arc::new(RelayDiagnostic::new(engine.clone()));
    let controller = controller(
        config,
        &[direct.clone(), relayed.clone(), hosted.clone()],
        Some(diagnostic.clone()),
    );
    let mut changes = controller.subscribe();

    let handle = assert_ok!(controller.connect(request(), QualityTier::Good).await);

    assert_eq!(handle.provider(), HostedFallback);
    assert_eq!(relayed.connects(), 0);
    assert_eq!(engine.opened(), 1);
    assert!(diagnostic.latest().is_some());

    let attempts = controller.attempts();
    assert_eq!(tried(&controller), vec![DirectP2p, RelayedP2p, HostedFallback]);
    assert_eq!(attempts[1].outcome, AttemptOutcome::Failed);
    assert_eq!(attempts[1].reason.as_deref(), Some(RELAY_UNREACHABLE));
    assert_eq!(attempts[2].outcome, AttemptOutcome::Succeeded);

    let change = changes.try_recv().unwrap();
    assert_eq!(change.provider, HostedFallback);
    assert_eq!(change.reason, INITIAL_CONNECTION);
    assert_eq!(change.handle, handle);
}

#[tokio::test(start_paused = true)]
async fn test_reachable_relay_is_attempted() {
    let direct = ScriptedProvider::failing(DirectP2p);
    let relayed = ScriptedProvider::succeeding(RelayedP2p);
    let hosted = ScriptedProvider::succeeding(HostedFallback);
    let config = SessionConfig::builder()
        .relay_server(relay_server())
        .build()
        .unwrap();
    let diagnostic = Arc::new(RelayDiagnostic::new(FixedEngine::reachable()));
    let controller = controller(config, &[direct, relayed.clone(), hosted], Some(diagnostic));

    let handle = assert_ok!(controller.connect(request(), QualityTier::Good).await);

    assert_eq!(handle.provider(), RelayedP2p);
    assert_eq!(relayed.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_relay_check_skips_relay_provider() {
    let direct = ScriptedProvider::failing(DirectP2p);
    let relayed = ScriptedProvider::succeeding(RelayedP2p);
    let hosted = ScriptedProvider::succeeding(HostedFallback);
    let config = SessionConfig::builder()
        .relay_server(relay_server())
        .build()
        .unwrap();
    let engine = FixedEngine::stalled();
    let diagnostic = Arc::new(RelayDiagnostic::new(engine.clone()));
    let bound = diagnostic.timeout() + CONTEXT_CLOSE_TIMEOUT;
    let controller = controller(
        config,
        &[direct, relayed.clone(), hosted],
        Some(diagnostic.clone()),
    );

    let started = Instant::now();
    let handle = assert_ok!(controller.connect(request(), QualityTier::Good).await);

    assert_eq!(handle.provider(), HostedFallback);
    assert!(started.elapsed() <= bound);
    assert_eq!(relayed.connects(), 0);
    assert_eq!(engine.opened(), 1);

    let attempts = controller.attempts();
    assert_eq!(attempts[1].provider, RelayedP2p);
    assert_eq!(attempts[1].reason.as_deref(), Some(RELAY_UNREACHABLE));
    let report = diagnostic.latest().expect("report cached");
    assert!(!report.relay_reachable());
    assert!(report.results[0].timed_out);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let direct = ScriptedProvider::scripted(
        DirectP2p,
        vec![
            Outcome::Fail { transient: true },
            Outcome::Fail { transient: true },
        ],
        Outcome::Succeed(Duration::ZERO),
    );
    let providers = [
        direct.clone(),
        ScriptedProvider::succeeding(RelayedP2p),
        ScriptedProvider::succeeding(HostedFallback),
    ];
    let controller = controller(SessionConfig::default(), &providers, None);

    let started = Instant::now();
    let handle = assert_ok!(controller.connect(request(), QualityTier::Good).await);

    assert_eq!(handle.provider(), DirectP2p);
    assert_eq!(direct.connects(), 3);
    // Two one-second pauses between the three tries
    assert!(started.elapsed() >= Duration::from_secs(2));

    let outcomes: Vec<AttemptOutcome> = controller.attempts().iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::Failed,
            AttemptOutcome::Failed,
            AttemptOutcome::Succeeded
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_not_retried() {
    let direct = ScriptedProvider::failing(DirectP2p);
    let hosted = ScriptedProvider::succeeding(HostedFallback);
    let config = SessionConfig::builder()
        .providers([DirectP2p, HostedFallback])
        .build()
        .unwrap();
    let controller = controller(config, &[direct.clone(), hosted], None);

    let handle = assert_ok!(controller.connect(request(), QualityTier::Good).await);

    assert_eq!(handle.provider(), HostedFallback);
    assert_eq!(direct.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_attempt_times_out() {
    let direct = ScriptedProvider::hanging(DirectP2p);
    let hosted = ScriptedProvider::succeeding(HostedFallback);
    let config = SessionConfig::builder()
        .providers([DirectP2p, HostedFallback])
        .max_retries(0)
        .attempt_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let controller = controller(config, &[direct.clone(), hosted], None);

    let started = Instant::now();
    let handle = assert_ok!(controller.connect(request(), QualityTier::Good).await);

    assert_eq!(handle.provider(), HostedFallback);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(6));
    // The abandoned attempt is torn down
    assert_eq!(direct.disconnects(), 1);

    let attempts = controller.attempts();
    assert_eq!(attempts[0].outcome, AttemptOutcome::Failed);
    assert!(attempts[0].reason.as_deref().unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_switch_walks_forward_without_flapping() {
    let direct = ScriptedProvider::succeeding(DirectP2p);
    let relayed = ScriptedProvider::succeeding(RelayedP2p);
    let hosted = ScriptedProvider::succeeding(HostedFallback);
    let controller = controller(
        SessionConfig::default(),
        &[direct.clone(), relayed.clone(), hosted.clone()],
        None,
    );

    assert_ok!(controller.connect(request(), QualityTier::Good).await);

    let mut visited = Vec::new();
    for _ in 0..3 {
        let handle = assert_ok!(controller.switch_provider("degraded").await);
        visited.push(handle.provider());
    }

    assert_eq!(visited, vec![RelayedP2p, HostedFallback, DirectP2p]);
    // Every provider was released before the next one was tried
    assert_eq!(direct.disconnects(), 1);
    assert_eq!(relayed.disconnects(), 1);
    assert_eq!(hosted.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_switch_retries_current_provider_last() {
    let direct = ScriptedProvider::scripted(
        DirectP2p,
        vec![Outcome::Succeed(Duration::ZERO)],
        Outcome::Fail { transient: false },
    );
    let relayed = ScriptedProvider::failing(RelayedP2p);
    let hosted = ScriptedProvider::failing(HostedFallback);
    let controller = controller(
        SessionConfig::default(),
        &[direct.clone(), relayed, hosted],
        None,
    );

    assert_ok!(controller.connect(request(), QualityTier::Good).await);
    let error = assert_err!(controller.switch_provider("degraded").await);

    assert!(matches!(
        error,
        SessionError::TransportExhausted { attempts: 3, .. }
    ));
    assert_eq!(
        tried(&controller),
        vec![DirectP2p, RelayedP2p, HostedFallback, DirectP2p]
    );
    assert_eq!(direct.connects(), 2);
    assert!(controller.active().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_switches_share_one_negotiation() {
    let direct = ScriptedProvider::succeeding(DirectP2p);
    let relayed = ScriptedProvider::slow(RelayedP2p, Duration::from_secs(2));
    let hosted = ScriptedProvider::succeeding(HostedFallback);
    let controller = controller(
        SessionConfig::default(),
        &[direct, relayed.clone(), hosted.clone()],
        None,
    );
    let mut changes = controller.subscribe();

    assert_ok!(controller.connect(request(), QualityTier::Good).await);
    assert_eq!(changes.try_recv().unwrap().provider, DirectP2p);

    let (first, second) = tokio::join!(
        controller.switch_provider("degraded"),
        controller.switch_provider("degraded again"),
    );

    let first = assert_ok!(first);
    let second = assert_ok!(second);
    assert_eq!(first, second);
    assert_eq!(first.provider(), RelayedP2p);
    assert_eq!(relayed.connects(), 1);
    assert_eq!(hosted.connects(), 0);
    assert!(!controller.is_switching());

    let change = changes.try_recv().unwrap();
    assert_eq!(change.provider, RelayedP2p);
    assert_eq!(change.reason, "degraded");
    assert!(changes.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_switch_before_connect_fails() {
    let providers = [
        ScriptedProvider::succeeding(DirectP2p),
        ScriptedProvider::succeeding(RelayedP2p),
        ScriptedProvider::succeeding(HostedFallback),
    ];
    let controller = controller(SessionConfig::default(), &providers, None);

    let error = assert_err!(controller.switch_provider("degraded").await);
    assert_eq!(error.error_code(), "CONFIGURATION_ERROR");
}

#[tokio::test(start_paused = true)]
async fn test_release_cancels_pending_attempt() {
    let direct = ScriptedProvider::hanging(DirectP2p);
    let providers = [
        direct.clone(),
        ScriptedProvider::succeeding(RelayedP2p),
        ScriptedProvider::succeeding(HostedFallback),
    ];
    let controller = controller(SessionConfig::default(), &providers, None);

    let connecting = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.connect(request(), QualityTier::Good).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    connecting.abort();
    controller.release().await;

    let attempts = controller.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Failed);
    assert_eq!(attempts[0].reason.as_deref(), Some("cancelled"));
    assert_eq!(direct.disconnects(), 1);
    assert!(controller.active().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_release_disconnects_active_transport() {
    let direct = ScriptedProvider::succeeding(DirectP2p);
    let providers = [
        direct.clone(),
        ScriptedProvider::succeeding(RelayedP2p),
        ScriptedProvider::succeeding(HostedFallback),
    ];
    let controller = controller(SessionConfig::default(), &providers, None);

    assert_ok!(controller.connect(request(), QualityTier::Excellent).await);
    assert_ok!(controller.toggle_audio(false).await);
    assert_eq!(direct.toggles(), vec![("audio", false)]);

    controller.release().await;

    assert_eq!(direct.disconnects(), 1);
    let error = assert_err!(controller.toggle_video(true).await);
    assert_eq!(error.error_code(), "TRANSPORT_ERROR");
    assert_err!(controller.stats().await);
}

#[test]
fn test_every_configured_provider_needs_an_implementation() {
    let providers: Vec<Arc<dyn TransportProvider>> = vec![
        ScriptedProvider::succeeding(DirectP2p),
        ScriptedProvider::succeeding(HostedFallback),
    ];
    let error = assert_err!(ProviderController::new(
        SessionConfig::default(),
        providers,
        None
    ));
    assert!(error.to_string().contains("relayed_p2p"));
}

#[test]
fn test_duplicate_implementations_rejected() {
    let providers: Vec<Arc<dyn TransportProvider>> = vec![
        ScriptedProvider::succeeding(DirectP2p),
        ScriptedProvider::failing(DirectP2p),
        ScriptedProvider::succeeding(RelayedP2p),
        ScriptedProvider::succeeding(HostedFallback),
    ];
    let error = assert_err!(ProviderController::new(
        SessionConfig::default(),
        providers,
        None
    ));
    assert_eq!(error.error_code(), "CONFIGURATION_ERROR");
}

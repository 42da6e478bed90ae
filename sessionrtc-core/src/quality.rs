//! Network condition model and quality classification
//!
//! [`classify`] is the only place a [`QualityTier`] is derived. It is a pure,
//! total function of [`NetworkConditions`]: every input (including NaN and
//! out-of-range values) maps to exactly one tier, and equal inputs always map
//! to equal outputs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bits per megabit
pub const BITS_PER_MBIT: f64 = 1_000_000.0;

/// Coarse label for the underlying link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Link type could not be determined
    #[default]
    Unknown,
    /// Wired ethernet
    Ethernet,
    /// Wireless LAN
    Wifi,
    /// Mobile network
    Cellular,
}

/// Snapshot of measured network conditions
///
/// Replaced wholesale on every sample; never patched field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConditions {
    /// Bandwidth estimate in bits per second
    pub bandwidth_bps: f64,
    /// Round-trip latency in milliseconds
    pub rtt_ms: f64,
    /// Packet loss estimate in percent (0-100)
    pub loss_percent: f64,
    /// Whether latency was stable across the stability probes
    pub stable: bool,
    /// Link type label
    pub connection_type: ConnectionType,
}

impl NetworkConditions {
    /// Build conditions from a bandwidth in Mbps
    pub fn new(bandwidth_mbps: f64, rtt_ms: f64, loss_percent: f64, stable: bool) -> Self {
        Self {
            bandwidth_bps: bandwidth_mbps * BITS_PER_MBIT,
            rtt_ms,
            loss_percent,
            stable,
            connection_type: ConnectionType::Unknown,
        }
    }

    /// Conditions reported when every probe failed
    pub fn unreachable() -> Self {
        Self {
            bandwidth_bps: 0.0,
            rtt_ms: 0.0,
            loss_percent: 100.0,
            stable: false,
            connection_type: ConnectionType::Unknown,
        }
    }

    /// Bandwidth estimate in megabits per second
    pub fn bandwidth_mbps(&self) -> f64 {
        self.bandwidth_bps / BITS_PER_MBIT
    }

    /// Attach a link type label
    pub fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }
}

/// Discrete quality classification, ordered worst to best
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    /// No usable connectivity
    Failed,
    /// Barely usable
    Poor,
    /// Usable with reduced media quality
    Fair,
    /// Comfortable for audio and video
    Good,
    /// Best achievable
    Excellent,
}

impl QualityTier {
    /// Poor or worse
    pub fn is_degraded(self) -> bool {
        self <= QualityTier::Poor
    }

    /// Media quality hint for this tier
    pub fn video_hint(self) -> VideoQualityHint {
        match self {
            QualityTier::Excellent => VideoQualityHint::High,
            QualityTier::Good => VideoQualityHint::Standard,
            QualityTier::Fair => VideoQualityHint::Low,
            QualityTier::Poor | QualityTier::Failed => VideoQualityHint::AudioOnly,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QualityTier::Failed => "failed",
            QualityTier::Poor => "poor",
            QualityTier::Fair => "fair",
            QualityTier::Good => "good",
            QualityTier::Excellent => "excellent",
        };
        f.write_str(label)
    }
}

/// Video quality the media layer should target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoQualityHint {
    /// 720p and up
    High,
    /// 480p
    Standard,
    /// 240p
    Low,
    /// Video paused, audio only
    AudioOnly,
}

/// How the provider controller should reorder its priority list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportRecommendation {
    /// Move direct (non-relay) providers to the front
    PreferDirect,
    /// Keep the configured order
    KeepOrder,
    /// Demote relay-dependent high-bandwidth providers
    PreferLowBandwidth,
}

/// Output of [`classify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityAssessment {
    /// Quality tier
    pub tier: QualityTier,
    /// Provider ordering recommendation
    pub recommendation: TransportRecommendation,
}

impl QualityTier {
    /// Provider ordering recommendation for this tier
    pub fn recommendation(self) -> TransportRecommendation {
        match self {
            QualityTier::Excellent => TransportRecommendation::PreferDirect,
            QualityTier::Good | QualityTier::Fair => TransportRecommendation::KeepOrder,
            QualityTier::Poor | QualityTier::Failed => TransportRecommendation::PreferLowBandwidth,
        }
    }
}

/// Classify network conditions into a tier and a provider recommendation
///
/// Thresholds are strict on latency and loss and inclusive on bandwidth; any
/// comparison involving NaN fails, so malformed input lands in a lower tier.
pub fn classify(conditions: &NetworkConditions) -> QualityAssessment {
    let bw = conditions.bandwidth_mbps();
    let rtt = conditions.rtt_ms;
    let loss = conditions.loss_percent;

    let tier = if bw <= 0.0 && loss >= 100.0 {
        QualityTier::Failed
    } else if bw >= 3.0 && rtt < 150.0 && loss < 2.0 && conditions.stable {
        QualityTier::Excellent
    } else if bw >= 1.5 && rtt < 300.0 && loss < 5.0 {
        QualityTier::Good
    } else if bw >= 0.8 && rtt < 500.0 && loss < 8.0 {
        QualityTier::Fair
    } else {
        QualityTier::Poor
    };

    QualityAssessment {
        tier,
        recommendation: tier.recommendation(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excellent_conditions() {
        let conditions = NetworkConditions::new(4.0, 80.0, 0.5, true);
        let assessment = classify(&conditions);
        assert_eq!(assessment.tier, QualityTier::Excellent);
        assert_eq!(
            assessment.recommendation,
            TransportRecommendation::PreferDirect
        );
    }

    #[test]
    fn test_poor_conditions() {
        let conditions = NetworkConditions::new(1.0, 450.0, 6.0, false);
        assert_eq!(classify(&conditions).tier, QualityTier::Poor);
    }

    #[test]
    fn test_instability_caps_at_good() {
        let conditions = NetworkConditions::new(10.0, 20.0, 0.0, false);
        assert_eq!(classify(&conditions).tier, QualityTier::Good);
    }

    #[test]
    fn test_boundaries_resolve_downward() {
        // Latency exactly at the Excellent ceiling drops to Good
        assert_eq!(
            classify(&NetworkConditions::new(3.0, 150.0, 0.0, true)).tier,
            QualityTier::Good
        );
        // Loss exactly at the Good ceiling drops to Fair
        assert_eq!(
            classify(&NetworkConditions::new(2.0, 100.0, 5.0, true)).tier,
            QualityTier::Fair
        );
        // Bandwidth floors are inclusive
        assert_eq!(
            classify(&NetworkConditions::new(0.8, 499.0, 7.9, false)).tier,
            QualityTier::Fair
        );
    }

    #[test]
    fn test_unreachable_is_failed() {
        assert_eq!(
            classify(&NetworkConditions::unreachable()).tier,
            QualityTier::Failed
        );
    }

    #[test]
    fn test_nan_input_is_conservative() {
        let conditions = NetworkConditions::new(f64::NAN, f64::NAN, f64::NAN, true);
        assert_eq!(classify(&conditions).tier, QualityTier::Poor);
    }

    #[test]
    fn test_classification_is_total_and_deterministic() {
        let bandwidths = [0.0, 0.5, 0.8, 1.5, 3.0, 50.0, 100.0];
        let latencies = [0.0, 149.9, 150.0, 300.0, 499.0, 500.0, 5000.0];
        let losses = [0.0, 1.9, 2.0, 5.0, 7.9, 8.0, 100.0];

        for &bw in &bandwidths {
            for &rtt in &latencies {
                for &loss in &losses {
                    for stable in [true, false] {
                        let conditions = NetworkConditions::new(bw, rtt, loss, stable);
                        let first = classify(&conditions);
                        let second = classify(&conditions.clone());
                        assert_eq!(first, second);
                        assert_eq!(first.recommendation, first.tier.recommendation());
                    }
                }
            }
        }
    }

    #[test]
    fn test_tier_ordering() {
        assert!(QualityTier::Excellent > QualityTier::Good);
        assert!(QualityTier::Good > QualityTier::Fair);
        assert!(QualityTier::Fair > QualityTier::Poor);
        assert!(QualityTier::Poor > QualityTier::Failed);
        assert!(QualityTier::Failed.is_degraded());
        assert!(!QualityTier::Fair.is_degraded());
    }
}

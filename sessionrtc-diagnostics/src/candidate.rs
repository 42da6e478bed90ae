//! ICE candidate parsing

use serde::Serialize;
use sessionrtc_core::SessionError;
use std::fmt;
use std::str::FromStr;

/// Candidate type marker (`typ ...` in the candidate line)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateType {
    /// Local interface address
    Host,
    /// Address observed by a STUN server
    ServerReflexive,
    /// Address learned from a connectivity check
    PeerReflexive,
    /// Address allocated on a relay server
    Relay,
}

impl CandidateType {
    /// Parse the value following `typ`
    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker.to_ascii_lowercase().as_str() {
            "host" => Some(CandidateType::Host),
            "srflx" => Some(CandidateType::ServerReflexive),
            "prflx" => Some(CandidateType::PeerReflexive),
            "relay" => Some(CandidateType::Relay),
            _ => None,
        }
    }

    /// Marker as written in candidate lines
    pub fn marker(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }

    /// Whether the candidate proves the server answered
    pub fn is_server_derived(self) -> bool {
        matches!(
            self,
            CandidateType::ServerReflexive | CandidateType::PeerReflexive | CandidateType::Relay
        )
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// A parsed `candidate:` line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IceCandidate {
    /// Foundation
    pub foundation: String,
    /// Component id (1 = RTP)
    pub component: u32,
    /// Transport protocol (udp/tcp)
    pub protocol: String,
    /// Priority
    pub priority: u32,
    /// Connection address
    pub address: String,
    /// Connection port
    pub port: u16,
    /// Candidate type
    pub candidate_type: CandidateType,
}

fn malformed(line: &str, reason: &str) -> SessionError {
    SessionError::ProbeFailure {
        probe: "candidate_parse".to_string(),
        reason: format!("{}: {}", reason, line),
    }
}

impl FromStr for IceCandidate {
    type Err = SessionError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let trimmed = line.trim();
        let body = trimmed.strip_prefix("a=").unwrap_or(trimmed);
        let body = body.strip_prefix("candidate:").unwrap_or(body);

        let tokens: Vec<&str> = body.split_whitespace().collect();
        if tokens.len() < 8 {
            return Err(malformed(line, "too few fields"));
        }
        if !tokens[6].eq_ignore_ascii_case("typ") {
            return Err(malformed(line, "missing typ marker"));
        }

        let candidate_type = CandidateType::from_marker(tokens[7])
            .ok_or_else(|| malformed(line, "unknown candidate type"))?;
        let component = tokens[1]
            .parse()
            .map_err(|_| malformed(line, "invalid component"))?;
        let priority = tokens[3]
            .parse()
            .map_err(|_| malformed(line, "invalid priority"))?;
        let port = tokens[5]
            .parse()
            .map_err(|_| malformed(line, "invalid port"))?;

        Ok(IceCandidate {
            foundation: tokens[0].to_string(),
            component,
            protocol: tokens[2].to_ascii_lowercase(),
            priority,
            address: tokens[4].to_string(),
            port,
            candidate_type,
        })
    }
}

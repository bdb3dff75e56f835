use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use serde::Deserialize;

use crate::nat::{Candidate, CandidateKind};

/// Records older than this are treated as offline regardless of their
/// `is_online` flag.
pub const HEARTBEAT_MAX_AGE_SECS: u64 = 600;

#[derive(Debug)]
pub struct DirectoryError(pub String);

impl std::error::Error for DirectoryError {}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "signaling directory: {}", self.0)
    }
}

/// One candidate as the directory publishes it.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryCandidate {
    #[serde(rename = "type")]
    pub kind: String,
    pub ip: IpAddr,
    pub port: u16,
    pub priority: u32,
}

/// A host as the signaling directory reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct HostRecord {
    pub user_id: String,
    pub device_name: String,
    pub local_ip: IpAddr,
    pub local_port: u16,
    #[serde(default)]
    pub public_ip: Option<IpAddr>,
    #[serde(default)]
    pub public_port: Option<u16>,
    pub is_online: bool,
    /// unix seconds of the host's last directory heartbeat.
    pub last_heartbeat: u64,
    #[serde(default)]
    pub ice_candidates: Option<Vec<DirectoryCandidate>>,
}

impl HostRecord {
    pub fn is_usable(&self, now_unix: u64) -> bool {
        self.is_online && now_unix.saturating_sub(self.last_heartbeat) < HEARTBEAT_MAX_AGE_SECS
    }

    /// synthesize the trial list: the LAN endpoint, the NAT-mapped endpoint
    /// when known, and whatever explicit candidates the host published.
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut candidates = vec![Candidate::host(SocketAddr::new(self.local_ip, self.local_port))];

        if let (Some(ip), Some(port)) = (self.public_ip, self.public_port) {
            candidates.push(Candidate::server_reflexive(SocketAddr::new(ip, port)));
        }

        for it in self.ice_candidates.iter().flatten() {
            let kind = match it.kind.as_str() {
                "host" => CandidateKind::Host,
                "srflx" => CandidateKind::ServerReflexive,
                "relay" => CandidateKind::Relay,
                other => {
                    log::debug!("ignoring unknown candidate type: {}", other);
                    continue;
                }
            };

            candidates.push(Candidate {
                kind,
                address: SocketAddr::new(it.ip, it.port),
                priority: it.priority,
            });
        }

        candidates
    }
}

/// The two primitives the core consumes from the cloud directory. The
/// directory client itself (HTTP, database, whatever) lives outside the
/// core and is injected as a handle, never reached through a global.
#[async_trait]
pub trait SignalingDirectory: Send + Sync {
    async fn publish_endpoint(&self, listen_port: u16, user_id: &str)
    -> Result<(), DirectoryError>;

    async fn fetch_host_candidates(
        &self,
        target_user: &str,
    ) -> Result<Vec<HostRecord>, DirectoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(is_online: bool, last_heartbeat: u64) -> HostRecord {
        HostRecord {
            user_id: "bob".into(),
            device_name: "studio".into(),
            local_ip: "192.168.1.10".parse().unwrap(),
            local_port: 5000,
            public_ip: Some("203.0.113.5".parse().unwrap()),
            public_port: Some(40000),
            is_online,
            last_heartbeat,
            ice_candidates: None,
        }
    }

    #[test]
    fn usability_window() {
        assert!(record(true, 1_000).is_usable(1_000 + 599));
        assert!(!record(true, 1_000).is_usable(1_000 + 600));
        assert!(!record(false, 1_000).is_usable(1_000 + 1));
    }

    #[test]
    fn candidates_from_record_endpoints() {
        let candidates = record(true, 0).candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].kind, CandidateKind::Host);
        assert_eq!(candidates[0].address, "192.168.1.10:5000".parse().unwrap());
        assert_eq!(candidates[1].kind, CandidateKind::ServerReflexive);
        assert_eq!(candidates[1].address, "203.0.113.5:40000".parse().unwrap());
    }

    #[test]
    fn explicit_candidate_json_is_merged() {
        let mut host = record(true, 0);
        host.ice_candidates = Some(
            serde_json::from_str(
                r#"[
                    {"type": "relay", "ip": "198.51.100.4", "port": 49200, "priority": 100},
                    {"type": "mystery", "ip": "198.51.100.4", "port": 1, "priority": 1}
                ]"#,
            )
            .unwrap(),
        );

        let candidates = host.candidates();
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[2].kind, CandidateKind::Relay);
        assert_eq!(candidates[2].priority, 100);
    }
}

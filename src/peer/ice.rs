use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

/// Reads the `typ` attribute of an SDP candidate line
pub fn candidate_kind(candidate: &str) -> CandidateKind {
    let mut parts = candidate.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "typ" {
            return match parts.next() {
                Some("host") => CandidateKind::Host,
                Some("srflx") => CandidateKind::ServerReflexive,
                Some("prflx") => CandidateKind::PeerReflexive,
                Some("relay") => CandidateKind::Relay,
                _ => CandidateKind::Unknown,
            };
        }
    }
    CandidateKind::Unknown
}

/// Counts local candidates by kind for connection diagnostics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CandidateTally {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateTally {
    pub fn record(&mut self, candidate: &str) {
        match candidate_kind(candidate) {
            CandidateKind::Host => self.host += 1,
            CandidateKind::ServerReflexive => self.srflx += 1,
            CandidateKind::Relay => self.relay += 1,
            CandidateKind::PeerReflexive | CandidateKind::Unknown => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    pub fn log_summary(&self) {
        debug!(
            host = self.host,
            srflx = self.srflx,
            relay = self.relay,
            other = self.other,
            "local candidate summary"
        );
        if self.total() > 0 && self.relay == 0 {
            warn!("no TURN relay candidates gathered, connections across strict NATs may fail");
        }
    }
}

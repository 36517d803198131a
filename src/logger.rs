use crate::peer::ice::candidate_kind;
use tracing::{debug, info};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Installs the global subscriber. `RUST_LOG` wins over the build-dependent default.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("gyrolink={}", crate::config::default_log_level()))
    });

    // a second init (tests, embedding apps) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .try_init();
}

/// Trickle-ICE trace of a candidate as it is produced
pub fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            label,
            kind = ?candidate_kind(&init.candidate),
            candidate = %init.candidate,
            sdp_mid = ?init.sdp_mid,
            sdp_mline_index = ?init.sdp_mline_index,
            "trickle candidate"
        );
    }
}

/// Snapshot of getStats: the nominated candidate pair
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                info!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}

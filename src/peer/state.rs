use std::time::Duration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// How long a link may sit in Disconnected before recovery is reported as failed
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTrigger {
    /// Negotiation started (offer created or accepted)
    Start,
    /// Transport reports an established connection
    Established,
    /// Transient loss
    Lost,
    /// Transport is re-checking after a transient loss
    Recovering,
    /// Unrecoverable negotiation or ICE failure
    Fail,
    /// Explicit teardown
    Close,
}

impl LinkState {
    pub const ALL: [LinkState; 6] = [
        LinkState::New,
        LinkState::Connecting,
        LinkState::Connected,
        LinkState::Disconnected,
        LinkState::Failed,
        LinkState::Closed,
    ];

    /// The link transition function. `None` means the trigger does not apply
    /// in this state and is ignored.
    pub fn next(self, trigger: LinkTrigger) -> Option<LinkState> {
        use LinkState::*;
        use LinkTrigger::*;

        match (self, trigger) {
            (Closed, _) => None,
            (_, Close) => Some(Closed),
            (Failed, _) => None,
            (_, Fail) => Some(Failed),
            (New, Start) => Some(Connecting),
            (Connecting, Established) => Some(Connected),
            (Connecting | Connected, Lost) => Some(Disconnected),
            (Disconnected, Recovering) => Some(Connecting),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

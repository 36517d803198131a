use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    WaitingForPeer,
    Paired,
    Closed,
}

/// One pairing attempt, as seen by this endpoint
#[derive(Debug, Clone)]
pub struct Session {
    session_id: Option<String>,
    endpoint_id: Option<String>,
    peer_id: Option<String>,
    state: SessionState,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            session_id: None,
            endpoint_id: None,
            peer_id: None,
            state: SessionState::Created,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Relay-assigned id of this endpoint
    pub fn endpoint_id(&self) -> Option<&str> {
        self.endpoint_id.as_deref()
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// `session-created`. A source learns its viewer here, which pairs it immediately.
    pub fn on_created(&mut self, session_id: String, endpoint_id: String, peer_id: Option<String>) {
        if self.state == SessionState::Closed {
            return;
        }
        info!(%session_id, %endpoint_id, "session created");
        self.session_id = Some(session_id);
        self.endpoint_id = Some(endpoint_id);
        self.state = match peer_id {
            Some(_) => SessionState::Paired,
            None => SessionState::WaitingForPeer,
        };
        self.peer_id = peer_id;
    }

    /// `peer-joined`. Returns the peer this one replaced, if any.
    pub fn on_peer_joined(&mut self, peer_id: String) -> Option<String> {
        if self.state == SessionState::Closed {
            return None;
        }
        info!(%peer_id, "peer joined");
        self.state = SessionState::Paired;
        self.peer_id.replace(peer_id)
    }

    pub fn on_peer_left(&mut self) -> Option<String> {
        if self.state != SessionState::Paired {
            return None;
        }
        let left = self.peer_id.take();
        debug!(peer_id = ?left, "peer left, waiting for a new one");
        self.state = SessionState::WaitingForPeer;
        left
    }

    /// Signaling connection ended
    pub fn close(&mut self) {
        self.peer_id = None;
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_lifecycle() {
        let mut session = Session::new();
        assert_eq!(session.state(), SessionState::Created);

        session.on_created("S1".into(), "V1".into(), None);
        assert_eq!(session.state(), SessionState::WaitingForPeer);
        assert_eq!(session.session_id(), Some("S1"));

        assert_eq!(session.on_peer_joined("P1".into()), None);
        assert_eq!(session.state(), SessionState::Paired);
        assert_eq!(session.peer_id(), Some("P1"));

        assert_eq!(session.on_peer_joined("P2".into()), Some("P1".into()));

        assert_eq!(session.on_peer_left(), Some("P2".into()));
        assert_eq!(session.state(), SessionState::WaitingForPeer);
        assert_eq!(session.peer_id(), None);
    }

    #[test]
    fn source_is_paired_on_creation() {
        let mut session = Session::new();
        session.on_created("S1".into(), "P1".into(), Some("V1".into()));
        assert_eq!(session.state(), SessionState::Paired);
        assert_eq!(session.peer_id(), Some("V1"));
        assert_eq!(session.endpoint_id(), Some("P1"));
    }

    #[test]
    fn closed_is_final() {
        let mut session = Session::new();
        session.on_created("S1".into(), "V1".into(), None);
        session.close();
        assert_eq!(session.on_peer_joined("P1".into()), None);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.peer_id(), None);
    }
}

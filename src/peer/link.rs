//! Transport-independent negotiator for one direct peer link.
//!
//! Every input returns the actions the event loop must carry out; the link
//! itself never touches a socket. The WebRTC side lives in `connection.rs`.

use crate::peer::state::{LinkState, LinkTrigger, TransportState, GRACE_PERIOD};
use crate::peer::types::{IceCandidate, NegotiationRole, SdpKind, SessionDescription};
use crate::signaling::protocol::SignalMessage;
use crate::telemetry::{TelemetryChannel, TextSink};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Work for the transport worker, executed strictly in order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    OpenTelemetryChannel,
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    Transport(TransportCommand),
    Signal(SignalMessage),
}

pub struct PeerLink {
    generation: u64,
    local_id: Option<String>,
    remote_id: String,
    role: NegotiationRole,
    state: LinkState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: Vec<IceCandidate>,
    making_offer: bool,
    channel: Option<TelemetryChannel>,
    disconnected_since: Option<Instant>,
    recovery_reported: bool,
}

impl PeerLink {
    fn new(generation: u64, role: NegotiationRole, local_id: Option<String>, remote_id: String) -> Self {
        Self {
            generation,
            local_id,
            remote_id,
            role,
            state: LinkState::New,
            local_description: None,
            remote_description: None,
            pending_candidates: Vec::new(),
            making_offer: false,
            channel: None,
            disconnected_since: None,
            recovery_reported: false,
        }
    }

    pub fn offerer(generation: u64, local_id: Option<String>, remote_id: impl Into<String>) -> Self {
        Self::new(generation, NegotiationRole::Offerer, local_id, remote_id.into())
    }

    pub fn answerer(generation: u64, local_id: Option<String>, remote_id: impl Into<String>) -> Self {
        Self::new(generation, NegotiationRole::Answerer, local_id, remote_id.into())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    /// The peer with the smaller endpoint id yields on glare
    fn is_polite(&self) -> bool {
        match &self.local_id {
            Some(local) => local.as_str() < self.remote_id.as_str(),
            None => true,
        }
    }

    /// True when an incoming offer collides with ours and we are the side
    /// that gives way. The colliding link cannot answer on its own transport;
    /// the owner replaces it with a fresh answerer.
    pub fn yields_to_offer(&self) -> bool {
        self.making_offer && self.is_polite()
    }

    /// Hands over buffered remote candidates, for a replacement link
    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }

    fn transition(&mut self, trigger: LinkTrigger) -> Option<LinkState> {
        let next = self.state.next(trigger)?;
        if next != self.state {
            info!(
                generation = self.generation,
                from = ?self.state,
                to = ?next,
                "link state changed"
            );
            self.state = next;
        }
        Some(next)
    }

    /// Offerer kick-off: open the telemetry channel, then create the offer
    pub fn start(&mut self) -> Vec<LinkAction> {
        if self.role != NegotiationRole::Offerer || self.state != LinkState::New {
            return Vec::new();
        }
        self.transition(LinkTrigger::Start);
        self.making_offer = true;
        vec![
            LinkAction::Transport(TransportCommand::OpenTelemetryChannel),
            LinkAction::Transport(TransportCommand::CreateOffer),
        ]
    }

    /// A description produced by our transport; stored and sent to the peer
    pub fn on_local_description(&mut self, description: SessionDescription) -> Vec<LinkAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        let expected = match self.role {
            NegotiationRole::Offerer => SdpKind::Offer,
            NegotiationRole::Answerer => SdpKind::Answer,
        };
        if description.kind != expected {
            // an offer from before we switched to answering
            debug!(kind = ?description.kind, role = ?self.role, "dropping stale local description");
            return Vec::new();
        }

        self.local_description = Some(description.clone());
        let target_id = Some(self.remote_id.clone());
        let sender_id = self.local_id.clone();
        let message = match description.kind {
            SdpKind::Offer => SignalMessage::Offer { target_id, sender_id, description },
            SdpKind::Answer => SignalMessage::Answer { target_id, sender_id, description },
        };
        vec![LinkAction::Signal(message)]
    }

    pub fn on_remote_description(&mut self, description: SessionDescription) -> Vec<LinkAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        match description.kind {
            SdpKind::Offer => self.accept_offer(description),
            SdpKind::Answer => self.accept_answer(description),
        }
    }

    fn accept_offer(&mut self, description: SessionDescription) -> Vec<LinkAction> {
        let mut actions = Vec::new();
        if self.making_offer {
            if self.is_polite() {
                debug!(remote = %self.remote_id, "offer collision, link must be replaced to answer");
            } else {
                debug!(remote = %self.remote_id, "offer collision, keeping our own offer");
            }
            return actions;
        }
        self.role = NegotiationRole::Answerer;
        if self.state == LinkState::New {
            self.transition(LinkTrigger::Start);
        }

        self.apply_remote(description, &mut actions);
        actions.push(LinkAction::Transport(TransportCommand::CreateAnswer));
        actions
    }

    fn accept_answer(&mut self, description: SessionDescription) -> Vec<LinkAction> {
        if !self.making_offer {
            warn!(remote = %self.remote_id, "answer without an outstanding offer, ignoring");
            return Vec::new();
        }
        self.making_offer = false;
        let mut actions = Vec::new();
        self.apply_remote(description, &mut actions);
        actions
    }

    /// Last writer wins; buffered candidates follow in arrival order
    fn apply_remote(&mut self, description: SessionDescription, actions: &mut Vec<LinkAction>) {
        self.remote_description = Some(description.clone());
        actions.push(LinkAction::Transport(TransportCommand::SetRemoteDescription(description)));
        if !self.pending_candidates.is_empty() {
            debug!(count = self.pending_candidates.len(), "flushing buffered remote candidates");
        }
        actions.extend(
            self.pending_candidates
                .drain(..)
                .map(|c| LinkAction::Transport(TransportCommand::AddCandidate(c))),
        );
    }

    pub fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Vec<LinkAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        if self.remote_description.is_none() {
            self.pending_candidates.push(candidate);
            return Vec::new();
        }
        vec![LinkAction::Transport(TransportCommand::AddCandidate(candidate))]
    }

    /// Trickle: each local candidate goes out as soon as it is gathered
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Vec<LinkAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        vec![LinkAction::Signal(SignalMessage::IceCandidate {
            target_id: Some(self.remote_id.clone()),
            sender_id: self.local_id.clone(),
            candidate,
        })]
    }

    /// Folds a transport state report into the link state. Returns the new
    /// state when it changed.
    pub fn on_transport_state(&mut self, reported: TransportState, now: Instant) -> Option<LinkState> {
        let before = self.state;
        match reported {
            TransportState::New => {}
            TransportState::Connecting => {
                if self.state == LinkState::Disconnected {
                    self.transition(LinkTrigger::Recovering);
                }
            }
            TransportState::Connected => {
                if self.state == LinkState::Disconnected {
                    self.transition(LinkTrigger::Recovering);
                }
                if self.transition(LinkTrigger::Established).is_some() {
                    self.disconnected_since = None;
                    self.recovery_reported = false;
                }
            }
            TransportState::Disconnected => {
                if self.transition(LinkTrigger::Lost).is_some() {
                    self.disconnected_since = Some(now);
                    self.recovery_reported = false;
                }
            }
            TransportState::Failed => {
                self.transition(LinkTrigger::Fail);
            }
            TransportState::Closed => {
                self.transition(LinkTrigger::Close);
            }
        }
        (self.state != before).then_some(self.state)
    }

    pub fn on_negotiation_failed(&mut self, reason: &str) -> Option<LinkState> {
        warn!(generation = self.generation, reason, "negotiation failed");
        self.making_offer = false;
        self.transition(LinkTrigger::Fail)
    }

    /// True exactly once per outage, when Disconnected outlasts the grace period
    pub fn check_grace(&mut self, now: Instant) -> bool {
        if self.state != LinkState::Disconnected || self.recovery_reported {
            return false;
        }
        match self.disconnected_since {
            Some(since) if now.saturating_duration_since(since) >= GRACE_PERIOD => {
                warn!(generation = self.generation, "link did not recover within the grace period");
                self.recovery_reported = true;
                true
            }
            _ => false,
        }
    }

    /// Teardown. Buffered candidates are discarded, never flushed.
    pub fn close(&mut self) -> Vec<LinkAction> {
        if self.state == LinkState::Closed {
            return Vec::new();
        }
        self.pending_candidates.clear();
        self.making_offer = false;
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
        self.transition(LinkTrigger::Close);
        vec![LinkAction::Transport(TransportCommand::Close)]
    }

    /// Binds the telemetry channel. Only the first one counts.
    pub fn attach_channel(&mut self, sink: Arc<dyn TextSink>) -> bool {
        if self.channel.is_some() || self.state.is_terminal() {
            warn!(generation = self.generation, "ignoring extra data channel");
            sink.close();
            return false;
        }
        self.channel = Some(TelemetryChannel::new(sink));
        true
    }

    pub fn channel(&self) -> Option<&TelemetryChannel> {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> Option<&mut TelemetryChannel> {
        self.channel.as_mut()
    }

    pub fn channel_open(&self) -> bool {
        self.channel.as_ref().is_some_and(TelemetryChannel::is_open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::tests::RecordingSink;
    use std::time::Duration;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn transport(actions: &[LinkAction]) -> Vec<TransportCommand> {
        actions
            .iter()
            .filter_map(|a| match a {
                LinkAction::Transport(cmd) => Some(cmd.clone()),
                LinkAction::Signal(_) => None,
            })
            .collect()
    }

    #[test]
    fn offerer_opens_channel_before_offering() {
        let mut link = PeerLink::offerer(1, Some("V1".into()), "P1");
        let actions = link.start();
        assert_eq!(
            transport(&actions),
            vec![TransportCommand::OpenTelemetryChannel, TransportCommand::CreateOffer]
        );
        assert_eq!(link.state(), LinkState::Connecting);
        assert!(link.start().is_empty());
    }

    #[test]
    fn local_offer_is_sent_to_the_peer() {
        let mut link = PeerLink::offerer(1, Some("V1".into()), "P1");
        link.start();
        let actions = link.on_local_description(SessionDescription::offer("v=0 offer"));
        match &actions[..] {
            [LinkAction::Signal(msg @ SignalMessage::Offer { .. })] => {
                assert_eq!(msg.target_id(), Some("P1"));
            }
            other => panic!("unexpected actions {other:?}"),
        }
        assert!(link.local_description().is_some());
    }

    #[test]
    fn early_candidates_wait_for_the_remote_description() {
        let mut link = PeerLink::answerer(1, Some("P1".into()), "V1");
        assert!(link.on_remote_candidate(candidate(1)).is_empty());
        assert!(link.on_remote_candidate(candidate(2)).is_empty());
        assert_eq!(link.pending_candidates().len(), 2);

        let actions = link.on_remote_description(SessionDescription::offer("v=0"));
        assert_eq!(
            transport(&actions),
            vec![
                TransportCommand::SetRemoteDescription(SessionDescription::offer("v=0")),
                TransportCommand::AddCandidate(candidate(1)),
                TransportCommand::AddCandidate(candidate(2)),
                TransportCommand::CreateAnswer,
            ]
        );
        assert!(link.pending_candidates().is_empty());

        // later candidates go straight through
        assert_eq!(
            transport(&link.on_remote_candidate(candidate(3))),
            vec![TransportCommand::AddCandidate(candidate(3))]
        );
    }

    #[test]
    fn answerer_sends_its_answer() {
        let mut link = PeerLink::answerer(1, Some("P1".into()), "V1");
        link.on_remote_description(SessionDescription::offer("v=0"));
        assert_eq!(link.state(), LinkState::Connecting);
        let actions = link.on_local_description(SessionDescription::answer("v=0 answer"));
        assert!(matches!(
            &actions[..],
            [LinkAction::Signal(SignalMessage::Answer { target_id: Some(t), .. })] if t == "V1"
        ));
    }

    #[test]
    fn polite_peer_yields_on_glare() {
        let mut link = PeerLink::offerer(1, Some("a".into()), "b");
        assert!(!link.yields_to_offer());
        link.start();
        assert!(link.yields_to_offer());

        // the colliding offer is never applied to the offering transport
        assert!(link.on_remote_description(SessionDescription::offer("theirs")).is_empty());
        assert!(link.remote_description().is_none());
        assert_eq!(link.role(), NegotiationRole::Offerer);
    }

    #[test]
    fn pending_candidates_can_be_handed_over() {
        let mut link = PeerLink::offerer(1, Some("a".into()), "b");
        link.start();
        link.on_remote_candidate(candidate(1));
        link.on_remote_candidate(candidate(2));
        assert_eq!(link.take_pending_candidates(), vec![candidate(1), candidate(2)]);
        assert!(link.pending_candidates().is_empty());
    }

    #[test]
    fn impolite_peer_ignores_colliding_offer() {
        let mut link = PeerLink::offerer(1, Some("b".into()), "a");
        link.start();
        assert!(!link.yields_to_offer());
        assert!(link.on_remote_description(SessionDescription::offer("theirs")).is_empty());
        assert!(link.is_making_offer());
        assert_eq!(link.role(), NegotiationRole::Offerer);
        assert!(link.remote_description().is_none());
    }

    #[test]
    fn answer_without_offer_is_ignored() {
        let mut link = PeerLink::answerer(1, Some("P1".into()), "V1");
        assert!(link.on_remote_description(SessionDescription::answer("v=0")).is_empty());
        assert!(link.remote_description().is_none());
    }

    #[test]
    fn renegotiation_offer_replaces_remote_description() {
        let mut link = PeerLink::offerer(1, Some("V1".into()), "P1");
        link.start();
        link.on_remote_description(SessionDescription::answer("first"));
        link.on_transport_state(TransportState::Connected, Instant::now());
        link.on_remote_description(SessionDescription::offer("second"));
        assert_eq!(link.remote_description().map(|d| d.sdp.as_str()), Some("second"));
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn close_discards_pending_candidates() {
        let sink = Arc::new(RecordingSink::default());
        let mut link = PeerLink::answerer(1, Some("P1".into()), "V1");
        link.on_remote_candidate(candidate(1));
        assert!(link.attach_channel(sink.clone()));

        let actions = link.close();
        assert_eq!(transport(&actions), vec![TransportCommand::Close]);
        assert!(link.pending_candidates().is_empty());
        assert_eq!(link.state(), LinkState::Closed);
        assert!(*sink.closed.lock().unwrap());

        assert!(link.close().is_empty());
        assert!(link.on_remote_description(SessionDescription::offer("late")).is_empty());
    }

    #[test]
    fn reconnect_passes_through_connecting() {
        let now = Instant::now();
        let mut link = PeerLink::offerer(1, Some("V1".into()), "P1");
        link.start();
        assert_eq!(link.on_transport_state(TransportState::Connected, now), Some(LinkState::Connected));
        assert_eq!(
            link.on_transport_state(TransportState::Disconnected, now),
            Some(LinkState::Disconnected)
        );
        assert_eq!(link.on_transport_state(TransportState::Connected, now), Some(LinkState::Connected));
        assert_eq!(link.on_transport_state(TransportState::Connected, now), None);
    }

    #[test]
    fn grace_period_is_reported_once() {
        let start = Instant::now();
        let mut link = PeerLink::offerer(1, Some("V1".into()), "P1");
        link.start();
        link.on_transport_state(TransportState::Connected, start);
        link.on_transport_state(TransportState::Disconnected, start);

        assert!(!link.check_grace(start + Duration::from_secs(1)));
        assert!(link.check_grace(start + GRACE_PERIOD));
        assert!(!link.check_grace(start + GRACE_PERIOD * 2));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[test]
    fn negotiation_failure_is_terminal() {
        let mut link = PeerLink::offerer(1, Some("V1".into()), "P1");
        link.start();
        assert_eq!(link.on_negotiation_failed("boom"), Some(LinkState::Failed));
        assert_eq!(link.on_transport_state(TransportState::Connected, Instant::now()), None);
        assert_eq!(link.state(), LinkState::Failed);
    }

    #[test]
    fn second_channel_is_ignored() {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let mut link = PeerLink::offerer(1, Some("V1".into()), "P1");
        assert!(link.attach_channel(first));
        assert!(!link.attach_channel(second.clone()));
        assert!(*second.closed.lock().unwrap());
        assert!(!link.channel_open());
        link.channel_mut().unwrap().on_open();
        assert!(link.channel_open());
    }
}

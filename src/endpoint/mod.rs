//! Endpoint event loops.
//!
//! Each endpoint is one task selecting over a single event queue and a tick.
//! WebRTC callbacks and the relay reader only push into that queue; all
//! state is owned by the loop.

pub mod sensor;
pub mod source;
pub mod viewer;

#[cfg(test)]
pub(crate) mod testing;

use crate::calibration::CalibrationState;
use crate::history::HistorySnapshot;
use crate::peer::connection::{LinkEvent, LinkTransport, TransportFactory};
use crate::peer::link::{LinkAction, PeerLink};
use crate::peer::state::LinkState;
use crate::peer::types::SdpKind;
use crate::signaling::client::NegotiationMessage;
use crate::signaling::protocol::SignalMessage;
use crate::telemetry::{TelemetryFrame, TelemetryMessage};
use glam::DQuat;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub use source::{spawn_source, SourceCore, SourceHandle};
pub use viewer::{spawn_viewer, ViewerCore, ViewerHandle};

/// Housekeeping cadence: calibration timeout and grace period checks
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

pub enum EndpointEvent {
    Signal(SignalMessage),
    SignalingClosed,
    Link { generation: u64, event: LinkEvent },
    Command(Command),
}

pub type EventSender = mpsc::UnboundedSender<EndpointEvent>;

/// Requests from the local user / embedding app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    RequestCalibration,
    Shutdown,
}

/// Everything the external renderer consumes
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerUpdate {
    Session { session_id: String, pairing_url: String },
    PeerJoined { peer_id: String },
    PeerLeft,
    Link(LinkState),
    /// Transient loss, recovery in progress
    ConnectionProblem,
    /// Still disconnected after the grace period
    RecoveryFailed,
    Orientation(DQuat),
    History(HistorySnapshot),
    Calibration(CalibrationState),
}

pub(crate) trait EndpointCore {
    fn handle(&mut self, event: EndpointEvent, now: Instant) -> ControlFlow<()>;
    fn tick(&mut self, now: Instant);
    fn shutdown(&mut self);
}

pub(crate) async fn run_loop<C: EndpointCore>(
    mut core: C,
    mut events: mpsc::UnboundedReceiver<EndpointEvent>,
    tick_every: Duration,
) {
    let mut ticker = tokio::time::interval(tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if core.handle(event, Instant::now()).is_break() {
                    break;
                }
            }
            _ = ticker.tick() => core.tick(Instant::now()),
        }
    }
    core.shutdown();
    debug!("endpoint loop stopped");
}

/// What a link event means for the endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum SlotOutput {
    Signal(SignalMessage),
    State(LinkState),
    Frames(Vec<TelemetryFrame>),
    ChannelOpened,
    ChannelClosed,
}

struct ActiveLink {
    link: PeerLink,
    transport: Box<dyn LinkTransport>,
}

/// Holds the one active link of a session, replacing it on every new pairing
pub struct LinkSlot {
    factory: Box<dyn TransportFactory>,
    events: EventSender,
    next_generation: u64,
    active: Option<ActiveLink>,
}

impl LinkSlot {
    pub fn new(factory: Box<dyn TransportFactory>, events: EventSender) -> Self {
        Self {
            factory,
            events,
            next_generation: 1,
            active: None,
        }
    }

    pub fn link(&self) -> Option<&PeerLink> {
        self.active.as_ref().map(|a| &a.link)
    }

    pub fn channel_open(&self) -> bool {
        self.link().is_some_and(PeerLink::channel_open)
    }

    fn install(&mut self, build: impl FnOnce(u64) -> PeerLink) -> &mut ActiveLink {
        self.teardown();
        let generation = self.next_generation;
        self.next_generation += 1;
        let link = build(generation);
        info!(generation, remote = link.remote_id(), role = ?link.role(), "new peer link");
        let transport = self.factory.create(generation, self.events.clone());
        self.active.insert(ActiveLink { link, transport })
    }

    /// Replaces any link with an offerer towards `remote_id` and starts it
    pub fn open_offerer(&mut self, local_id: Option<String>, remote_id: &str) -> Vec<SignalMessage> {
        let active = self.install(|generation| PeerLink::offerer(generation, local_id, remote_id));
        let actions = active.link.start();
        self.dispatch(actions)
    }

    pub fn open_answerer(&mut self, local_id: Option<String>, remote_id: &str) {
        self.install(|generation| PeerLink::answerer(generation, local_id, remote_id));
    }

    /// Closes the active link. Returns true when there was one.
    pub fn teardown(&mut self) -> bool {
        match self.active.take() {
            Some(mut active) => {
                for action in active.link.close() {
                    if let LinkAction::Transport(command) = action {
                        active.transport.execute(command);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Negotiation from the peer. A message from a peer with no live link
    /// creates an answerer for it.
    pub fn on_negotiation(
        &mut self,
        local_id: Option<String>,
        from: &str,
        message: NegotiationMessage,
    ) -> Vec<SignalMessage> {
        let is_offer = matches!(
            &message,
            NegotiationMessage::Description(d) if d.kind == SdpKind::Offer
        );
        let glare = is_offer
            && self
                .link()
                .is_some_and(|link| link.remote_id() == from && link.yields_to_offer());
        let needs_link = glare
            || match self.link() {
                None => true,
                Some(link) => link.remote_id() != from || (is_offer && link.state().is_terminal()),
            };
        if needs_link {
            // remote candidates buffered by the yielding offerer belong to the incoming offer
            let carried = match (glare, self.active.as_mut()) {
                (true, Some(active)) => active.link.take_pending_candidates(),
                _ => Vec::new(),
            };
            if glare {
                info!(remote = from, "offer collision, answering on a fresh link");
            }
            self.open_answerer(local_id, from);
            if let Some(active) = self.active.as_mut() {
                for candidate in carried {
                    active.link.on_remote_candidate(candidate);
                }
            }
        }

        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        let actions = match message {
            NegotiationMessage::Description(description) => active.link.on_remote_description(description),
            NegotiationMessage::Candidate(candidate) => active.link.on_remote_candidate(candidate),
        };
        self.dispatch(actions)
    }

    /// Routes a transport event to the link it belongs to. Events from an
    /// older generation are dropped.
    pub fn handle(&mut self, generation: u64, event: LinkEvent, now: Instant) -> Vec<SlotOutput> {
        let Some(active) = self.active.as_mut().filter(|a| a.link.generation() == generation) else {
            debug!(generation, event = event.name(), "discarding event from a stale link");
            if let LinkEvent::ChannelReady(sink) = event {
                sink.close();
            }
            return Vec::new();
        };

        let link = &mut active.link;
        let actions = match event {
            LinkEvent::LocalDescription(description) => link.on_local_description(description),
            LinkEvent::LocalCandidate(candidate) => link.on_local_candidate(candidate),
            LinkEvent::State(reported) => {
                return link.on_transport_state(reported, now).map(SlotOutput::State).into_iter().collect();
            }
            LinkEvent::NegotiationFailed(reason) => {
                return link.on_negotiation_failed(&reason).map(SlotOutput::State).into_iter().collect();
            }
            LinkEvent::ChannelReady(sink) => {
                link.attach_channel(sink);
                return Vec::new();
            }
            LinkEvent::ChannelOpen => {
                return match link.channel_mut() {
                    Some(channel) => {
                        channel.on_open();
                        vec![SlotOutput::ChannelOpened]
                    }
                    None => Vec::new(),
                };
            }
            LinkEvent::ChannelMessage(raw) => {
                // malformed input is counted and logged by the channel
                return match link.channel_mut().map(|channel| channel.on_message(&raw)) {
                    Some(Ok(frames)) => vec![SlotOutput::Frames(frames)],
                    _ => Vec::new(),
                };
            }
            LinkEvent::ChannelClosed => {
                return match link.channel_mut() {
                    Some(channel) => {
                        channel.on_close();
                        vec![SlotOutput::ChannelClosed]
                    }
                    None => Vec::new(),
                };
            }
        };
        self.dispatch(actions).into_iter().map(SlotOutput::Signal).collect()
    }

    /// Best-effort telemetry send; false when there is no open channel
    pub fn send_telemetry(&mut self, message: &TelemetryMessage) -> bool {
        match self.active.as_mut().and_then(|a| a.link.channel_mut()) {
            Some(channel) => channel.send(message),
            None => false,
        }
    }

    /// True when the active link just outlasted its grace period
    pub fn tick(&mut self, now: Instant) -> bool {
        self.active.as_mut().is_some_and(|a| a.link.check_grace(now))
    }

    fn dispatch(&mut self, actions: Vec<LinkAction>) -> Vec<SignalMessage> {
        let mut outbound = Vec::new();
        for action in actions {
            match action {
                LinkAction::Transport(command) => {
                    if let Some(active) = &self.active {
                        active.transport.execute(command);
                    }
                }
                LinkAction::Signal(message) => outbound.push(message),
            }
        }
        outbound
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingFactory;
    use super::*;
    use crate::peer::link::TransportCommand;
    use crate::peer::state::TransportState;
    use crate::peer::types::{NegotiationRole, SessionDescription};
    use crate::telemetry::tests::RecordingSink;
    use std::sync::Arc;

    fn slot() -> (LinkSlot, RecordingFactory, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = RecordingFactory::default();
        (LinkSlot::new(Box::new(factory.clone()), tx), factory, rx)
    }

    #[test]
    fn replacing_a_link_closes_the_old_transport() {
        let (mut slot, factory, _rx) = slot();
        slot.open_offerer(Some("V1".into()), "P1");
        slot.open_offerer(Some("V1".into()), "P2");

        assert_eq!(
            factory.commands(1),
            vec![
                TransportCommand::OpenTelemetryChannel,
                TransportCommand::CreateOffer,
                TransportCommand::Close
            ]
        );
        assert_eq!(slot.link().map(PeerLink::generation), Some(2));
        assert_eq!(slot.link().map(PeerLink::remote_id), Some("P2"));
    }

    #[test]
    fn stale_generation_is_discarded() {
        let (mut slot, _factory, _rx) = slot();
        slot.open_offerer(Some("V1".into()), "P1");
        slot.open_offerer(Some("V1".into()), "P1");

        let out = slot.handle(1, LinkEvent::State(TransportState::Connected), Instant::now());
        assert!(out.is_empty());
        assert_eq!(slot.link().map(PeerLink::state), Some(LinkState::Connecting));

        let sink = Arc::new(RecordingSink::default());
        slot.handle(1, LinkEvent::ChannelReady(sink.clone()), Instant::now());
        assert!(*sink.closed.lock().unwrap());
    }

    #[test]
    fn early_candidate_creates_an_answerer() {
        let (mut slot, factory, _rx) = slot();
        let candidate = crate::peer::types::IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 1 typ host".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        assert!(slot
            .on_negotiation(Some("P1".into()), "V1", NegotiationMessage::Candidate(candidate.clone()))
            .is_empty());
        assert_eq!(slot.link().map(|l| l.pending_candidates().len()), Some(1));

        slot.on_negotiation(
            Some("P1".into()),
            "V1",
            NegotiationMessage::Description(SessionDescription::offer("v=0")),
        );
        assert_eq!(
            factory.commands(1),
            vec![
                TransportCommand::SetRemoteDescription(SessionDescription::offer("v=0")),
                TransportCommand::AddCandidate(candidate),
                TransportCommand::CreateAnswer,
            ]
        );
    }

    #[test]
    fn polite_side_answers_glare_on_a_fresh_link() {
        let (mut slot, factory, _rx) = slot();
        slot.open_offerer(Some("a".into()), "b");
        let candidate = crate::peer::types::IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 1 typ host".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        slot.on_negotiation(Some("a".into()), "b", NegotiationMessage::Candidate(candidate.clone()));
        slot.on_negotiation(
            Some("a".into()),
            "b",
            NegotiationMessage::Description(SessionDescription::offer("theirs")),
        );

        assert_eq!(factory.commands(1).last(), Some(&TransportCommand::Close));
        assert_eq!(
            factory.commands(2),
            vec![
                TransportCommand::SetRemoteDescription(SessionDescription::offer("theirs")),
                TransportCommand::AddCandidate(candidate),
                TransportCommand::CreateAnswer,
            ]
        );
        assert_eq!(slot.link().map(PeerLink::role), Some(NegotiationRole::Answerer));
    }

    #[test]
    fn impolite_side_keeps_its_offer_on_glare() {
        let (mut slot, factory, _rx) = slot();
        slot.open_offerer(Some("b".into()), "a");
        slot.on_negotiation(
            Some("b".into()),
            "a",
            NegotiationMessage::Description(SessionDescription::offer("theirs")),
        );
        assert_eq!(slot.link().map(PeerLink::generation), Some(1));
        assert_eq!(
            factory.commands(1),
            vec![TransportCommand::OpenTelemetryChannel, TransportCommand::CreateOffer]
        );
    }

    #[test]
    fn channel_messages_become_frames() {
        let (mut slot, _factory, _rx) = slot();
        slot.open_offerer(Some("V1".into()), "P1");
        let now = Instant::now();
        slot.handle(1, LinkEvent::ChannelReady(Arc::new(RecordingSink::default())), now);
        assert_eq!(slot.handle(1, LinkEvent::ChannelOpen, now), vec![SlotOutput::ChannelOpened]);
        assert!(slot.channel_open());

        let out = slot.handle(1, LinkEvent::ChannelMessage(r#"{"accel":{"x":1,"y":0,"z":0}}"#.into()), now);
        assert!(matches!(&out[..], [SlotOutput::Frames(frames)] if frames.len() == 1));
        assert!(slot.handle(1, LinkEvent::ChannelMessage("{not json".into()), now).is_empty());
        assert!(slot.channel_open());
    }

    mod loopback {
        use super::*;
        use crate::orientation::DeviceAngles;
        use crate::peer::connection::RtcTransportFactory;

        const WAIT: Duration = Duration::from_secs(15);

        /// One side of an in-process pair over real WebRTC transports
        struct Peer {
            id: &'static str,
            slot: LinkSlot,
            events: mpsc::UnboundedReceiver<EndpointEvent>,
            frames: Vec<TelemetryFrame>,
        }

        impl Peer {
            fn new(id: &'static str) -> Self {
                let (tx, events) = mpsc::unbounded_channel();
                Self {
                    id,
                    slot: LinkSlot::new(Box::new(RtcTransportFactory::new(vec![])), tx),
                    events,
                    frames: Vec::new(),
                }
            }

            fn connected(&self) -> bool {
                self.slot.channel_open()
                    && self.slot.link().map(PeerLink::state) == Some(LinkState::Connected)
            }

            /// Applies a message from the other side; returns the replies
            fn receive(&mut self, from: &str, message: SignalMessage) -> Vec<SignalMessage> {
                let negotiation = match message {
                    SignalMessage::Offer { description, .. }
                    | SignalMessage::Answer { description, .. } => {
                        NegotiationMessage::Description(description)
                    }
                    SignalMessage::IceCandidate { candidate, .. } => NegotiationMessage::Candidate(candidate),
                    _ => return Vec::new(),
                };
                self.slot.on_negotiation(Some(self.id.into()), from, negotiation)
            }

            fn on_event(&mut self, event: EndpointEvent) -> Vec<SignalMessage> {
                let EndpointEvent::Link { generation, event } = event else {
                    return Vec::new();
                };
                let mut outbound = Vec::new();
                for output in self.slot.handle(generation, event, Instant::now()) {
                    match output {
                        SlotOutput::Signal(message) => outbound.push(message),
                        SlotOutput::Frames(frames) => self.frames.extend(frames),
                        _ => {}
                    }
                }
                outbound
            }
        }

        /// Stands in for the relay, replies included
        fn exchange<'a>(mut messages: Vec<SignalMessage>, mut from: &'a mut Peer, mut to: &'a mut Peer) {
            while !messages.is_empty() {
                let mut replies = Vec::new();
                for message in messages {
                    replies.extend(to.receive(from.id, message));
                }
                messages = replies;
                std::mem::swap(&mut from, &mut to);
            }
        }

        async fn pump(a: &mut Peer, b: &mut Peer, done: impl Fn(&Peer, &Peer) -> bool) -> bool {
            let deadline = tokio::time::Instant::now() + WAIT;
            while !done(&*a, &*b) {
                let (from_a, event) = tokio::select! {
                    Some(event) = a.events.recv() => (true, event),
                    Some(event) = b.events.recv() => (false, event),
                    _ = tokio::time::sleep_until(deadline) => return false,
                };
                if from_a {
                    let outbound = a.on_event(event);
                    exchange(outbound, a, b);
                } else {
                    let outbound = b.on_event(event);
                    exchange(outbound, b, a);
                }
            }
            true
        }

        async fn stream_one_sample(from: &mut Peer, to: &mut Peer) -> bool {
            assert!(from.slot.send_telemetry(&TelemetryMessage::Gyro {
                gyro: DeviceAngles::new(1.0, 2.0, 3.0),
            }));
            pump(from, to, |_, to| !to.frames.is_empty()).await
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn offer_answer_delivers_telemetry() {
            let mut viewer = Peer::new("V1");
            let mut source = Peer::new("P1");

            let outbound = viewer.slot.open_offerer(Some("V1".into()), "P1");
            exchange(outbound, &mut viewer, &mut source);
            assert!(pump(&mut viewer, &mut source, |a, b| a.connected() && b.connected()).await);
            assert_eq!(source.slot.link().map(PeerLink::role), Some(NegotiationRole::Answerer));

            assert!(stream_one_sample(&mut source, &mut viewer).await);
            assert!(matches!(
                viewer.frames.first(),
                Some(TelemetryFrame::Orientation(angles)) if angles.alpha == 1.0 && angles.gamma == 3.0
            ));

            viewer.slot.teardown();
            source.slot.teardown();
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn glare_still_ends_connected() {
            let mut polite = Peer::new("a");
            let mut impolite = Peer::new("b");

            // both offer before either offer has been delivered
            let first = polite.slot.open_offerer(Some("a".into()), "b");
            let second = impolite.slot.open_offerer(Some("b".into()), "a");
            exchange(first, &mut polite, &mut impolite);
            exchange(second, &mut impolite, &mut polite);

            assert!(pump(&mut polite, &mut impolite, |a, b| a.connected() && b.connected()).await);
            assert_eq!(polite.slot.link().map(PeerLink::role), Some(NegotiationRole::Answerer));
            assert_eq!(polite.slot.link().map(PeerLink::generation), Some(2));
            assert_eq!(impolite.slot.link().map(PeerLink::generation), Some(1));

            assert!(stream_one_sample(&mut impolite, &mut polite).await);

            polite.slot.teardown();
            impolite.slot.teardown();
        }
    }
}

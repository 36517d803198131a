use crate::calibration::{CalibrationCoordinator, CalibrationEffect, CalibrationRoute};
use crate::config::Config;
use crate::endpoint::{
    run_loop, Command, EndpointCore, EndpointEvent, EventSender, LinkSlot, SlotOutput,
    ViewerUpdate, TICK_INTERVAL,
};
use crate::history::HistoryBuffer;
use crate::orientation::OrientationState;
use crate::peer::connection::{RtcTransportFactory, TransportFactory};
use crate::peer::state::LinkState;
use crate::signaling::client::{self, SignalingClient, SignalingEvent};
use crate::signaling::protocol::{Role, SignalMessage};
use crate::telemetry::{ControlMessage, TelemetryFrame, TelemetryMessage};
use crate::utils::pairing_url;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const UPDATE_BUFFER: usize = 256;

/// Viewer state: owns the session, the peer link, the orientation and history
/// views and the calibration handshake
pub struct ViewerCore {
    signaling: SignalingClient,
    links: LinkSlot,
    orientation: OrientationState,
    history: HistoryBuffer,
    calibration: CalibrationCoordinator,
    pairing_base: String,
    updates: broadcast::Sender<ViewerUpdate>,
}

impl ViewerCore {
    pub fn new(
        config: &Config,
        signaling: SignalingClient,
        factory: Box<dyn TransportFactory>,
        events: EventSender,
        updates: broadcast::Sender<ViewerUpdate>,
    ) -> Self {
        Self {
            signaling,
            links: LinkSlot::new(factory, events),
            orientation: OrientationState::new(),
            history: HistoryBuffer::new(),
            calibration: CalibrationCoordinator::new(config.calibration_timeout),
            pairing_base: config.pairing_base.clone(),
            updates,
        }
    }

    pub fn orientation(&self) -> &OrientationState {
        &self.orientation
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn calibration(&self) -> &CalibrationCoordinator {
        &self.calibration
    }

    pub fn links(&self) -> &LinkSlot {
        &self.links
    }

    fn publish(&self, update: ViewerUpdate) {
        // no subscribers is fine
        let _ = self.updates.send(update);
    }

    fn local_id(&self) -> Option<String> {
        self.signaling.endpoint_id().map(str::to_string)
    }

    fn send_signals(&self, messages: Vec<SignalMessage>) {
        for message in messages {
            let event = message.event_name().to_string();
            if let Err(err) = self.signaling.send(message) {
                warn!(%err, %event, "could not send signaling message");
            }
        }
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::SessionReady { session_id, .. } => {
                let url = pairing_url(&self.pairing_base, &session_id);
                info!(%session_id, pairing_url = %url, "waiting for a sensor source");
                self.publish(ViewerUpdate::Session {
                    session_id,
                    pairing_url: url,
                });
            }
            SignalingEvent::PeerJoined { peer_id, .. } => {
                self.publish(ViewerUpdate::PeerJoined {
                    peer_id: peer_id.clone(),
                });
                let outbound = self.links.open_offerer(self.local_id(), &peer_id);
                self.send_signals(outbound);
                self.publish(ViewerUpdate::Link(LinkState::Connecting));
            }
            SignalingEvent::PeerLeft { .. } => {
                if self.links.teardown() {
                    self.publish(ViewerUpdate::Link(LinkState::Closed));
                }
                self.publish(ViewerUpdate::PeerLeft);
            }
            SignalingEvent::Negotiation { from, message } => {
                let outbound = self.links.on_negotiation(self.local_id(), &from, message);
                self.send_signals(outbound);
            }
            SignalingEvent::CalibrationComplete { data } => {
                let effects = self.calibration.on_complete(data);
                self.apply_calibration(effects);
            }
            SignalingEvent::CalibrationFailed { reason } => {
                let effects = self.calibration.on_failed(reason);
                self.apply_calibration(effects);
            }
            SignalingEvent::CalibrationRequested { from } => {
                debug!(%from, "viewer does not serve calibration requests");
            }
            SignalingEvent::RelayError { .. } => {}
        }
    }

    fn on_slot_output(&mut self, output: SlotOutput) {
        match output {
            SlotOutput::Signal(message) => self.send_signals(vec![message]),
            SlotOutput::State(state) => {
                self.publish(ViewerUpdate::Link(state));
                if state == LinkState::Disconnected {
                    self.publish(ViewerUpdate::ConnectionProblem);
                }
            }
            SlotOutput::Frames(frames) => {
                for frame in frames {
                    self.on_frame(frame);
                }
            }
            SlotOutput::ChannelOpened => info!("telemetry flowing"),
            SlotOutput::ChannelClosed => debug!("telemetry channel closed"),
        }
    }

    fn on_frame(&mut self, frame: TelemetryFrame) {
        match frame {
            TelemetryFrame::Orientation(angles) => {
                self.history.record_orientation(&angles);
                let observed = self.orientation.update(angles);
                self.publish(ViewerUpdate::Orientation(observed));
                self.publish(ViewerUpdate::History(self.history.snapshot_all()));
            }
            TelemetryFrame::Acceleration(accel) => {
                self.history.record_acceleration(&accel);
                self.publish(ViewerUpdate::History(self.history.snapshot_all()));
            }
            TelemetryFrame::CalibrationComplete(data) => {
                let effects = self.calibration.on_complete(data);
                self.apply_calibration(effects);
            }
            TelemetryFrame::CalibrationFailed { reason } => {
                let effects = self.calibration.on_failed(reason);
                self.apply_calibration(effects);
            }
            TelemetryFrame::ControlRequest(kind) => {
                debug!(?kind, "ignoring control request sent to the viewer");
            }
            TelemetryFrame::Unknown(tag) => {
                debug!(?tag, "ignoring unknown telemetry");
            }
        }
    }

    pub fn request_calibration(&mut self, now: Instant) {
        let effects = self
            .calibration
            .request_calibration(now, self.links.channel_open());
        self.apply_calibration(effects);
    }

    fn apply_calibration(&mut self, effects: Vec<CalibrationEffect>) {
        if effects.is_empty() {
            return;
        }
        let mut queue = VecDeque::from(effects);
        let mut orientation_changed = false;
        while let Some(effect) = queue.pop_front() {
            match effect {
                CalibrationEffect::EnterCalibrationMode => {
                    self.orientation.set_calibration_mode(true);
                    orientation_changed = true;
                }
                CalibrationEffect::ExitCalibrationMode => {
                    self.orientation.set_calibration_mode(false);
                    orientation_changed = true;
                }
                CalibrationEffect::ClearHistory => {
                    self.history.clear_all();
                    self.publish(ViewerUpdate::History(self.history.snapshot_all()));
                }
                CalibrationEffect::SetReference(angles) => {
                    self.orientation.set_reference(angles.resolve());
                    orientation_changed = true;
                }
                CalibrationEffect::Send(route) => {
                    if self.send_calibration_request(route) {
                        self.calibration.on_request_sent();
                    } else {
                        queue.extend(self.calibration.on_send_failed("no path to the sensor source"));
                    }
                }
            }
        }
        if orientation_changed {
            self.publish(ViewerUpdate::Orientation(self.orientation.observed()));
        }
        self.publish(ViewerUpdate::Calibration(self.calibration.state().clone()));
    }

    /// Data channel first; the relay when the channel is not usable
    fn send_calibration_request(&mut self, route: CalibrationRoute) -> bool {
        if route == CalibrationRoute::Telemetry
            && self
                .links
                .send_telemetry(&TelemetryMessage::Control(ControlMessage::RequestCalibration))
        {
            return true;
        }
        match self.signaling.request_calibration() {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "calibration request not sent");
                false
            }
        }
    }
}

impl EndpointCore for ViewerCore {
    fn handle(&mut self, event: EndpointEvent, now: Instant) -> ControlFlow<()> {
        match event {
            EndpointEvent::Signal(message) => {
                if let Some(event) = self.signaling.handle(message) {
                    self.on_signaling(event);
                }
            }
            EndpointEvent::Link { generation, event } => {
                for output in self.links.handle(generation, event, now) {
                    self.on_slot_output(output);
                }
            }
            EndpointEvent::Command(Command::RequestCalibration) => self.request_calibration(now),
            EndpointEvent::Command(Command::Shutdown) => return ControlFlow::Break(()),
            EndpointEvent::SignalingClosed => {
                self.signaling.on_disconnected();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn tick(&mut self, now: Instant) {
        let effects = self.calibration.tick(now);
        self.apply_calibration(effects);
        if self.links.tick(now) {
            self.publish(ViewerUpdate::RecoveryFailed);
        }
    }

    fn shutdown(&mut self) {
        if self.links.teardown() {
            self.publish(ViewerUpdate::Link(LinkState::Closed));
        }
    }
}

/// Control surface of a running viewer
pub struct ViewerHandle {
    events: EventSender,
    updates: broadcast::Sender<ViewerUpdate>,
    /// Receiver created before the loop started, so it sees every update
    pub first_updates: broadcast::Receiver<ViewerUpdate>,
    pub task: JoinHandle<()>,
}

impl ViewerHandle {
    pub fn request_calibration(&self) -> bool {
        self.events
            .send(EndpointEvent::Command(Command::RequestCalibration))
            .is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(EndpointEvent::Command(Command::Shutdown));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewerUpdate> {
        self.updates.subscribe()
    }
}

/// Connects to the relay, registers as a viewer and runs the event loop
pub async fn spawn_viewer(config: &Config) -> anyhow::Result<ViewerHandle> {
    let (events, queue) = mpsc::unbounded_channel();
    let outbound = client::connect(&config.signal_url, events.clone()).await?;
    let signaling = SignalingClient::new(Role::Viewer, None, outbound);
    signaling.register()?;

    let (updates, first_updates) = broadcast::channel(UPDATE_BUFFER);
    let factory = Box::new(RtcTransportFactory::new(config.ice_servers.clone()));
    let core = ViewerCore::new(config, signaling, factory, events.clone(), updates.clone());
    let task = tokio::spawn(run_loop(core, queue, TICK_INTERVAL));

    Ok(ViewerHandle {
        events,
        updates,
        first_updates,
        task,
    })
}

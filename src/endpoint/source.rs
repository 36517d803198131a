use crate::config::Config;
use crate::endpoint::sensor::SensorSource;
use crate::endpoint::{
    run_loop, Command, EndpointCore, EndpointEvent, EventSender, LinkSlot, SlotOutput,
    TICK_INTERVAL,
};
use crate::peer::connection::{RtcTransportFactory, TransportFactory};
use crate::session::SessionState;
use crate::signaling::client::{self, SignalingClient, SignalingEvent};
use crate::signaling::protocol::{Role, SignalMessage};
use crate::telemetry::{ControlKind, ControlMessage, TelemetryFrame, TelemetryMessage};
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sensor-source side: answers the viewer's offer, streams samples and
/// serves calibration requests
pub struct SourceCore {
    signaling: SignalingClient,
    links: LinkSlot,
    sensor: Box<dyn SensorSource>,
    sample_interval: Duration,
    next_due: Option<Instant>,
}

impl SourceCore {
    pub fn new(
        config: &Config,
        signaling: SignalingClient,
        factory: Box<dyn TransportFactory>,
        events: EventSender,
        sensor: Box<dyn SensorSource>,
    ) -> Self {
        Self {
            signaling,
            links: LinkSlot::new(factory, events),
            sensor,
            sample_interval: config.sample_interval(),
            next_due: None,
        }
    }

    pub fn links(&self) -> &LinkSlot {
        &self.links
    }

    fn send_signals(&self, messages: Vec<SignalMessage>) {
        for message in messages {
            let event = message.event_name().to_string();
            if let Err(err) = self.signaling.send(message) {
                warn!(%err, %event, "could not send signaling message");
            }
        }
    }

    fn on_signaling(&mut self, event: SignalingEvent) -> ControlFlow<()> {
        match event {
            SignalingEvent::SessionReady { session_id, peer_id } => {
                info!(%session_id, viewer = ?peer_id, "joined session, waiting for the viewer's offer");
            }
            SignalingEvent::Negotiation { from, message } => {
                let local_id = self.signaling.endpoint_id().map(str::to_string);
                let outbound = self.links.on_negotiation(local_id, &from, message);
                self.send_signals(outbound);
            }
            SignalingEvent::PeerLeft { .. } => {
                self.links.teardown();
            }
            SignalingEvent::CalibrationRequested { from } => self.serve_calibration(Some(from)),
            SignalingEvent::RelayError { message } => {
                // a rejected register means there is no session to join
                if self.signaling.session().state() == SessionState::Created {
                    error!(%message, "relay refused the session");
                    return ControlFlow::Break(());
                }
            }
            other @ (SignalingEvent::PeerJoined { .. }
            | SignalingEvent::CalibrationComplete { .. }
            | SignalingEvent::CalibrationFailed { .. }) => {
                debug!(event = ?other, "ignored by the source");
            }
        }
        ControlFlow::Continue(())
    }

    fn on_slot_output(&mut self, output: SlotOutput) {
        match output {
            SlotOutput::Signal(message) => self.send_signals(vec![message]),
            SlotOutput::State(state) => info!(?state, "link state"),
            SlotOutput::Frames(frames) => {
                for frame in frames {
                    match frame {
                        TelemetryFrame::ControlRequest(ControlKind::RequestCalibration) => {
                            self.serve_calibration(None)
                        }
                        other => debug!(frame = ?other, "ignored by the source"),
                    }
                }
            }
            SlotOutput::ChannelOpened => {
                info!("telemetry channel open, streaming");
                self.next_due = None;
            }
            SlotOutput::ChannelClosed => debug!("telemetry channel closed"),
        }
    }

    /// Calibrates the sensor and replies on the data channel when it is
    /// open, otherwise through the relay to whoever asked
    fn serve_calibration(&mut self, requester: Option<String>) {
        let result = self.sensor.calibrate();
        info!(ok = result.is_ok(), "calibration requested");

        if self.links.channel_open() {
            let reply = match &result {
                Ok(data) => ControlMessage::CalibrationComplete { data: *data },
                Err(reason) => ControlMessage::CalibrationFailed {
                    reason: reason.clone(),
                },
            };
            if self.links.send_telemetry(&TelemetryMessage::Control(reply)) {
                return;
            }
        }

        let Some(to) = requester.or_else(|| self.signaling.peer_id().ok()) else {
            warn!("calibration result has nowhere to go");
            return;
        };
        if let Err(err) = self.signaling.reply_calibration(&to, result) {
            warn!(%err, "calibration result not sent");
        }
    }

    /// Sends one sample when due. The deadline advances by whole intervals
    /// so late wake-ups do not cost samples; half an interval of slack
    /// absorbs a tick that arrives less late than the previous one.
    fn sample(&mut self, now: Instant) {
        if !self.links.channel_open() {
            return;
        }
        if let Some(due) = self.next_due {
            if now + self.sample_interval / 2 < due {
                return;
            }
        }
        self.next_due = Some(match self.next_due {
            // too far behind to catch up; resync instead of bursting
            Some(due) if now < due + self.sample_interval => due + self.sample_interval,
            _ => now + self.sample_interval,
        });

        let Some(sample) = self.sensor.sample() else {
            return;
        };
        self.links.send_telemetry(&TelemetryMessage::Gyro {
            gyro: sample.orientation,
        });
        if let Some(accel) = sample.acceleration {
            self.links.send_telemetry(&TelemetryMessage::Accel { accel });
        }
    }
}

impl EndpointCore for SourceCore {
    fn handle(&mut self, event: EndpointEvent, now: Instant) -> ControlFlow<()> {
        match event {
            EndpointEvent::Signal(message) => {
                if let Some(event) = self.signaling.handle(message) {
                    return self.on_signaling(event);
                }
            }
            EndpointEvent::Link { generation, event } => {
                for output in self.links.handle(generation, event, now) {
                    self.on_slot_output(output);
                }
            }
            EndpointEvent::Command(Command::RequestCalibration) => {
                debug!("calibration is requested by the viewer, not locally");
            }
            EndpointEvent::Command(Command::Shutdown) => return ControlFlow::Break(()),
            EndpointEvent::SignalingClosed => {
                self.signaling.on_disconnected();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn tick(&mut self, now: Instant) {
        if self.links.tick(now) {
            warn!("link did not recover, waiting for the viewer to renegotiate");
        }
        self.sample(now);
    }

    fn shutdown(&mut self) {
        self.links.teardown();
    }
}

pub struct SourceHandle {
    events: EventSender,
    pub task: JoinHandle<()>,
}

impl SourceHandle {
    pub fn shutdown(&self) {
        let _ = self.events.send(EndpointEvent::Command(Command::Shutdown));
    }
}

/// Connects to the relay, joins `session_id` and streams from `sensor`
pub async fn spawn_source(
    config: &Config,
    session_id: String,
    sensor: Box<dyn SensorSource>,
) -> anyhow::Result<SourceHandle> {
    let (events, queue) = mpsc::unbounded_channel();
    let outbound = client::connect(&config.signal_url, events.clone()).await?;
    let signaling = SignalingClient::new(Role::Source, Some(session_id), outbound);
    signaling.register()?;

    let factory = Box::new(RtcTransportFactory::new(config.ice_servers.clone()));
    let core = SourceCore::new(config, signaling, factory, events.clone(), sensor);
    let tick_every = config.sample_interval().min(TICK_INTERVAL);
    let task = tokio::spawn(run_loop(core, queue, tick_every));

    Ok(SourceHandle { events, task })
}

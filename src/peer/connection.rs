use crate::config::ServerConfig;
use crate::endpoint::{EndpointEvent, EventSender};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::data_channel::{attach_dc, telemetry_channel_init};
use crate::peer::ice::CandidateTally;
use crate::peer::link::TransportCommand;
use crate::peer::state::TransportState;
use crate::peer::types::{IceCandidate, LinkError, SessionDescription};
use crate::telemetry::{TextSink, TELEMETRY_LABEL};
use crate::utils::add_ice_url_scheme;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::{
    api::APIBuilder,
    data_channel::RTCDataChannel,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
};

/// What a transport reports back to the endpoint loop, tagged there with the link generation
pub enum LinkEvent {
    LocalDescription(SessionDescription),
    LocalCandidate(IceCandidate),
    State(TransportState),
    NegotiationFailed(String),
    ChannelReady(Arc<dyn TextSink>),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
}

impl LinkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LinkEvent::LocalDescription(_) => "local-description",
            LinkEvent::LocalCandidate(_) => "local-candidate",
            LinkEvent::State(_) => "state",
            LinkEvent::NegotiationFailed(_) => "negotiation-failed",
            LinkEvent::ChannelReady(_) => "channel-ready",
            LinkEvent::ChannelOpen => "channel-open",
            LinkEvent::ChannelMessage(_) => "channel-message",
            LinkEvent::ChannelClosed => "channel-closed",
        }
    }
}

pub(crate) fn emit(events: &EventSender, generation: u64, event: LinkEvent) {
    // the loop is gone when this fails; nothing left to tell
    let _ = events.send(EndpointEvent::Link { generation, event });
}

/// One peer transport, driven by commands
pub trait LinkTransport: Send {
    fn execute(&self, command: TransportCommand);
}

pub trait TransportFactory: Send {
    fn create(&self, generation: u64, events: EventSender) -> Box<dyn LinkTransport>;
}

pub struct RtcTransportFactory {
    ice_servers: Vec<ServerConfig>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }
}

impl TransportFactory for RtcTransportFactory {
    fn create(&self, generation: u64, events: EventSender) -> Box<dyn LinkTransport> {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(generation, rtc_config(&self.ice_servers), rx, events));
        Box::new(RtcTransport { commands })
    }
}

/// Handle to a worker task owning one RTCPeerConnection
pub struct RtcTransport {
    commands: mpsc::UnboundedSender<TransportCommand>,
}

impl LinkTransport for RtcTransport {
    fn execute(&self, command: TransportCommand) {
        if self.commands.send(command).is_err() {
            debug!("transport worker already gone");
        }
    }
}

async fn run_worker(
    generation: u64,
    config: RTCConfiguration,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: EventSender,
) {
    let pc = match new_peer(generation, config, &events).await {
        Ok(pc) => pc,
        Err(err) => {
            emit(&events, generation, LinkEvent::NegotiationFailed(err.to_string()));
            return;
        }
    };

    // strictly one command at a time
    while let Some(command) = commands.recv().await {
        if command == TransportCommand::Close {
            break;
        }
        if let Err(err) = execute(&pc, generation, command, &events).await {
            emit(&events, generation, LinkEvent::NegotiationFailed(err.to_string()));
        }
    }

    debug!(generation, "closing peer connection");
    if let Err(err) = pc.close().await {
        warn!(generation, %err, "peer connection close failed");
    }
}

async fn execute(
    pc: &Arc<RTCPeerConnection>,
    generation: u64,
    command: TransportCommand,
    events: &EventSender,
) -> Result<(), LinkError> {
    match command {
        TransportCommand::OpenTelemetryChannel => {
            let dc = pc
                .create_data_channel(TELEMETRY_LABEL, Some(telemetry_channel_init()))
                .await?;
            attach_dc(generation, &dc, events);
        }
        TransportCommand::CreateOffer => {
            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer).await?;
            report_local_description(pc, generation, events).await?;
        }
        TransportCommand::CreateAnswer => {
            let answer = pc.create_answer(None).await?;
            pc.set_local_description(answer).await?;
            report_local_description(pc, generation, events).await?;
        }
        TransportCommand::SetRemoteDescription(description) => {
            pc.set_remote_description(description.to_rtc()?).await?;
        }
        TransportCommand::AddCandidate(candidate) => {
            // one bad candidate does not sink the negotiation
            if let Err(err) = pc.add_ice_candidate(candidate.into()).await {
                warn!(generation, %err, "failed to add remote candidate");
            }
        }
        TransportCommand::Close => {}
    }
    Ok(())
}

async fn report_local_description(
    pc: &Arc<RTCPeerConnection>,
    generation: u64,
    events: &EventSender,
) -> Result<(), LinkError> {
    let local = pc
        .local_description()
        .await
        .ok_or(LinkError::MissingLocalDescription)?;
    let description = SessionDescription::from_rtc(&local)?;
    emit(events, generation, LinkEvent::LocalDescription(description));
    Ok(())
}

/// Builds the peer connection and wires its callbacks into the endpoint queue
async fn new_peer(
    generation: u64,
    config: RTCConfiguration,
    events: &EventSender,
) -> Result<Arc<RTCPeerConnection>, LinkError> {
    let api = APIBuilder::new().build();
    let pc = Arc::new(api.new_peer_connection(config).await?);

    let tally = Arc::new(Mutex::new(CandidateTally::default()));
    pc.on_ice_candidate(Box::new({
        let events = events.clone();
        move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => {
                    dump_candidate("local", &c);
                    match c.to_json() {
                        Ok(init) => {
                            if let Ok(mut tally) = tally.lock() {
                                tally.record(&init.candidate);
                            }
                            emit(&events, generation, LinkEvent::LocalCandidate(init.into()));
                        }
                        Err(err) => warn!(generation, %err, "could not serialize local candidate"),
                    }
                }
                None => {
                    // end of gathering
                    if let Ok(tally) = tally.lock() {
                        tally.log_summary();
                    }
                }
            }
            Box::pin(async {})
        }
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!(generation, ?state, "ICE gathering state changed");
        Box::pin(async {})
    }));

    let weak_pc = Arc::downgrade(&pc);
    pc.on_peer_connection_state_change(Box::new({
        let events = events.clone();
        move |st: RTCPeerConnectionState| {
            debug!(generation, state = ?st, "peer connection state changed");
            if matches!(st, RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed) {
                if let Some(pc) = weak_pc.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "before-fail").await;
                    });
                }
            }
            emit(&events, generation, LinkEvent::State(st.into()));
            Box::pin(async {})
        }
    }));

    pc.on_data_channel(Box::new({
        let events = events.clone();
        move |dc: Arc<RTCDataChannel>| {
            debug!(generation, label = dc.label(), "inbound data channel");
            attach_dc(generation, &dc, &events);
            Box::pin(async {})
        }
    }));

    Ok(pc)
}

pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_ice_servers;

    #[test]
    fn config_carries_every_server_with_scheme() {
        let mut servers = default_ice_servers();
        servers.push(ServerConfig {
            id: "relay".into(),
            r#type: "turn".into(),
            url: "turn.example.org:3478".into(),
            username: Some("user".into()),
            credential: Some("secret".into()),
        });
        let config = rtc_config(&servers);
        assert_eq!(config.ice_servers.len(), 3);
        assert_eq!(config.ice_servers[2].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(config.ice_servers[2].username, "user");
        assert!(config.ice_servers[0].credential.is_empty());
    }
}

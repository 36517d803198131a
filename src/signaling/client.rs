use crate::endpoint::{EndpointEvent, EventSender};
use crate::orientation::DeviceAngles;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::Session;
use crate::signaling::protocol::{decode, encode, Role, SignalMessage};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("cannot reach relay: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("signaling connection is closed")]
    Disconnected,
    #[error("no peer in this session yet")]
    NoPeer,
}

/// Negotiation payload forwarded from the peer
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationMessage {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

/// What the endpoint needs to act on after a relay message
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    SessionReady {
        session_id: String,
        peer_id: Option<String>,
    },
    PeerJoined {
        peer_id: String,
        replaced: Option<String>,
    },
    PeerLeft {
        peer_id: Option<String>,
    },
    Negotiation {
        from: String,
        message: NegotiationMessage,
    },
    CalibrationRequested {
        from: String,
    },
    CalibrationComplete {
        data: Option<DeviceAngles>,
    },
    CalibrationFailed {
        reason: String,
    },
    RelayError {
        message: String,
    },
}

/// Control-plane half of an endpoint. The socket itself lives in the tasks
/// spawned by [`connect`]; this side owns the session and the outbound queue.
pub struct SignalingClient {
    role: Role,
    join_session: Option<String>,
    session: Session,
    outbound: mpsc::UnboundedSender<SignalMessage>,
}

impl SignalingClient {
    pub fn new(
        role: Role,
        join_session: Option<String>,
        outbound: mpsc::UnboundedSender<SignalMessage>,
    ) -> Self {
        Self {
            role,
            join_session,
            session: Session::new(),
            outbound,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn endpoint_id(&self) -> Option<&str> {
        self.session.endpoint_id()
    }

    pub fn peer_id(&self) -> Result<String, SignalingError> {
        self.session
            .peer_id()
            .map(str::to_string)
            .ok_or(SignalingError::NoPeer)
    }

    pub fn register(&self) -> Result<(), SignalingError> {
        debug!(role = ?self.role, session = ?self.join_session, "registering with relay");
        self.send(SignalMessage::Register {
            role: self.role,
            session_id: self.join_session.clone(),
        })
    }

    pub fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.outbound
            .send(message)
            .map_err(|_| SignalingError::Disconnected)
    }

    /// Fallback path for the calibration request when the data channel is not open
    pub fn request_calibration(&self) -> Result<(), SignalingError> {
        let target = self.peer_id()?;
        self.send(SignalMessage::RequestCalibration {
            target_id: Some(target),
            sender_id: self.session.endpoint_id().map(str::to_string),
        })
    }

    /// Fallback path for the calibration result
    pub fn reply_calibration(
        &self,
        to: &str,
        result: Result<Option<DeviceAngles>, String>,
    ) -> Result<(), SignalingError> {
        let target_id = Some(to.to_string());
        let sender_id = self.session.endpoint_id().map(str::to_string);
        let message = match result {
            Ok(data) => SignalMessage::CalibrationComplete {
                target_id,
                sender_id,
                data,
            },
            Err(reason) => SignalMessage::CalibrationFailed {
                target_id,
                sender_id,
                reason,
            },
        };
        self.send(message)
    }

    /// Applies one relay message to the session and says what it means for the endpoint
    pub fn handle(&mut self, message: SignalMessage) -> Option<SignalingEvent> {
        match message {
            SignalMessage::SessionCreated {
                session_id,
                endpoint_id,
                peer_id,
            } => {
                self.session
                    .on_created(session_id.clone(), endpoint_id, peer_id.clone());
                Some(SignalingEvent::SessionReady {
                    session_id,
                    peer_id,
                })
            }
            SignalMessage::PeerJoined { peer_id } => {
                let replaced = self.session.on_peer_joined(peer_id.clone());
                Some(SignalingEvent::PeerJoined { peer_id, replaced })
            }
            SignalMessage::PeerLeft => Some(SignalingEvent::PeerLeft {
                peer_id: self.session.on_peer_left(),
            }),
            SignalMessage::Offer {
                sender_id,
                description,
                ..
            }
            | SignalMessage::Answer {
                sender_id,
                description,
                ..
            } => self.from_peer(sender_id, "description").map(|from| {
                SignalingEvent::Negotiation {
                    from,
                    message: NegotiationMessage::Description(description),
                }
            }),
            SignalMessage::IceCandidate {
                sender_id,
                candidate,
                ..
            } => self
                .from_peer(sender_id, "candidate")
                .map(|from| SignalingEvent::Negotiation {
                    from,
                    message: NegotiationMessage::Candidate(candidate),
                }),
            SignalMessage::RequestCalibration { sender_id, .. } => self
                .from_peer(sender_id, "calibration request")
                .map(|from| SignalingEvent::CalibrationRequested { from }),
            SignalMessage::CalibrationComplete { data, .. } => {
                Some(SignalingEvent::CalibrationComplete { data })
            }
            SignalMessage::CalibrationFailed { reason, .. } => {
                Some(SignalingEvent::CalibrationFailed { reason })
            }
            SignalMessage::Error { message } => {
                warn!(%message, "relay reported an error");
                Some(SignalingEvent::RelayError { message })
            }
            SignalMessage::Register { .. } => {
                warn!("unexpected register from relay");
                None
            }
            SignalMessage::Unknown { event } => {
                debug!(%event, "ignoring unknown signaling event");
                None
            }
        }
    }

    /// Peer-addressed messages must name their sender
    fn from_peer(&self, sender_id: Option<String>, what: &str) -> Option<String> {
        if sender_id.is_none() {
            warn!(what, "peer message without senderId, dropping");
        }
        sender_id
    }

    pub fn on_disconnected(&mut self) {
        info!(session = ?self.session.session_id(), "signaling connection closed");
        self.session.close();
    }
}

/// Opens the relay connection. Inbound frames are decoded and pushed into the
/// endpoint queue; the returned sender feeds the writer task.
pub async fn connect(
    url: &str,
    events: EventSender,
) -> Result<mpsc::UnboundedSender<SignalMessage>, SignalingError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    info!(url, "connected to relay");
    let (mut write, mut read) = ws.split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<SignalMessage>();

    tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            let text = match encode(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%err, event = message.event_name(), "cannot encode signaling message");
                    continue;
                }
            };
            if let Err(err) = write.send(Message::text(text)).await {
                warn!(%err, "relay write failed");
                break;
            }
        }
        let _ = write.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match decode(text.as_str()) {
                    Ok(message) => {
                        if events.send(EndpointEvent::Signal(message)).is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(%err, "discarding malformed signaling frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "relay read failed");
                    break;
                }
            }
        }
        let _ = events.send(EndpointEvent::SignalingClosed);
    });

    Ok(outbound)
}

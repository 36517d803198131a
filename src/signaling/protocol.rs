//! Relay wire format: `{"event": "<name>", "data": {...}}` text frames with camelCase fields.

use crate::orientation::DeviceAngles;
use crate::peer::types::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Source,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum SignalMessage {
    Register {
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    SessionCreated {
        session_id: String,
        endpoint_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
    PeerJoined {
        peer_id: String,
    },
    PeerLeft,
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        description: SessionDescription,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        description: SessionDescription,
    },
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        candidate: IceCandidate,
    },
    RequestCalibration {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
    },
    CalibrationComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<DeviceAngles>,
    },
    CalibrationFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        reason: String,
    },
    Error {
        message: String,
    },
    /// Event name we do not handle; never sent
    #[serde(skip)]
    Unknown { event: String },
}

const KNOWN_EVENTS: [&str; 11] = [
    "register",
    "session-created",
    "peer-joined",
    "peer-left",
    "offer",
    "answer",
    "ice-candidate",
    "request-calibration",
    "calibration-complete",
    "calibration-failed",
    "error",
];

#[derive(Deserialize)]
struct Envelope {
    event: String,
}

pub fn encode(message: &SignalMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Decodes one frame. An unrecognised event name yields `Unknown`; a known
/// event with a bad payload is an error.
pub fn decode(raw: &str) -> Result<SignalMessage, serde_json::Error> {
    match serde_json::from_str::<SignalMessage>(raw) {
        Ok(message) => Ok(message),
        Err(err) => match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) if !KNOWN_EVENTS.contains(&envelope.event.as_str()) => {
                Ok(SignalMessage::Unknown {
                    event: envelope.event,
                })
            }
            _ => Err(err),
        },
    }
}

impl SignalMessage {
    pub fn event_name(&self) -> &str {
        match self {
            SignalMessage::Register { .. } => "register",
            SignalMessage::SessionCreated { .. } => "session-created",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft => "peer-left",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::RequestCalibration { .. } => "request-calibration",
            SignalMessage::CalibrationComplete { .. } => "calibration-complete",
            SignalMessage::CalibrationFailed { .. } => "calibration-failed",
            SignalMessage::Error { .. } => "error",
            SignalMessage::Unknown { event } => event,
        }
    }

    /// Peer-addressed messages are forwarded by the relay to `targetId`
    pub fn target_id(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { target_id, .. }
            | SignalMessage::Answer { target_id, .. }
            | SignalMessage::IceCandidate { target_id, .. }
            | SignalMessage::RequestCalibration { target_id, .. }
            | SignalMessage::CalibrationComplete { target_id, .. }
            | SignalMessage::CalibrationFailed { target_id, .. } => target_id.as_deref(),
            _ => None,
        }
    }

    pub fn sender_id(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { sender_id, .. }
            | SignalMessage::Answer { sender_id, .. }
            | SignalMessage::IceCandidate { sender_id, .. }
            | SignalMessage::RequestCalibration { sender_id, .. }
            | SignalMessage::CalibrationComplete { sender_id, .. }
            | SignalMessage::CalibrationFailed { sender_id, .. } => sender_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_peer_addressed(&self) -> bool {
        matches!(
            self,
            SignalMessage::Offer { .. }
                | SignalMessage::Answer { .. }
                | SignalMessage::IceCandidate { .. }
                | SignalMessage::RequestCalibration { .. }
                | SignalMessage::CalibrationComplete { .. }
                | SignalMessage::CalibrationFailed { .. }
        )
    }

    /// Stamps the sender, overwriting whatever the client claimed
    pub fn with_sender(mut self, id: &str) -> Self {
        match &mut self {
            SignalMessage::Offer { sender_id, .. }
            | SignalMessage::Answer { sender_id, .. }
            | SignalMessage::IceCandidate { sender_id, .. }
            | SignalMessage::RequestCalibration { sender_id, .. }
            | SignalMessage::CalibrationComplete { sender_id, .. }
            | SignalMessage::CalibrationFailed { sender_id, .. } => {
                *sender_id = Some(id.to_string());
            }
            _ => {}
        }
        self
    }
}

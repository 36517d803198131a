use serde::{Deserialize, Serialize};
use thiserror::Error;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("webrtc: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("transport produced no local description")]
    MissingLocalDescription,
    #[error("unsupported description type {0}")]
    UnsupportedDescription(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as exchanged through the relay ({"type","sdp"})
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_rtc(&self) -> Result<RTCSessionDescription, LinkError> {
        let desc = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone())?,
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone())?,
        };
        Ok(desc)
    }

    pub fn from_rtc(desc: &RTCSessionDescription) -> Result<Self, LinkError> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            other => return Err(LinkError::UnsupportedDescription(other.to_string())),
        };
        Ok(Self {
            kind,
            sdp: desc.sdp.clone(),
        })
    }
}

/// ICE candidate in the browser's RTCIceCandidateInit shape
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

//! Telemetry framing over the unordered, non-retransmitted data channel.
//!
//! One JSON object per text message:
//!   {"gyro":{"alpha":..,"beta":..,"gamma":..}}   orientation, degrees
//!   {"accel":{"x":..,"y":..,"z":..}}              acceleration, g
//!   {"type":"request-calibration"}
//!   {"type":"calibration-complete","data":{..}}
//!   {"type":"calibration-failed","reason":".."}
//!
//! No sequence numbers and no acks; every frame stands alone.

use crate::orientation::{Acceleration, DeviceAcceleration, DeviceAngles, EulerAngles};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Data channel label used for telemetry
pub const TELEMETRY_LABEL: &str = "telemetry";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    RequestCalibration,
}

/// One decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryFrame {
    Orientation(EulerAngles),
    Acceleration(Acceleration),
    ControlRequest(ControlKind),
    CalibrationComplete(Option<DeviceAngles>),
    CalibrationFailed { reason: String },
    /// Well-formed JSON of a shape we do not know; the tag, when there is one
    Unknown(Option<String>),
}

/// Outbound message; serializes to the compact wire shapes above
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryMessage {
    Gyro { gyro: DeviceAngles },
    Accel { accel: DeviceAcceleration },
    Control(ControlMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    RequestCalibration,
    CalibrationComplete {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<DeviceAngles>,
    },
    CalibrationFailed {
        reason: String,
    },
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    gyro: Option<DeviceAngles>,
    #[serde(default)]
    accel: Option<DeviceAcceleration>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

pub fn encode(message: &TelemetryMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Decodes one text message. A message carrying both `gyro` and `accel`
/// yields both frames, orientation first.
pub fn decode(raw: &str) -> Result<Vec<TelemetryFrame>, ParseError> {
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(ParseError::NotAnObject);
    }
    let message: WireMessage = serde_json::from_value(value)?;

    let mut frames = Vec::with_capacity(2);
    if let Some(gyro) = message.gyro {
        frames.push(TelemetryFrame::Orientation(gyro.resolve()));
    }
    if let Some(accel) = message.accel {
        frames.push(TelemetryFrame::Acceleration(accel.resolve()));
    }
    match message.kind.as_deref() {
        Some("request-calibration") => {
            frames.push(TelemetryFrame::ControlRequest(ControlKind::RequestCalibration))
        }
        Some("calibration-complete") => {
            // result data is advisory; a shape we cannot read is treated as absent
            let data = message
                .data
                .and_then(|v| serde_json::from_value::<DeviceAngles>(v).ok());
            frames.push(TelemetryFrame::CalibrationComplete(data));
        }
        Some("calibration-failed") => frames.push(TelemetryFrame::CalibrationFailed {
            reason: message.reason.unwrap_or_else(|| "unknown".into()),
        }),
        Some(other) => frames.push(TelemetryFrame::Unknown(Some(other.to_string()))),
        None if frames.is_empty() => frames.push(TelemetryFrame::Unknown(None)),
        None => {}
    }
    Ok(frames)
}

/// Fire-and-forget text transport under a telemetry channel
pub trait TextSink: Send + Sync {
    fn send_text(&self, text: String);
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closed,
}

pub struct TelemetryChannel {
    state: ChannelState,
    sink: Arc<dyn TextSink>,
    sent: u64,
    dropped: u64,
    malformed: u64,
}

impl TelemetryChannel {
    pub fn new(sink: Arc<dyn TextSink>) -> Self {
        Self {
            state: ChannelState::Opening,
            sink,
            sent: 0,
            dropped: 0,
            malformed: 0,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn on_open(&mut self) {
        if self.state == ChannelState::Opening {
            debug!("telemetry channel open");
            self.state = ChannelState::Open;
        }
    }

    /// Remote or transport close. There is no reopen.
    pub fn on_close(&mut self) {
        if self.state != ChannelState::Closed {
            debug!(sent = self.sent, dropped = self.dropped, malformed = self.malformed, "telemetry channel closed");
            self.state = ChannelState::Closed;
        }
    }

    pub fn close(&mut self) {
        if self.state != ChannelState::Closed {
            self.sink.close();
            self.on_close();
        }
    }

    /// Best-effort send. Returns false when the message was dropped:
    /// stale real-time data is never queued for later.
    pub fn send(&mut self, message: &TelemetryMessage) -> bool {
        if !self.is_open() {
            self.dropped += 1;
            trace!(state = ?self.state, "dropping telemetry, channel not open");
            return false;
        }
        match encode(message) {
            Ok(text) => {
                self.sink.send_text(text);
                self.sent += 1;
                true
            }
            Err(err) => {
                warn!(%err, "failed to encode telemetry message");
                self.dropped += 1;
                false
            }
        }
    }

    /// Decodes an inbound message. Malformed input is counted and reported
    /// but never changes the channel state.
    pub fn on_message(&mut self, raw: &str) -> Result<Vec<TelemetryFrame>, ParseError> {
        decode(raw).map_err(|err| {
            self.malformed += 1;
            warn!(%err, malformed = self.malformed, len = raw.len(), "discarding malformed telemetry");
            err
        })
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    pub fn sent_count(&self) -> u64 {
        self.sent
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sent: Mutex<Vec<String>>,
        pub closed: Mutex<bool>,
    }

    impl TextSink for RecordingSink {
        fn send_text(&self, text: String) {
            self.sent.lock().unwrap().push(text);
        }

        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn open_channel() -> (TelemetryChannel, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let mut channel = TelemetryChannel::new(sink.clone());
        channel.on_open();
        (channel, sink)
    }

    #[test]
    fn decodes_gyro_with_missing_components() {
        let frames = decode(r#"{"gyro":{"alpha":12.5,"beta":null}}"#).unwrap();
        assert_eq!(
            frames,
            vec![TelemetryFrame::Orientation(EulerAngles { alpha: 12.5, beta: 0.0, gamma: 0.0 })]
        );
    }

    #[test]
    fn decodes_accel() {
        let frames = decode(r#"{"accel":{"x":0.1,"y":-0.2,"z":0.98}}"#).unwrap();
        assert_eq!(
            frames,
            vec![TelemetryFrame::Acceleration(Acceleration { x: 0.1, y: -0.2, z: 0.98 })]
        );
    }

    #[test]
    fn combined_message_yields_gyro_then_accel() {
        let frames =
            decode(r#"{"accel":{"x":1,"y":2,"z":3},"gyro":{"alpha":1,"beta":2,"gamma":3}}"#)
                .unwrap();
        assert!(matches!(frames[0], TelemetryFrame::Orientation(_)));
        assert!(matches!(frames[1], TelemetryFrame::Acceleration(_)));
    }

    #[test]
    fn decodes_control_messages() {
        assert_eq!(
            decode(r#"{"type":"request-calibration"}"#).unwrap(),
            vec![TelemetryFrame::ControlRequest(ControlKind::RequestCalibration)]
        );
        assert_eq!(
            decode(r#"{"type":"calibration-failed","reason":"device moving"}"#).unwrap(),
            vec![TelemetryFrame::CalibrationFailed { reason: "device moving".into() }]
        );
        assert_eq!(
            decode(r#"{"type":"calibration-complete","data":{"alpha":90}}"#).unwrap(),
            vec![TelemetryFrame::CalibrationComplete(Some(DeviceAngles {
                alpha: Some(90.0),
                beta: None,
                gamma: None
            }))]
        );
        assert_eq!(
            decode(r#"{"type":"calibration-complete","data":"ok"}"#).unwrap(),
            vec![TelemetryFrame::CalibrationComplete(None)]
        );
    }

    #[test]
    fn unknown_shapes_are_explicit() {
        assert_eq!(
            decode(r#"{"type":"ping"}"#).unwrap(),
            vec![TelemetryFrame::Unknown(Some("ping".into()))]
        );
        assert_eq!(
            decode(r#"{"battery":0.5}"#).unwrap(),
            vec![TelemetryFrame::Unknown(None)]
        );
    }

    #[test]
    fn rejects_non_objects() {
        assert!(matches!(decode("[1,2,3]"), Err(ParseError::NotAnObject)));
        assert!(matches!(decode(r#"{"gyro":"fast"}"#), Err(ParseError::Json(_))));
    }

    #[test]
    fn malformed_input_keeps_channel_open() {
        let (mut channel, _) = open_channel();
        assert!(channel.on_message("{not json").is_err());
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.malformed_count(), 1);

        // and the next good frame still decodes
        let frames = channel.on_message(r#"{"gyro":{"alpha":1,"beta":2,"gamma":3}}"#).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn encodes_compact_wire_shapes() {
        let gyro = TelemetryMessage::Gyro { gyro: DeviceAngles::new(1.0, 2.0, 3.0) };
        assert_eq!(encode(&gyro).unwrap(), r#"{"gyro":{"alpha":1.0,"beta":2.0,"gamma":3.0}}"#);

        let request = TelemetryMessage::Control(ControlMessage::RequestCalibration);
        assert_eq!(encode(&request).unwrap(), r#"{"type":"request-calibration"}"#);

        let failed = TelemetryMessage::Control(ControlMessage::CalibrationFailed {
            reason: "nope".into(),
        });
        assert_eq!(
            encode(&failed).unwrap(),
            r#"{"type":"calibration-failed","reason":"nope"}"#
        );
    }

    #[test]
    fn sends_only_while_open() {
        let sink = Arc::new(RecordingSink::default());
        let mut channel = TelemetryChannel::new(sink.clone());
        let message = TelemetryMessage::Accel { accel: DeviceAcceleration::new(0.0, 0.0, 1.0) };

        assert!(!channel.send(&message));
        channel.on_open();
        assert!(channel.send(&message));
        channel.on_close();
        assert!(!channel.send(&message));

        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        assert_eq!(channel.dropped_count(), 2);
    }

    #[test]
    fn closed_channel_never_reopens() {
        let (mut channel, sink) = open_channel();
        channel.close();
        assert!(*sink.closed.lock().unwrap());
        channel.on_open();
        assert_eq!(channel.state(), ChannelState::Closed);
    }
}

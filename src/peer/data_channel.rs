use crate::endpoint::EventSender;
use crate::peer::connection::{emit, LinkEvent};
use crate::telemetry::TextSink;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Unordered and never retransmitted: a late sample is worthless
pub fn telemetry_channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(false),
        max_retransmits: Some(0),
        ..Default::default()
    }
}

/// Sends through the data channel without blocking the caller
pub struct RtcTextSink {
    dc: Arc<RTCDataChannel>,
}

impl TextSink for RtcTextSink {
    fn send_text(&self, text: String) {
        let dc = self.dc.clone();
        tokio::spawn(async move {
            if let Err(err) = dc.send_text(text).await {
                trace!(%err, "telemetry send failed");
            }
        });
    }

    fn close(&self) {
        let dc = self.dc.clone();
        tokio::spawn(async move {
            if let Err(err) = dc.close().await {
                debug!(%err, "data channel close failed");
            }
        });
    }
}

fn text_payload(data: &Bytes) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// Common data-channel wiring for both the created and the accepted channel
pub fn attach_dc(generation: u64, dc: &Arc<RTCDataChannel>, events: &EventSender) {
    debug!(generation, label = dc.label(), "attaching data channel");
    emit(
        events,
        generation,
        LinkEvent::ChannelReady(Arc::new(RtcTextSink { dc: dc.clone() })),
    );

    dc.on_open(Box::new({
        let events = events.clone();
        move || {
            emit(&events, generation, LinkEvent::ChannelOpen);
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let events = events.clone();
        move |msg: DataChannelMessage| {
            if msg.is_string {
                emit(&events, generation, LinkEvent::ChannelMessage(text_payload(&msg.data)));
            } else {
                trace!(len = msg.data.len(), "dropping binary data channel message");
            }
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new({
        let events = events.clone();
        move || {
            emit(&events, generation, LinkEvent::ChannelClosed);
            Box::pin(async {})
        }
    }));

    // the accepted channel may already be open by the time we get it
    if dc.ready_state() == RTCDataChannelState::Open {
        emit(events, generation, LinkEvent::ChannelOpen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_is_unordered_and_unreliable() {
        let init = telemetry_channel_init();
        assert_eq!(init.ordered, Some(false));
        assert_eq!(init.max_retransmits, Some(0));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let payload = Bytes::from_static(b"{\"gyro\":\xff}");
        assert!(text_payload(&payload).contains('\u{FFFD}'));
    }
}

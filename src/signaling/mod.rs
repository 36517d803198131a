pub mod client;
pub mod protocol;

pub use client::{connect, NegotiationMessage, SignalingClient, SignalingError, SignalingEvent};
pub use protocol::{Role, SignalMessage};

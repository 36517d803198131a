pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod link;
pub mod state;
pub mod types;

pub use connection::{LinkEvent, LinkTransport, RtcTransportFactory, TransportFactory};
pub use link::{LinkAction, PeerLink, TransportCommand};
pub use state::{LinkState, TransportState, GRACE_PERIOD};
pub use types::{IceCandidate, LinkError, NegotiationRole, SessionDescription};

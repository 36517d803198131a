pub mod calibration;
pub mod config;
pub mod endpoint;
pub mod history;
pub mod logger;
pub mod orientation;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod utils;

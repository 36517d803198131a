//! Calibration handshake as seen by the viewer.
//!
//! Idle -> Requested -> AwaitingResult -> Complete | Failed. Each input
//! returns the effects for the caller to apply, in order.

use crate::orientation::DeviceAngles;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const TIMEOUT_REASON: &str = "calibration timed out";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationState {
    Idle,
    Requested,
    AwaitingResult,
    Complete,
    Failed { reason: String },
}

impl CalibrationState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, CalibrationState::Requested | CalibrationState::AwaitingResult)
    }
}

/// Path the request takes to the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationRoute {
    Telemetry,
    Signaling,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEffect {
    EnterCalibrationMode,
    Send(CalibrationRoute),
    ExitCalibrationMode,
    ClearHistory,
    /// Pose reported by the source at calibration time
    SetReference(DeviceAngles),
}

#[derive(Debug)]
pub struct CalibrationCoordinator {
    state: CalibrationState,
    started_at: Option<Instant>,
    timeout: Duration,
}

impl CalibrationCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: CalibrationState::Idle,
            started_at: None,
            timeout,
        }
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Starts a calibration unless one is already in flight. Besides Idle,
    /// the terminal Complete and Failed states accept a request too: that is
    /// how a user retries after a failure or timeout, since nothing retries
    /// automatically. Such a request starts a fresh calibration.
    pub fn request_calibration(&mut self, now: Instant, channel_open: bool) -> Vec<CalibrationEffect> {
        if self.state.is_in_flight() {
            debug!(state = ?self.state, "calibration already in progress, ignoring request");
            return Vec::new();
        }
        let route = if channel_open {
            CalibrationRoute::Telemetry
        } else {
            CalibrationRoute::Signaling
        };
        info!(?route, "requesting calibration");
        self.state = CalibrationState::Requested;
        self.started_at = Some(now);
        vec![
            CalibrationEffect::EnterCalibrationMode,
            CalibrationEffect::Send(route),
        ]
    }

    /// The request left this endpoint
    pub fn on_request_sent(&mut self) {
        if self.state == CalibrationState::Requested {
            self.state = CalibrationState::AwaitingResult;
        }
    }

    /// The request could not be handed to either path
    pub fn on_send_failed(&mut self, reason: impl Into<String>) -> Vec<CalibrationEffect> {
        if self.state != CalibrationState::Requested {
            return Vec::new();
        }
        self.fail(reason.into())
    }

    pub fn on_complete(&mut self, data: Option<DeviceAngles>) -> Vec<CalibrationEffect> {
        if !self.state.is_in_flight() {
            debug!(state = ?self.state, "calibration result without a request, ignoring");
            return Vec::new();
        }
        info!("calibration complete");
        self.state = CalibrationState::Complete;
        let mut effects = vec![
            CalibrationEffect::ExitCalibrationMode,
            CalibrationEffect::ClearHistory,
        ];
        if let Some(reference) = data {
            effects.push(CalibrationEffect::SetReference(reference));
        }
        effects
    }

    pub fn on_failed(&mut self, reason: impl Into<String>) -> Vec<CalibrationEffect> {
        if !self.state.is_in_flight() {
            return Vec::new();
        }
        self.fail(reason.into())
    }

    pub fn tick(&mut self, now: Instant) -> Vec<CalibrationEffect> {
        if self.state != CalibrationState::AwaitingResult {
            return Vec::new();
        }
        match self.started_at {
            Some(started) if now.saturating_duration_since(started) >= self.timeout => {
                self.fail(TIMEOUT_REASON.to_string())
            }
            _ => Vec::new(),
        }
    }

    fn fail(&mut self, reason: String) -> Vec<CalibrationEffect> {
        warn!(%reason, "calibration failed");
        self.state = CalibrationState::Failed { reason };
        vec![CalibrationEffect::ExitCalibrationMode]
    }
}

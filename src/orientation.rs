//! Orientation math: device angles to quaternions, calibration pose and offsets.

use glam::DQuat;
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_1_SQRT_2;

/// "Flat, screen-up" pose shown while calibrating: -90° about X.
pub const CALIBRATION_POSE: DQuat = DQuat::from_xyzw(-FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2);

/// Orientation angles as reported by the device, in degrees.
/// Any component may be missing when the sensor does not report it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAngles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f64>,
}

impl DeviceAngles {
    pub fn new(alpha: f64, beta: f64, gamma: f64) -> Self {
        Self {
            alpha: Some(alpha),
            beta: Some(beta),
            gamma: Some(gamma),
        }
    }

    pub fn resolve(&self) -> EulerAngles {
        EulerAngles {
            alpha: component(self.alpha),
            beta: component(self.beta),
            gamma: component(self.gamma),
        }
    }
}

/// Acceleration as reported by the device, in g.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAcceleration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl DeviceAcceleration {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            z: Some(z),
        }
    }

    pub fn resolve(&self) -> Acceleration {
        Acceleration {
            x: component(self.x),
            y: component(self.y),
            z: component(self.z),
        }
    }
}

/// Heading (alpha, about Z), pitch (beta, about X) and roll (gamma, about Y) in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EulerAngles {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Acceleration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

fn component(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Converts device angles (degrees) to a unit quaternion, composing Z-X-Y intrinsic.
pub fn to_quaternion(alpha: f64, beta: f64, gamma: f64) -> DQuat {
    let half_z = component(Some(alpha)).to_radians() / 2.0;
    let half_x = component(Some(beta)).to_radians() / 2.0;
    let half_y = component(Some(gamma)).to_radians() / 2.0;

    let (s_z, c_z) = half_z.sin_cos();
    let (s_x, c_x) = half_x.sin_cos();
    let (s_y, c_y) = half_y.sin_cos();

    let w = c_x * c_y * c_z - s_x * s_y * s_z;
    let x = s_x * c_y * c_z - c_x * s_y * s_z;
    let y = c_x * s_y * c_z + s_x * c_y * s_z;
    let z = c_x * c_y * s_z + s_x * s_y * c_z;

    DQuat::from_xyzw(x, y, z, w)
}

pub fn angles_to_quaternion(angles: &EulerAngles) -> DQuat {
    to_quaternion(angles.alpha, angles.beta, angles.gamma)
}

/// Expresses `q` relative to `reference`, so the reference pose reads as identity.
pub fn compose_offset(reference: DQuat, q: DQuat) -> DQuat {
    (reference.conjugate() * q).normalize()
}

/// Latest orientation of the sensor source as seen by the viewer.
#[derive(Debug, Clone)]
pub struct OrientationState {
    raw_angles: EulerAngles,
    quaternion: DQuat,
    calibration_mode: bool,
    reference: DQuat,
}

impl Default for OrientationState {
    fn default() -> Self {
        Self::new()
    }
}

impl OrientationState {
    pub fn new() -> Self {
        Self {
            raw_angles: EulerAngles::default(),
            quaternion: DQuat::IDENTITY,
            calibration_mode: false,
            reference: DQuat::IDENTITY,
        }
    }

    /// Records a new sample and returns the orientation the renderer should show.
    pub fn update(&mut self, angles: EulerAngles) -> DQuat {
        self.raw_angles = angles;
        self.quaternion = angles_to_quaternion(&angles);
        self.observed()
    }

    pub fn raw_angles(&self) -> EulerAngles {
        self.raw_angles
    }

    /// Device quaternion of the latest sample, without calibration applied
    pub fn quaternion(&self) -> DQuat {
        self.quaternion
    }

    pub fn observed(&self) -> DQuat {
        if self.calibration_mode {
            CALIBRATION_POSE
        } else {
            compose_offset(self.reference, self.quaternion)
        }
    }

    pub fn calibration_mode(&self) -> bool {
        self.calibration_mode
    }

    pub fn set_calibration_mode(&mut self, on: bool) {
        self.calibration_mode = on;
    }

    pub fn set_reference(&mut self, angles: EulerAngles) {
        self.reference = angles_to_quaternion(&angles);
    }

    pub fn reference(&self) -> DQuat {
        self.reference
    }
}

use crate::orientation::{DeviceAcceleration, DeviceAngles};
use std::time::Instant;

/// One reading from the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub orientation: DeviceAngles,
    pub acceleration: Option<DeviceAcceleration>,
}

/// Where the source endpoint gets its readings from
pub trait SensorSource: Send {
    fn sample(&mut self) -> Option<SensorSample>;

    /// Captures the current pose as the reference. The returned angles, when
    /// present, travel back to the viewer with the calibration result.
    fn calibrate(&mut self) -> Result<Option<DeviceAngles>, String>;
}

/// Slowly tumbling device, for running the pipeline without hardware
pub struct SimulatedSensor {
    started: Instant,
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    fn angles_at(t: f64) -> DeviceAngles {
        DeviceAngles::new(
            (t * 20.0) % 360.0,
            30.0 * (t * 0.7).sin(),
            15.0 * (t * 1.3).cos(),
        )
    }
}

impl SensorSource for SimulatedSensor {
    fn sample(&mut self) -> Option<SensorSample> {
        let t = self.started.elapsed().as_secs_f64();
        Some(SensorSample {
            orientation: Self::angles_at(t),
            acceleration: Some(DeviceAcceleration::new(
                0.05 * (t * 3.0).sin(),
                0.05 * (t * 2.0).cos(),
                1.0,
            )),
        })
    }

    fn calibrate(&mut self) -> Result<Option<DeviceAngles>, String> {
        Ok(Some(Self::angles_at(self.started.elapsed().as_secs_f64())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_angles_stay_in_device_ranges() {
        for step in 0..1000 {
            let angles = SimulatedSensor::angles_at(step as f64 * 0.05).resolve();
            assert!((0.0..360.0).contains(&angles.alpha));
            assert!(angles.beta.abs() <= 30.0);
            assert!(angles.gamma.abs() <= 15.0);
        }
    }

    #[test]
    fn simulated_sensor_always_reports() {
        let mut sensor = SimulatedSensor::new();
        let sample = sensor.sample().unwrap();
        assert!(sample.acceleration.is_some());
        assert!(sensor.calibrate().unwrap().is_some());
    }
}

use crate::orientation::{Acceleration, EulerAngles};
use std::collections::VecDeque;

/// Samples kept per channel for the live charts
pub const HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    GyroAlpha,
    GyroBeta,
    GyroGamma,
    AccelX,
    AccelY,
    AccelZ,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::GyroAlpha,
        Channel::GyroBeta,
        Channel::GyroGamma,
        Channel::AccelX,
        Channel::AccelY,
        Channel::AccelZ,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Channel::GyroAlpha => "alpha",
            Channel::GyroBeta => "beta",
            Channel::GyroGamma => "gamma",
            Channel::AccelX => "x",
            Channel::AccelY => "y",
            Channel::AccelZ => "z",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Read-only copy of every channel, oldest sample first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySnapshot {
    pub channels: Vec<(Channel, Vec<f64>)>,
}

impl HistorySnapshot {
    pub fn get(&self, channel: Channel) -> &[f64] {
        self.channels
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|(_, samples)| samples.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    capacity: usize,
    channels: [VecDeque<f64>; 6],
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryBuffer {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            channels: std::array::from_fn(|_| VecDeque::with_capacity(capacity + 1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, channel: Channel, sample: f64) {
        let samples = &mut self.channels[channel.index()];
        samples.push_back(sample);
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    /// Push by channel name; names that match no channel are ignored
    pub fn push_named(&mut self, name: &str, sample: f64) {
        if let Some(channel) = Channel::from_name(name) {
            self.push(channel, sample);
        }
    }

    pub fn record_orientation(&mut self, angles: &EulerAngles) {
        self.push(Channel::GyroAlpha, angles.alpha);
        self.push(Channel::GyroBeta, angles.beta);
        self.push(Channel::GyroGamma, angles.gamma);
    }

    pub fn record_acceleration(&mut self, accel: &Acceleration) {
        self.push(Channel::AccelX, accel.x);
        self.push(Channel::AccelY, accel.y);
        self.push(Channel::AccelZ, accel.z);
    }

    pub fn clear(&mut self, channel: Channel) {
        self.channels[channel.index()].clear();
    }

    pub fn clear_all(&mut self) {
        for samples in &mut self.channels {
            samples.clear();
        }
    }

    pub fn len(&self, channel: Channel) -> usize {
        self.channels[channel.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.iter().all(VecDeque::is_empty)
    }

    pub fn snapshot(&self, channel: Channel) -> Vec<f64> {
        self.channels[channel.index()].iter().copied().collect()
    }

    pub fn snapshot_all(&self) -> HistorySnapshot {
        HistorySnapshot {
            channels: Channel::ALL
                .into_iter()
                .map(|c| (c, self.snapshot(c)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_latest_fifty() {
        let mut history = HistoryBuffer::new();
        for v in 1..=51 {
            history.push(Channel::GyroBeta, v as f64);
        }
        let expected: Vec<f64> = (2..=51).map(|v| v as f64).collect();
        assert_eq!(history.snapshot(Channel::GyroBeta), expected);
    }

    #[test]
    fn length_never_exceeds_capacity() {
        let mut history = HistoryBuffer::new();
        for v in 0..500 {
            history.push(Channel::AccelZ, v as f64);
            assert!(history.len(Channel::AccelZ) <= HISTORY_CAPACITY);
        }
        assert_eq!(history.len(Channel::AccelZ), HISTORY_CAPACITY);
        assert_eq!(history.len(Channel::AccelX), 0);
    }

    #[test]
    fn snapshot_does_not_mutate() {
        let mut history = HistoryBuffer::new();
        history.push(Channel::GyroAlpha, 1.0);
        let mut copy = history.snapshot(Channel::GyroAlpha);
        copy.push(99.0);
        assert_eq!(history.snapshot(Channel::GyroAlpha), vec![1.0]);
    }

    #[test]
    fn unknown_names_are_ignored() {
        let mut history = HistoryBuffer::new();
        history.push_named("gamma", 4.0);
        history.push_named("temperature", 21.0);
        assert_eq!(history.snapshot(Channel::GyroGamma), vec![4.0]);
        assert_eq!(
            Channel::ALL.iter().map(|c| history.len(*c)).sum::<usize>(),
            1
        );
    }

    #[test]
    fn clear_all_empties_every_channel() {
        let mut history = HistoryBuffer::new();
        history.record_orientation(&EulerAngles { alpha: 1.0, beta: 2.0, gamma: 3.0 });
        history.record_acceleration(&Acceleration { x: 0.1, y: 0.2, z: 0.9 });
        assert!(!history.is_empty());

        history.clear(Channel::GyroAlpha);
        assert_eq!(history.len(Channel::GyroAlpha), 0);
        assert_eq!(history.len(Channel::GyroBeta), 1);

        history.clear_all();
        assert!(history.is_empty());
        assert!(history.snapshot_all().channels.iter().all(|(_, s)| s.is_empty()));
    }

    #[test]
    fn snapshot_all_lists_channels_in_order() {
        let mut history = HistoryBuffer::new();
        history.record_acceleration(&Acceleration { x: 0.5, y: 0.0, z: 1.0 });
        let snapshot = history.snapshot_all();
        assert_eq!(snapshot.channels.len(), 6);
        assert_eq!(snapshot.channels[3].0, Channel::AccelX);
        assert_eq!(snapshot.get(Channel::AccelZ), &[1.0]);
        assert!(snapshot.get(Channel::GyroAlpha).is_empty());
    }
}
